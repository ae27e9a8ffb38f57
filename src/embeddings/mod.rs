// embeddings/ — Model adapters behind one contract per modality (candle, pure Rust).
//
// Provides:
// - Model download + SHA256 verification
// - BERT sentence embeddings with mean pooling (text)
// - WordPiece tokenization (input_ids / attention_mask)
// - Whisper speech-to-text (audio)
// - ViT classification-token features (image)
//
// Each back-end sits behind a trait so the orchestrator can be exercised with
// fakes; `ModalityEmbedder` owns one of each and maps their failures onto
// `PipelineError`.

pub mod audio;
pub mod download;
pub mod engine;
pub mod speech;
pub mod tokenizer;
pub mod vision;
pub mod vit;

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use image::DynamicImage;

use crate::config::{self, Settings};
use crate::error::PipelineError;
use crate::normalize::NormalizedText;

/// Sentence embedding model: text in, fixed-length vector out.
pub trait TextEmbedder: Send + Sync {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn dims(&self) -> usize;
}

/// Token ids plus attention mask, special tokens included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEncoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

pub trait SubwordTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<TokenEncoding>;
}

/// Raw speech model output. `text` is absent when the model produced nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcription {
    pub text: Option<String>,
    pub language: Option<String>,
}

pub trait SpeechTranscriber: Send + Sync {
    /// `audio_path` carries the upload's extension so the demuxer can be picked.
    fn transcribe(&self, audio_path: &Path) -> anyhow::Result<Transcription>;
}

pub trait ImageEncoder: Send + Sync {
    fn encode(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>>;
    fn dims(&self) -> usize;
}

/// Uniform entry point over the text, speech and vision back-ends.
pub struct ModalityEmbedder {
    text: Box<dyn TextEmbedder>,
    tokenizer: Box<dyn SubwordTokenizer>,
    speech: Box<dyn SpeechTranscriber>,
    vision: Box<dyn ImageEncoder>,
}

impl ModalityEmbedder {
    pub fn new(
        text: Box<dyn TextEmbedder>,
        tokenizer: Box<dyn SubwordTokenizer>,
        speech: Box<dyn SpeechTranscriber>,
        vision: Box<dyn ImageEncoder>,
    ) -> Self {
        Self {
            text,
            tokenizer,
            speech,
            vision,
        }
    }

    pub fn embed_text(&self, text: &NormalizedText) -> Result<Vec<f32>, PipelineError> {
        let embedding = self.text.embed(text.as_str()).map_err(|e| {
            log::error!("Text embedding failed: {:?}", e);
            PipelineError::inference(&e)
        })?;
        if embedding.len() != self.text.dims() {
            return Err(PipelineError::Inference(format!(
                "unexpected embedding dims: got {}, expected {}",
                embedding.len(),
                self.text.dims()
            )));
        }
        Ok(embedding)
    }

    pub fn tokenize(&self, text: &NormalizedText) -> Result<TokenEncoding, PipelineError> {
        self.tokenizer.encode(text.as_str()).map_err(|e| {
            log::error!("Tokenization failed: {:?}", e);
            PipelineError::inference(&e)
        })
    }

    /// Transcribe an uploaded clip. The bytes live in a uniquely named temp
    /// file for the duration of the call; the file is removed on every exit
    /// path when the handle drops.
    pub fn transcribe(&self, audio: &[u8], extension: &str) -> Result<String, PipelineError> {
        let run = || -> anyhow::Result<Transcription> {
            let mut file = tempfile::Builder::new()
                .prefix("vqa-audio-")
                .suffix(&format!(".{extension}"))
                .tempfile()
                .context("create temp audio file")?;
            file.write_all(audio).context("write temp audio file")?;
            file.flush().context("flush temp audio file")?;
            log::debug!("Audio upload staged at {} ({} bytes)", file.path().display(), audio.len());
            self.speech.transcribe(file.path())
        };

        let transcription = run().map_err(|e| {
            log::error!("Transcription failed: {:?}", e);
            PipelineError::transcription(&e)
        })?;
        if let Some(lang) = &transcription.language {
            log::info!("Transcribed audio (language: {})", lang);
        }
        Ok(transcription.text.unwrap_or_default().trim().to_string())
    }

    pub fn extract_image_features(&self, image: &[u8]) -> Result<Vec<f32>, PipelineError> {
        let decoded = image::load_from_memory(image).map_err(|e| {
            log::warn!("Image decode failed: {}", e);
            PipelineError::ImageDecode(format!("cannot decode image: {e}"))
        })?;
        let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());

        let features = self.vision.encode(&rgb).map_err(|e| {
            log::error!("Image feature extraction failed: {:?}", e);
            PipelineError::inference(&e)
        })?;
        if features.len() != self.vision.dims() {
            return Err(PipelineError::Inference(format!(
                "unexpected image feature dims: got {}, expected {}",
                features.len(),
                self.vision.dims()
            )));
        }
        Ok(features)
    }
}

/// Download (if needed) and load every back-end. Called once at startup.
pub fn load_modalities(settings: &Settings) -> anyhow::Result<ModalityEmbedder> {
    let text_dir = download::ensure_bundle(&settings.model_dir, &download::TEXT_EMBEDDER_BUNDLE)?;
    let text = engine::SentenceEmbedder::load(&text_dir).context("load text embedder")?;

    let tokenizer_dir = download::ensure_bundle(&settings.model_dir, &download::TOKENIZER_BUNDLE)?;
    let tokenizer = tokenizer::WordPieceTokenizer::load(&tokenizer_dir).context("load tokenizer")?;

    let whisper_dir = download::ensure_bundle(&settings.model_dir, &download::WHISPER_BUNDLE)?;
    let speech = speech::WhisperTranscriber::load(&whisper_dir, settings.whisper_language.as_deref())
        .context("load speech model")?;

    let vit_dir = download::ensure_bundle(&settings.model_dir, &download::VISION_BUNDLE)?;
    let vision = vision::VitFeatureExtractor::load(&vit_dir).context("load vision model")?;

    log::info!(
        "All models loaded: text={} ({} dims), tokenizer={}, speech={}, vision={} ({} dims)",
        config::embedding::EMBEDDING_MODEL_NAME,
        text.dims(),
        config::tokenizer::TOKENIZER_MODEL_NAME,
        config::speech::WHISPER_MODEL_NAME,
        config::vision::VISION_MODEL_NAME,
        vision.dims(),
    );

    Ok(ModalityEmbedder::new(
        Box::new(text),
        Box::new(tokenizer),
        Box::new(speech),
        Box::new(vision),
    ))
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fakes::*;
    use super::*;
    use crate::normalize::normalize;

    struct SharedTranscriber(Arc<FakeTranscriber>);

    impl SpeechTranscriber for SharedTranscriber {
        fn transcribe(&self, audio_path: &Path) -> anyhow::Result<Transcription> {
            self.0.transcribe(audio_path)
        }
    }

    fn embedder_sharing(speech: Arc<FakeTranscriber>) -> ModalityEmbedder {
        ModalityEmbedder::new(
            Box::new(FakeTextEmbedder { dims: 8 }),
            Box::new(FakeTokenizer),
            Box::new(SharedTranscriber(speech)),
            Box::new(FakeImageEncoder { dims: 6, fail: false }),
        )
    }

    #[test]
    fn test_embed_text_has_constant_dims() {
        let e = embedder_with(FakeTranscriber::returning(None), false);
        for s in ["", "hello", "a much longer sentence with many words in it"] {
            assert_eq!(e.embed_text(&normalize(Some(s))).unwrap().len(), 8);
        }
    }

    #[test]
    fn test_embed_text_rejects_wrong_dims() {
        struct Short;
        impl TextEmbedder for Short {
            fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(vec![0.0; 3])
            }
            fn dims(&self) -> usize {
                4
            }
        }
        let e = ModalityEmbedder::new(
            Box::new(Short),
            Box::new(FakeTokenizer),
            Box::new(FakeTranscriber::returning(None)),
            Box::new(FakeImageEncoder { dims: 6, fail: false }),
        );
        let err = e.embed_text(&normalize(Some("hi"))).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_transcribe_trims_and_cleans_up_temp_file() {
        let speech = Arc::new(FakeTranscriber::returning(Some("  Hello there.  ")));
        let e = embedder_sharing(speech.clone());

        let text = e.transcribe(b"fake-audio", "wav").unwrap();
        assert_eq!(text, "Hello there.");

        let seen = speech.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (path, bytes) = &seen[0];
        assert_eq!(bytes.as_slice(), b"fake-audio");
        assert_eq!(path.extension().and_then(|s| s.to_str()), Some("wav"));
        assert!(!path.exists(), "temp file should be deleted after the call");
    }

    #[test]
    fn test_transcribe_missing_text_defaults_to_empty() {
        let e = embedder_with(FakeTranscriber::returning(None), false);
        assert_eq!(e.transcribe(b"x", "m4a").unwrap(), "");
    }

    #[test]
    fn test_transcribe_failure_carries_message_and_cleans_up() {
        let speech = Arc::new(FakeTranscriber::failing("unsupported codec"));
        let e = embedder_sharing(speech.clone());

        let err = e.transcribe(b"x", "mp3").unwrap_err();
        assert_eq!(err, PipelineError::Transcription("unsupported codec".into()));

        let seen = speech.seen.lock().unwrap();
        assert!(!seen[0].0.exists());
    }

    #[test]
    fn test_concurrent_transcriptions_use_distinct_paths() {
        let speech = Arc::new(FakeTranscriber::returning(Some("ok")));
        let e = Arc::new(embedder_sharing(speech.clone()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let e = e.clone();
                std::thread::spawn(move || e.transcribe(format!("clip-{i}").as_bytes(), "m4a").unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "ok");
        }
        let seen = speech.seen.lock().unwrap();
        let mut paths: Vec<_> = seen.iter().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn test_extract_image_features_decodes_png() {
        let e = embedder_with(FakeTranscriber::returning(None), false);
        let features = e.extract_image_features(&png_bytes(4, 3, [200, 10, 10])).unwrap();
        assert_eq!(features.len(), 6);
        assert_eq!(&features[..3], &[4.0, 3.0, 200.0]);
    }

    #[test]
    fn test_extract_image_features_distinguishes_decode_and_inference_failures() {
        let e = embedder_with(FakeTranscriber::returning(None), false);
        let err = e.extract_image_features(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)), "{err:?}");

        let e = embedder_with(FakeTranscriber::returning(None), true);
        let err = e.extract_image_features(&png_bytes(2, 2, [0, 0, 0])).unwrap_err();
        assert_eq!(err, PipelineError::Inference("vision forward pass failed".into()));
    }
}
