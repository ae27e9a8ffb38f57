// pipeline.rs — Request orchestration: validate → dispatch → normalize → infer.
//
// Transport-agnostic. The HTTP layer turns bodies into a `RawInput`, calls
// `Orchestrator::process` on the blocking pool and serializes the result.

use serde_json::Value;

use crate::config;
use crate::embeddings::ModalityEmbedder;
use crate::error::PipelineError;
use crate::normalize::{normalize, NormalizedText};
use crate::protocol::{ImageResponse, Processed, TextResponse, TranscribeResponse};

/// An uploaded multipart file.
#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// A validated request, one variant per modality.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Text(Option<String>),
    Audio { bytes: Vec<u8>, extension: String },
    Image(Vec<u8>),
}

impl RawInput {
    /// From a parsed `/process-text` body. `None` covers both a missing and
    /// an unparseable body.
    pub fn from_text_payload(payload: Option<&Value>) -> Result<Self, PipelineError> {
        let text = payload
            .and_then(|body| body.get("text"))
            .ok_or_else(|| PipelineError::validation("No text provided"))?;
        match text {
            Value::Null => Ok(Self::Text(None)),
            Value::String(s) => Ok(Self::Text(Some(s.clone()))),
            _ => Err(PipelineError::validation("text must be a string")),
        }
    }

    pub fn from_audio_upload(upload: Option<FileUpload>) -> Result<Self, PipelineError> {
        let upload = upload.ok_or_else(|| PipelineError::validation("No audio file provided"))?;
        let extension = audio_extension(upload.filename.as_deref())?;
        Ok(Self::Audio {
            bytes: upload.bytes,
            extension,
        })
    }

    pub fn from_image_upload(upload: Option<FileUpload>) -> Result<Self, PipelineError> {
        let upload = upload.ok_or_else(|| PipelineError::validation("No image file provided"))?;
        Ok(Self::Image(upload.bytes))
    }

    pub fn modality(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Audio { .. } => "audio",
            Self::Image(_) => "image",
        }
    }
}

/// Lowercased text after the last '.' of the client filename, checked against
/// the allowlist. Missing filename or no dot means the default.
pub fn audio_extension(filename: Option<&str>) -> Result<String, PipelineError> {
    let ext = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| config::upload::DEFAULT_AUDIO_EXTENSION.to_string());

    if !config::upload::ALLOWED_AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return Err(PipelineError::validation(format!(
            "Unsupported audio file extension: {ext}"
        )));
    }
    Ok(ext)
}

pub struct Orchestrator {
    embedder: ModalityEmbedder,
}

impl Orchestrator {
    pub fn new(embedder: ModalityEmbedder) -> Self {
        Self { embedder }
    }

    /// Run one request to completion. Blocking: callers on an async runtime
    /// should use `spawn_blocking`.
    pub fn process(&self, input: RawInput) -> Result<Processed, PipelineError> {
        match input {
            RawInput::Text(text) => self.process_text(text.as_deref()).map(Processed::Text),
            RawInput::Audio { bytes, extension } => self.process_audio(&bytes, &extension).map(Processed::Audio),
            RawInput::Image(bytes) => self.process_image(&bytes).map(Processed::Image),
        }
    }

    fn process_text(&self, text: Option<&str>) -> Result<TextResponse, PipelineError> {
        let preprocessed = normalize(text);
        log::debug!("Normalized text: {} chars", preprocessed.as_str().chars().count());
        let embeddings = self.embedder.embed_text(&preprocessed)?;
        let encoding = self.embedder.tokenize(&preprocessed)?;
        Ok(TextResponse {
            preprocessed_text: preprocessed,
            embeddings,
            input_ids: encoding.input_ids,
            attention_mask: encoding.attention_mask,
        })
    }

    fn process_audio(&self, bytes: &[u8], extension: &str) -> Result<TranscribeResponse, PipelineError> {
        let transcript = self.embedder.transcribe(bytes, extension)?;
        let preprocessed: NormalizedText = normalize(Some(&transcript));
        if preprocessed.is_empty() {
            log::warn!("Transcript is empty after normalization");
        }
        let embeddings = self.embedder.embed_text(&preprocessed)?;
        Ok(TranscribeResponse {
            preprocessed_text: preprocessed,
            embeddings,
        })
    }

    fn process_image(&self, bytes: &[u8]) -> Result<ImageResponse, PipelineError> {
        let image_features = self.embedder.extract_image_features(bytes)?;
        Ok(ImageResponse { image_features })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::embeddings::fakes::*;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(embedder_with(FakeTranscriber::returning(Some("  Wh@t's   UP???  ")), false))
    }

    fn upload(name: Option<&str>, bytes: &[u8]) -> Option<FileUpload> {
        Some(FileUpload {
            filename: name.map(str::to_string),
            bytes: bytes.to_vec(),
        })
    }

    #[test]
    fn test_text_payload_validation() {
        let err = RawInput::from_text_payload(None).unwrap_err();
        assert_eq!(err, PipelineError::validation("No text provided"));

        let err = RawInput::from_text_payload(Some(&json!({"message": "hi"}))).unwrap_err();
        assert_eq!(err, PipelineError::validation("No text provided"));

        let err = RawInput::from_text_payload(Some(&json!(["text"]))).unwrap_err();
        assert_eq!(err, PipelineError::validation("No text provided"));

        let err = RawInput::from_text_payload(Some(&json!({"text": 42}))).unwrap_err();
        assert_eq!(err, PipelineError::validation("text must be a string"));

        assert_eq!(
            RawInput::from_text_payload(Some(&json!({"text": null}))).unwrap(),
            RawInput::Text(None)
        );
        assert_eq!(
            RawInput::from_text_payload(Some(&json!({"text": "hi"}))).unwrap(),
            RawInput::Text(Some("hi".into()))
        );
    }

    #[test]
    fn test_audio_extension_derivation() {
        assert_eq!(audio_extension(Some("clip.M4A")).unwrap(), "m4a");
        assert_eq!(audio_extension(Some("voice.note.wav")).unwrap(), "wav");
        assert_eq!(audio_extension(Some("recording")).unwrap(), "m4a");
        assert_eq!(audio_extension(Some("trailing.")).unwrap(), "m4a");
        assert_eq!(audio_extension(None).unwrap(), "m4a");
    }

    #[test]
    fn test_audio_extension_allowlist() {
        for name in ["a.exe", "a.m4a/../../etc", "a.sh"] {
            let err = audio_extension(Some(name)).unwrap_err();
            assert!(err.is_client_error(), "{name}");
            assert!(err.to_string().starts_with("Unsupported audio file extension: "));
        }
    }

    #[test]
    fn test_missing_uploads_are_validation_errors() {
        assert_eq!(
            RawInput::from_audio_upload(None).unwrap_err(),
            PipelineError::validation("No audio file provided")
        );
        assert_eq!(
            RawInput::from_image_upload(None).unwrap_err(),
            PipelineError::validation("No image file provided")
        );
    }

    #[test]
    fn test_process_text() {
        let input = RawInput::from_text_payload(Some(&json!({"text": "H3ll0 W0rld!!!"}))).unwrap();
        let Processed::Text(resp) = orchestrator().process(input).unwrap() else {
            panic!("expected text response");
        };
        assert_eq!(resp.preprocessed_text.as_str(), "hello world!");
        assert_eq!(resp.embeddings.len(), 8);
        assert_eq!(resp.input_ids, vec![101, 1005, 1006, 102]);
        assert_eq!(resp.attention_mask, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_process_null_text_is_empty() {
        let Processed::Text(resp) = orchestrator().process(RawInput::Text(None)).unwrap() else {
            panic!("expected text response");
        };
        assert_eq!(resp.preprocessed_text.as_str(), "");
        assert_eq!(resp.embeddings.len(), 8);
        assert_eq!(resp.input_ids, vec![101, 102]);
    }

    #[test]
    fn test_process_audio_normalizes_transcript() {
        let input = RawInput::from_audio_upload(upload(Some("q.wav"), b"bytes")).unwrap();
        let Processed::Audio(resp) = orchestrator().process(input).unwrap() else {
            panic!("expected audio response");
        };
        assert_eq!(resp.preprocessed_text.as_str(), "whats up?");
        assert_eq!(resp.embeddings.len(), 8);
    }

    #[test]
    fn test_process_audio_failure_is_server_error() {
        let o = Orchestrator::new(embedder_with(FakeTranscriber::failing("no audio track found"), false));
        let input = RawInput::from_audio_upload(upload(None, b"bytes")).unwrap();
        let err = o.process(input).unwrap_err();
        assert_eq!(err, PipelineError::Transcription("no audio track found".into()));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_process_image() {
        let input = RawInput::from_image_upload(upload(Some("p.png"), &png_bytes(5, 2, [10, 0, 0]))).unwrap();
        assert_eq!(input.modality(), "image");
        let Processed::Image(resp) = orchestrator().process(input).unwrap() else {
            panic!("expected image response");
        };
        assert_eq!(resp.image_features.len(), 6);
        assert_eq!(resp.image_features[0], 5.0);
    }

    #[test]
    fn test_process_image_decode_failure() {
        let err = orchestrator().process(RawInput::Image(b"nope".to_vec())).unwrap_err();
        assert!(matches!(err, PipelineError::ImageDecode(_)));
    }
}
