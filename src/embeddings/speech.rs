// speech.rs — Whisper speech-to-text on candle.
//
// Pipeline per request:
// audio file → 16 kHz mono PCM (audio.rs) → log-mel spectrogram
// → encoder per 30 s segment → greedy decode (no timestamps) → text.
//
// The decoder keeps a cross-attention KV cache inside the model, so the model
// sits behind a mutex and requests are transcribed one at a time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as whisper, audio::pcm_to_mel, model::Whisper};
use tokenizers::Tokenizer;

use crate::config;
use crate::embeddings::{audio, SpeechTranscriber, Transcription};

/// Special token ids resolved from the tokenizer once at load time.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    eot: u32,
    /// Language code ("en") → token id, for every `<|xx|>` token in the vocab.
    languages: HashMap<String, u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> anyhow::Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .with_context(|| format!("tokenizer has no {token} token"))
        };
        let languages = language_tokens(tokenizer.get_vocab(true).into_iter());
        if languages.is_empty() {
            bail!("tokenizer has no language tokens");
        }
        Ok(Self {
            sot: id(config::speech::SOT_TOKEN)?,
            transcribe: id(config::speech::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(config::speech::NO_TIMESTAMPS_TOKEN)?,
            eot: id(config::speech::EOT_TOKEN)?,
            languages,
        })
    }
}

/// Pick out `<|xx|>` / `<|xxx|>` language tokens from a vocabulary.
fn language_tokens(vocab: impl Iterator<Item = (String, u32)>) -> HashMap<String, u32> {
    vocab
        .filter_map(|(token, id)| {
            let code = token.strip_prefix("<|")?.strip_suffix("|>")?;
            let len_ok =
                (config::speech::LANGUAGE_CODE_MIN_LEN..=config::speech::LANGUAGE_CODE_MAX_LEN).contains(&code.len());
            (len_ok && code.chars().all(|c| c.is_ascii_lowercase())).then(|| (code.to_string(), id))
        })
        .collect()
}

pub struct WhisperTranscriber {
    model: Mutex<Whisper>,
    config: whisper::Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    /// Additive logit mask: -inf for suppressed tokens, 0 otherwise.
    suppress_mask: Tensor,
    /// Forced language token; `None` means detect per clip.
    language_token: Option<u32>,
    device: Device,
}

impl WhisperTranscriber {
    /// Load from a directory with model.safetensors, tokenizer.json, config.json.
    pub fn load(model_dir: &Path, language: Option<&str>) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let config_path = model_dir.join("config.json");
        let config_str =
            std::fs::read_to_string(&config_path).with_context(|| format!("read {}", config_path.display()))?;
        let config: whisper::Config =
            serde_json::from_str(&config_str).with_context(|| format!("parse {}", config_path.display()))?;

        log::info!(
            "Loading speech model: d_model={}, encoder_layers={}, decoder_layers={}, mel_bins={}",
            config.d_model,
            config.encoder_layers,
            config.decoder_layers,
            config.num_mel_bins,
        );

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        let language_token = match language {
            Some(code) => Some(
                *tokens
                    .languages
                    .get(code)
                    .with_context(|| format!("speech model does not support language '{code}'"))?,
            ),
            None => None,
        };

        let weights_path = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.clone()], DType::F32, &device)
                .with_context(|| format!("load weights from {}", weights_path.display()))?
        };
        let model = Whisper::load(&vb, config.clone()).context("load Whisper model")?;

        let mel_filters = audio::mel_filters(config::speech::SAMPLE_RATE, config::speech::N_FFT, config.num_mel_bins);

        let mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress_mask = Tensor::new(mask.as_slice(), &device)?;

        log::info!(
            "Speech model loaded ({} language tokens, language={})",
            tokens.languages.len(),
            language.unwrap_or("auto")
        );

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            suppress_mask,
            language_token,
            device,
        })
    }

    fn transcribe_pcm(&self, pcm: &[f32]) -> anyhow::Result<Transcription> {
        if pcm.is_empty() {
            return Ok(Transcription::default());
        }

        let n_mels = self.config.num_mel_bins;
        let mel = pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;
        // pcm_to_mel pads well past the clip; only frames backed by samples are decoded.
        let content_frames = pcm.len() / config::speech::HOP_LENGTH;

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("speech model lock poisoned"))?;

        let mut language = None;
        let mut segments = Vec::new();
        for (seek, segment_len) in segment_schedule(content_frames, n_frames) {
            let segment = mel.narrow(2, seek, segment_len)?;
            let features = model.encoder.forward(&segment, true)?;

            let language_token = match self.language_token.or(language) {
                Some(t) => t,
                None => {
                    let t = self.detect_language(&mut model, &features)?;
                    language = Some(t);
                    t
                }
            };

            let tokens = self.decode_segment(&mut model, &features, language_token)?;
            let text = self
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| anyhow::anyhow!("decode tokens: {e}"))?;
            log::debug!("Segment at frame {}: {} tokens", seek, tokens.len());
            segments.push(text);
        }

        let language_code = self
            .language_token
            .or(language)
            .and_then(|t| self.tokens.languages.iter().find(|(_, id)| **id == t))
            .map(|(code, _)| code.clone());

        Ok(Transcription {
            text: Some(segments.join(" ")),
            language: language_code,
        })
    }

    /// Most likely language token after a lone start-of-transcript.
    fn detect_language(&self, model: &mut Whisper, features: &Tensor) -> anyhow::Result<u32> {
        let input = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&input, features, true)?;
        let logits: Vec<f32> = model.decoder.final_linear(&ys.i((..1, 0..1))?)?.i(0)?.i(0)?.to_vec1()?;

        self.tokens
            .languages
            .values()
            .copied()
            .filter(|&id| (id as usize) < logits.len())
            .max_by(|&a, &b| logits[a as usize].total_cmp(&logits[b as usize]))
            .context("no language token in model vocabulary")
    }

    /// Greedy decode of one segment. Returns tokens including the prompt; the
    /// tokenizer drops special tokens when turning them into text.
    fn decode_segment(&self, model: &mut Whisper, features: &Tensor, language_token: u32) -> anyhow::Result<Vec<u32>> {
        let mut tokens = vec![
            self.tokens.sot,
            language_token,
            self.tokens.transcribe,
            self.tokens.no_timestamps,
        ];
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits: Vec<f32> = logits.broadcast_add(&self.suppress_mask)?.to_vec1()?;

            let next = argmax(&logits).context("empty logits")?;
            tokens.push(next);
            if next == self.tokens.eot || tokens.len() > self.config.max_target_positions {
                break;
            }
        }
        Ok(tokens)
    }
}

/// `(start, len)` mel windows for a clip with `content_frames` real frames
/// inside an `n_frames`-long padded spectrogram. Windows start only on real
/// frames; each one may run into the padding, up to 30 s.
fn segment_schedule(content_frames: usize, n_frames: usize) -> Vec<(usize, usize)> {
    (0..content_frames.min(n_frames))
        .step_by(config::speech::N_FRAMES)
        .map(|seek| (seek, (n_frames - seek).min(config::speech::N_FRAMES)))
        .collect()
}

fn argmax(values: &[f32]) -> Option<u32> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i as u32)
}

impl SpeechTranscriber for WhisperTranscriber {
    fn transcribe(&self, audio_path: &Path) -> anyhow::Result<Transcription> {
        let pcm = audio::load_pcm_mono_16k(audio_path).context("decode audio")?;
        log::info!(
            "Transcribing {:.1}s of audio",
            pcm.len() as f32 / config::speech::SAMPLE_RATE as f32
        );
        self.transcribe_pcm(&pcm).context("speech model")
    }
}
