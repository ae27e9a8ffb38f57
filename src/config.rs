// IMPORTANT:
// Keep ALL numeric values centralized here (repo rule: no hardcoded numeric values scattered around).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod logging {
    pub const LOG_DIR_REL: &str = ".vqa-backend/logs";
    pub const LOG_FILE_NAME: &str = "vqa_backend";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;

    pub const DEFAULT_LOG_SPEC: &str = "info";
}

pub mod server {
    pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5001";
    pub const LIVENESS_TEXT: &str = "VQA Backend Running";

    // Audio clips and phone photos routinely exceed axum's 2 MB default.
    pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;
}

pub mod upload {
    pub const AUDIO_FIELD: &str = "audio";
    pub const IMAGE_FIELD: &str = "image";

    // Used when the client sends no filename or one without an extension
    // (the mobile recorder produces AAC in an MP4 container).
    pub const DEFAULT_AUDIO_EXTENSION: &str = "m4a";

    // Must stay within what the symphonia features in Cargo.toml can demux.
    pub const ALLOWED_AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp4", "aac", "mp3", "wav", "flac", "ogg", "oga"];
}

pub mod embedding {
    pub const EMBEDDING_DIMS: usize = 384;
    pub const EMBEDDING_MODEL_NAME: &str = "all-MiniLM-L6-v2";

    // Max word-piece tokens for all-MiniLM-L6-v2 (model context limit is 256).
    pub const MAX_TOKENS: usize = 256;
}

pub mod tokenizer {
    // Vocabulary used for the input_ids / attention_mask returned by /process-text.
    pub const TOKENIZER_MODEL_NAME: &str = "bert-base-uncased";
}

pub mod speech {
    pub const WHISPER_MODEL_NAME: &str = "whisper-tiny";

    pub const SAMPLE_RATE: u32 = 16_000;
    pub const N_FFT: usize = 400;
    pub const HOP_LENGTH: usize = 160;
    // 30 seconds of audio at HOP_LENGTH.
    pub const N_FRAMES: usize = 3000;

    pub const SOT_TOKEN: &str = "<|startoftranscript|>";
    pub const TRANSCRIBE_TOKEN: &str = "<|transcribe|>";
    pub const NO_TIMESTAMPS_TOKEN: &str = "<|notimestamps|>";
    pub const EOT_TOKEN: &str = "<|endoftext|>";

    // Language tokens look like <|en|>, <|haw|>, <|yue|>.
    pub const LANGUAGE_CODE_MIN_LEN: usize = 2;
    pub const LANGUAGE_CODE_MAX_LEN: usize = 3;

    // Sinc resampler quality (rubato).
    pub const RESAMPLER_SINC_LEN: usize = 256;
    pub const RESAMPLER_F_CUTOFF: f32 = 0.95;
    pub const RESAMPLER_OVERSAMPLING: usize = 256;
}

pub mod vision {
    pub const VISION_MODEL_NAME: &str = "vit-base-patch16-224-in21k";
    pub const FEATURE_DIMS: usize = 768;

    // ViTFeatureExtractor defaults for this checkpoint.
    pub const IMAGE_SIZE: u32 = 224;
    pub const RESCALE_FACTOR: f32 = 1.0 / 255.0;
    pub const IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
    pub const IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];
}

pub mod download {
    pub const HF_BASE: &str = "https://huggingface.co";
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
    pub const MODEL_DIR_REL: &str = ".vqa-backend/models";

    // SHA256 pins (only where we know the published artifact hash).
    pub const MINILM_SAFETENSORS_SHA256: &str =
        "53aa51172d142c89d9012cce15ae4d6cc0ca6895895114379cacb4fab128d9db";
}

pub mod env {
    pub const BIND_ADDR: &str = "VQA_BIND_ADDR";
    pub const MODEL_DIR: &str = "VQA_MODEL_DIR";
    pub const WHISPER_LANGUAGE: &str = "VQA_WHISPER_LANGUAGE";
    pub const MAX_UPLOAD_BYTES: &str = "VQA_MAX_UPLOAD_BYTES";
    pub const LOG_SPEC: &str = "VQA_LOG";
}

/// Runtime settings, read once at startup from `VQA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub model_dir: PathBuf,
    /// Whisper language code (e.g. "en"); `None` means detect per request.
    pub whisper_language: Option<String>,
    pub max_upload_bytes: usize,
    pub log_spec: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_raw = get(env::BIND_ADDR).unwrap_or_else(|| server::DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_raw
            .parse()
            .with_context(|| format!("invalid {}: '{bind_raw}'", env::BIND_ADDR))?;

        let model_dir = match get(env::MODEL_DIR) {
            Some(v) => PathBuf::from(v),
            None => home_dir()?.join(download::MODEL_DIR_REL),
        };

        let whisper_language = match get(env::WHISPER_LANGUAGE) {
            Some(code) => {
                let code = code.to_ascii_lowercase();
                let len_ok = (speech::LANGUAGE_CODE_MIN_LEN..=speech::LANGUAGE_CODE_MAX_LEN).contains(&code.len());
                if !len_ok || !code.chars().all(|c| c.is_ascii_lowercase()) {
                    bail!("invalid {}: '{code}' (expected a language code like 'en')", env::WHISPER_LANGUAGE);
                }
                Some(code)
            }
            None => None,
        };

        let max_upload_bytes = match get(env::MAX_UPLOAD_BYTES) {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("invalid {}: '{v}'", env::MAX_UPLOAD_BYTES))?,
            None => server::DEFAULT_MAX_UPLOAD_BYTES,
        };
        if max_upload_bytes == 0 {
            bail!("{} must be greater than zero", env::MAX_UPLOAD_BYTES);
        }

        let log_spec = get(env::LOG_SPEC).unwrap_or_else(|| logging::DEFAULT_LOG_SPEC.to_string());

        Ok(Self {
            bind_addr,
            model_dir,
            whisper_language,
            max_upload_bytes,
            log_spec,
        })
    }
}

/// Get the user's home directory.
pub fn home_dir() -> anyhow::Result<PathBuf> {
    // Use $HOME on all platforms (macOS, Linux, Windows via MSYS/Git Bash)
    std::env::var("HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var("USERPROFILE").ok().filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .context("cannot determine home directory (neither HOME nor USERPROFILE is set)")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings_with(vars: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings_with(&[(env::MODEL_DIR, "/tmp/models")]).unwrap();
        assert_eq!(s.bind_addr.port(), 5001);
        assert_eq!(s.model_dir, PathBuf::from("/tmp/models"));
        assert_eq!(s.whisper_language, None);
        assert_eq!(s.max_upload_bytes, server::DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(s.log_spec, "info");
    }

    #[test]
    fn test_overrides() {
        let s = settings_with(&[
            (env::MODEL_DIR, "/srv/models"),
            (env::BIND_ADDR, "127.0.0.1:8080"),
            (env::WHISPER_LANGUAGE, "EN"),
            (env::MAX_UPLOAD_BYTES, "1024"),
            (env::LOG_SPEC, "debug"),
        ])
        .unwrap();
        assert_eq!(s.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(s.whisper_language.as_deref(), Some("en"));
        assert_eq!(s.max_upload_bytes, 1024);
        assert_eq!(s.log_spec, "debug");
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let s = settings_with(&[(env::MODEL_DIR, "/m"), (env::BIND_ADDR, "   ")]).unwrap();
        assert_eq!(s.bind_addr.port(), 5001);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(settings_with(&[(env::MODEL_DIR, "/m"), (env::BIND_ADDR, "not-an-addr")]).is_err());
        assert!(settings_with(&[(env::MODEL_DIR, "/m"), (env::MAX_UPLOAD_BYTES, "lots")]).is_err());
        assert!(settings_with(&[(env::MODEL_DIR, "/m"), (env::MAX_UPLOAD_BYTES, "0")]).is_err());
        assert!(settings_with(&[(env::MODEL_DIR, "/m"), (env::WHISPER_LANGUAGE, "english")]).is_err());
        assert!(settings_with(&[(env::MODEL_DIR, "/m"), (env::WHISPER_LANGUAGE, "e1")]).is_err());
    }
}
