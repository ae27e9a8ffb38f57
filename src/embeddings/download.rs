// download.rs — Model file download with SHA256 verification.
//
// Downloads model bundles from the Hugging Face hub on first use, caches locally
// at ~/.vqa-backend/models/<bundle>/. Files with a pinned SHA256 are verified;
// the rest have their digest logged so a pin can be added later.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::config;

/// One file of a bundle. `fallback` is tried when the primary name is not
/// published for that repo (older checkpoints only ship pytorch weights).
#[derive(Debug, Clone, Copy)]
pub struct ModelFile {
    pub name: &'static str,
    pub sha256: Option<&'static str>,
    pub fallback: Option<&'static str>,
}

impl ModelFile {
    const fn plain(name: &'static str) -> Self {
        Self {
            name,
            sha256: None,
            fallback: None,
        }
    }
}

/// A Hugging Face repo and the files we need from it.
#[derive(Debug, Clone, Copy)]
pub struct ModelBundle {
    pub repo: &'static str,
    pub local_dir: &'static str,
    pub files: &'static [ModelFile],
}

pub const TEXT_EMBEDDER_BUNDLE: ModelBundle = ModelBundle {
    repo: "sentence-transformers/all-MiniLM-L6-v2",
    local_dir: config::embedding::EMBEDDING_MODEL_NAME,
    files: &[
        ModelFile {
            name: "model.safetensors",
            sha256: Some(config::download::MINILM_SAFETENSORS_SHA256),
            fallback: None,
        },
        ModelFile::plain("tokenizer.json"),
        ModelFile::plain("config.json"),
    ],
};

pub const TOKENIZER_BUNDLE: ModelBundle = ModelBundle {
    repo: "google-bert/bert-base-uncased",
    local_dir: config::tokenizer::TOKENIZER_MODEL_NAME,
    files: &[ModelFile::plain("tokenizer.json")],
};

pub const WHISPER_BUNDLE: ModelBundle = ModelBundle {
    repo: "openai/whisper-tiny",
    local_dir: config::speech::WHISPER_MODEL_NAME,
    files: &[
        ModelFile::plain("model.safetensors"),
        ModelFile::plain("tokenizer.json"),
        ModelFile::plain("config.json"),
    ],
};

pub const VISION_BUNDLE: ModelBundle = ModelBundle {
    repo: "google/vit-base-patch16-224-in21k",
    local_dir: config::vision::VISION_MODEL_NAME,
    files: &[
        ModelFile {
            name: "model.safetensors",
            sha256: None,
            fallback: Some("pytorch_model.bin"),
        },
        ModelFile::plain("config.json"),
    ],
};

impl ModelBundle {
    pub fn dir(&self, model_root: &Path) -> PathBuf {
        model_root.join(self.local_dir)
    }

    pub fn file_url(&self, file_name: &str) -> String {
        format!("{}/{}/resolve/main/{}", config::download::HF_BASE, self.repo, file_name)
    }
}

/// The local file satisfying `file`, if either its primary or fallback name exists.
pub fn existing_file(dir: &Path, file: &ModelFile) -> Option<PathBuf> {
    std::iter::once(file.name)
        .chain(file.fallback)
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Check if all required files of a bundle exist locally.
pub fn bundle_files_exist(dir: &Path, bundle: &ModelBundle) -> bool {
    bundle.files.iter().all(|f| existing_file(dir, f).is_some())
}

/// Download all bundle files if not already cached. Returns the bundle directory.
pub fn ensure_bundle(model_root: &Path, bundle: &ModelBundle) -> anyhow::Result<PathBuf> {
    let dir = bundle.dir(model_root);

    if bundle_files_exist(&dir, bundle) {
        log::info!("Model files for {} already cached at {}", bundle.repo, dir.display());
        return Ok(dir);
    }

    log::info!("Downloading {} to {}", bundle.repo, dir.display());
    fs::create_dir_all(&dir).with_context(|| format!("failed to create model dir {}", dir.display()))?;

    for file in bundle.files {
        if existing_file(&dir, file).is_some() {
            continue;
        }
        download_model_file(bundle, file, &dir)?;
    }

    log::info!("Download of {} complete", bundle.repo);
    Ok(dir)
}

fn download_model_file(bundle: &ModelBundle, file: &ModelFile, dir: &Path) -> anyhow::Result<()> {
    let url = bundle.file_url(file.name);
    if let Some(body) = fetch(&url)? {
        return verify_and_write(&body, &dir.join(file.name), file.sha256);
    }

    let Some(fallback) = file.fallback else {
        bail!("{url} not found (HTTP 404)");
    };
    log::warn!("{} not published for {}, trying {}", file.name, bundle.repo, fallback);
    let url = bundle.file_url(fallback);
    match fetch(&url)? {
        Some(body) => verify_and_write(&body, &dir.join(fallback), None),
        None => bail!("neither {} nor {} is published for {}", file.name, fallback, bundle.repo),
    }
}

/// GET a URL into memory. `Ok(None)` means the server answered 404.
fn fetch(url: &str) -> anyhow::Result<Option<Vec<u8>>> {
    log::info!("Downloading {}", url);

    let resp = match ureq::get(url)
        .timeout(std::time::Duration::from_secs(config::download::DOWNLOAD_TIMEOUT_SECS))
        .call()
    {
        Ok(resp) => resp,
        Err(ureq::Error::Status(404, _)) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to download {url}")),
    };

    let status = resp.status();
    if status != 200 {
        bail!("HTTP {status} downloading {url}");
    }

    // Largest file is the ViT checkpoint (~350 MB); fits in RAM.
    let mut body = Vec::new();
    resp.into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response body for {url}"))?;
    Ok(Some(body))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Verify an optional SHA256 pin, then write atomically (.tmp, then rename).
pub fn verify_and_write(body: &[u8], dest: &Path, expected_sha256: Option<&str>) -> anyhow::Result<()> {
    let filename = dest.file_name().unwrap_or_default().to_string_lossy();
    let actual_hash = sha256_hex(body);

    match expected_sha256 {
        Some(expected) if expected != actual_hash => {
            bail!("SHA256 mismatch for {}: expected {}, got {}", filename, expected, actual_hash);
        }
        Some(_) => log::info!("SHA256 verified for {} ({})", filename, &actual_hash[..12]),
        None => log::info!("SHA256 of {} is {} (not pinned)", filename, actual_hash),
    }

    let tmp_path = dest.with_extension("tmp");
    let mut file =
        fs::File::create(&tmp_path).with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(body)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;

    Ok(())
}
