// vision.rs — Image → ViT classification-token features.
//
// Preprocessing follows the published ViTImageProcessor for
// vit-base-patch16-224-in21k: RGB, bilinear resize to 224x224, rescale to
// [0, 1], normalize with mean 0.5 / std 0.5, channels first.

use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::config;
use crate::embeddings::download;
use crate::embeddings::vit::{VitConfig, VitModel};
use crate::embeddings::ImageEncoder;

pub struct VitFeatureExtractor {
    model: VitModel,
    config: VitConfig,
    device: Device,
}

impl VitFeatureExtractor {
    /// Load from a directory with config.json and model.safetensors
    /// (or pytorch_model.bin when only the pickle is published).
    pub fn load(model_dir: &Path) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let config_path = model_dir.join("config.json");
        let config_str =
            std::fs::read_to_string(&config_path).with_context(|| format!("read {}", config_path.display()))?;
        let config: VitConfig =
            serde_json::from_str(&config_str).with_context(|| format!("parse {}", config_path.display()))?;

        log::info!(
            "Loading vision model: hidden_size={}, layers={}, heads={}, image_size={}, patch_size={}",
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.image_size,
            config.patch_size,
        );

        if config.hidden_size != config::vision::FEATURE_DIMS {
            bail!(
                "{} has hidden_size {}, expected {}",
                config_path.display(),
                config.hidden_size,
                config::vision::FEATURE_DIMS
            );
        }
        if config.image_size != config::vision::IMAGE_SIZE as usize {
            bail!(
                "{} has image_size {}, expected {}",
                config_path.display(),
                config.image_size,
                config::vision::IMAGE_SIZE
            );
        }

        let weights_file = download::VISION_BUNDLE
            .files
            .iter()
            .find(|f| f.name == "model.safetensors")
            .and_then(|f| download::existing_file(model_dir, f))
            .with_context(|| format!("no ViT weights in {}", model_dir.display()))?;

        let vb = if weights_file.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights_file.clone()], DType::F32, &device)
                    .with_context(|| format!("load weights from {}", weights_file.display()))?
            }
        } else {
            VarBuilder::from_pth(&weights_file, DType::F32, &device)
                .with_context(|| format!("load weights from {}", weights_file.display()))?
        };

        // Checkpoints saved from ViTModel have bare keys; ViTFor* heads nest
        // the backbone under "vit.".
        let vb = if vb.contains_tensor("vit.embeddings.cls_token") {
            vb.pp("vit")
        } else {
            vb
        };

        let model = VitModel::new(&config, vb).context("load ViT model")?;

        log::info!("Vision model loaded successfully (dims={})", config.hidden_size);

        Ok(Self { model, config, device })
    }
}

/// `[1, 3, size, size]` pixel tensor, normalized per channel.
pub fn preprocess(image: &DynamicImage, size: u32, device: &Device) -> anyhow::Result<Tensor> {
    let rgb = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let (w, h) = (size as usize, size as usize);

    let mut data = vec![0f32; 3 * h * w];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 * config::vision::RESCALE_FACTOR;
            data[c * h * w + y as usize * w + x as usize] =
                (v - config::vision::IMAGE_MEAN[c]) / config::vision::IMAGE_STD[c];
        }
    }

    Ok(Tensor::from_vec(data, (3, h, w), device)?.unsqueeze(0)?)
}

impl ImageEncoder for VitFeatureExtractor {
    fn encode(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        let pixels = preprocess(image, self.config.image_size as u32, &self.device)?;
        let features: Vec<f32> = self.model.cls_features(&pixels)?.squeeze(0)?.to_vec1()?;
        log::debug!("Extracted {} image features", features.len());
        Ok(features)
    }

    fn dims(&self) -> usize {
        self.config.hidden_size
    }
}
