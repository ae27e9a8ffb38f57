// engine.rs — all-MiniLM-L6-v2 sentence embeddings on candle.
//
// Same recipe as sentence-transformers: BERT forward, mean over the real
// (mask = 1) token positions, then unit L2 norm.

use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{Tokenizer, TruncationParams};

use crate::config;
use crate::embeddings::TextEmbedder;

pub struct SentenceEmbedder {
    bert: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dims: usize,
}

impl SentenceEmbedder {
    /// Expects config.json, tokenizer.json and model.safetensors in `model_dir`.
    pub fn load(model_dir: &Path) -> anyhow::Result<Self> {
        let device = Device::Cpu;

        let config_path = model_dir.join("config.json");
        let raw = std::fs::read_to_string(&config_path).with_context(|| format!("read {}", config_path.display()))?;
        let bert_config: BertConfig =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;

        log::info!(
            "Loading text embedder: hidden_size={}, layers={}, heads={}",
            bert_config.hidden_size,
            bert_config.num_hidden_layers,
            bert_config.num_attention_heads,
        );

        if bert_config.hidden_size != config::embedding::EMBEDDING_DIMS {
            bail!(
                "{} declares {} hidden units, this service serves {}-dim embeddings",
                config_path.display(),
                bert_config.hidden_size,
                config::embedding::EMBEDDING_DIMS
            );
        }

        let safetensors = model_dir.join("model.safetensors");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[safetensors.clone()], DType::F32, &device)
                .with_context(|| format!("mmap {}", safetensors.display()))?
        };
        let bert = BertModel::load(vb, &bert_config).context("build BERT from weights")?;

        // The published tokenizer.json pads to the batch and truncates at 128;
        // we embed one text at a time and want the model's full 256-token window.
        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| anyhow::anyhow!("load text embedder tokenizer: {e}"))?;
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config::embedding::MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("configure tokenizer truncation: {e}"))?;

        log::info!("Text embedder ready ({} dims)", bert_config.hidden_size);

        Ok(Self {
            bert,
            tokenizer,
            device,
            dims: bert_config.hidden_size,
        })
    }

    /// `[1, seq_len]` id and mask tensors for one text, special tokens included.
    fn encode_inputs(&self, text: &str) -> anyhow::Result<(Tensor, Tensor)> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        let to_row = |values: &[u32]| -> anyhow::Result<Tensor> {
            let widened: Vec<i64> = values.iter().map(|&v| i64::from(v)).collect();
            Ok(Tensor::new(widened.as_slice(), &self.device)?.unsqueeze(0)?)
        };
        Ok((to_row(encoding.get_ids())?, to_row(encoding.get_attention_mask())?))
    }

    /// Empty text is embedded too: the model sees only [CLS] [SEP], which is
    /// what sentence-transformers does for "".
    pub fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let (ids, mask) = self.encode_inputs(text)?;
        let segment_ids = ids.zeros_like()?;

        let hidden = self.bert.forward(&ids, &segment_ids, Some(&mask))?;
        let pooled = masked_mean(&hidden, &mask)?;
        let vector: Vec<f32> = unit_norm(&pooled)?.squeeze(0)?.to_vec1()?;

        if vector.len() != self.dims {
            bail!("text embedder produced {} values, expected {}", vector.len(), self.dims);
        }
        Ok(vector)
    }
}

impl TextEmbedder for SentenceEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        SentenceEmbedder::embed(self, text)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// `[b, n, h]` hidden states averaged over positions where `mask` (`[b, n]`) is 1.
fn masked_mean(hidden: &Tensor, mask: &Tensor) -> anyhow::Result<Tensor> {
    let weights = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
    // An all-zero mask would divide by zero.
    let counts = weights.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok(summed.broadcast_div(&counts)?)
}

/// Rows of a `[b, h]` tensor scaled to unit length.
fn unit_norm(rows: &Tensor) -> anyhow::Result<Tensor> {
    let lengths = rows.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;
    Ok(rows.broadcast_div(&lengths)?)
}
