// vit.rs — ViT encoder (google/vit-base-patch16-224-in21k layout) on candle-nn.
//
// Only the backbone: patch embedding + [CLS] + learned positions, pre-norm
// transformer blocks, final layer norm. The pooler is not loaded; callers take
// row 0 of the final hidden state.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, layer_norm, linear, Activation, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

/// The subset of HF `ViTConfig` the backbone needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VitConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
}

fn default_hidden_size() -> usize {
    768
}

fn default_num_hidden_layers() -> usize {
    12
}

fn default_num_attention_heads() -> usize {
    12
}

fn default_intermediate_size() -> usize {
    3072
}

fn default_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_image_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_num_channels() -> usize {
    3
}

fn default_qkv_bias() -> bool {
    true
}

impl VitConfig {
    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

struct PatchEmbeddings {
    projection: Conv2d,
}

impl PatchEmbeddings {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let projection = conv2d(cfg.num_channels, cfg.hidden_size, cfg.patch_size, conv_cfg, vb.pp("projection"))?;
        Ok(Self { projection })
    }
}

impl Module for PatchEmbeddings {
    // [b, c, h, w] -> [b, num_patches, hidden]
    fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        self.projection.forward(pixels)?.flatten_from(2)?.transpose(1, 2)?.contiguous()
    }
}

struct Embeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_embeddings: PatchEmbeddings,
}

impl Embeddings {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let cls_token = vb.get((1, 1, cfg.hidden_size), "cls_token")?;
        let position_embeddings = vb.get((1, cfg.num_patches() + 1, cfg.hidden_size), "position_embeddings")?;
        let patch_embeddings = PatchEmbeddings::new(cfg, vb.pp("patch_embeddings"))?;
        Ok(Self {
            cls_token,
            position_embeddings,
            patch_embeddings,
        })
    }
}

impl Module for Embeddings {
    fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        let patches = self.patch_embeddings.forward(pixels)?;
        let (b, _, hidden) = patches.dims3()?;
        let cls = self.cls_token.broadcast_as((b, 1, hidden))?.contiguous()?;
        Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.position_embeddings)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let qkv = |name: &str| {
            if cfg.qkv_bias {
                linear(h, h, vb.pp("attention").pp(name))
            } else {
                candle_nn::linear_no_bias(h, h, vb.pp("attention").pp(name))
            }
        };
        Ok(Self {
            query: qkv("query")?,
            key: qkv("key")?,
            value: qkv("value")?,
            output: linear(h, h, vb.pp("output").pp("dense"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: h / cfg.num_attention_heads,
        })
    }

    // [b, n, hidden] -> [b, heads, n, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, n, hidden))?;
        self.output.forward(&context)
    }
}

struct Layer {
    attention: SelfAttention,
    intermediate: Linear,
    output: Linear,
    layernorm_before: LayerNorm,
    layernorm_after: LayerNorm,
    act: Activation,
}

impl Layer {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::new(cfg, vb.pp("attention"))?,
            intermediate: linear(h, cfg.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(cfg.intermediate_size, h, vb.pp("output").pp("dense"))?,
            layernorm_before: layer_norm(h, cfg.layer_norm_eps, vb.pp("layernorm_before"))?,
            layernorm_after: layer_norm(h, cfg.layer_norm_eps, vb.pp("layernorm_after"))?,
            act: cfg.hidden_act,
        })
    }
}

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attention.forward(&self.layernorm_before.forward(xs)?)?)?;
        let mlp = self
            .output
            .forward(&self.act.forward(&self.intermediate.forward(&self.layernorm_after.forward(&xs)?)?)?)?;
        xs + mlp
    }
}

pub struct VitModel {
    embeddings: Embeddings,
    layers: Vec<Layer>,
    layernorm: LayerNorm,
}

impl VitModel {
    /// `vb` must point at the backbone root (keys like `embeddings.cls_token`).
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = Embeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_layers = vb.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| Layer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layernorm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layernorm"))?;
        Ok(Self {
            embeddings,
            layers,
            layernorm,
        })
    }

    /// Final hidden state, [b, 1 + num_patches, hidden].
    pub fn last_hidden_state(&self, pixels: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixels)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.layernorm.forward(&xs)
    }

    /// Classification-token row of the final hidden state, [b, hidden].
    pub fn cls_features(&self, pixels: &Tensor) -> Result<Tensor> {
        self.last_hidden_state(pixels)?.narrow(1, 0, 1)?.squeeze(1)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    use super::*;

    fn tiny_config() -> VitConfig {
        VitConfig {
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            hidden_act: Activation::Gelu,
            layer_norm_eps: 1e-12,
            image_size: 8,
            patch_size: 4,
            num_channels: 3,
            qkv_bias: true,
        }
    }

    #[test]
    fn test_config_defaults_match_base_model() {
        let cfg: VitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.hidden_size, 768);
        assert_eq!(cfg.num_patches(), 196);
        assert_eq!(cfg.hidden_act, Activation::Gelu);
    }

    #[test]
    fn test_hf_config_parses() {
        let cfg: VitConfig = serde_json::from_str(
            r#"{"hidden_size": 768, "hidden_act": "gelu", "layer_norm_eps": 1e-12,
                "image_size": 224, "patch_size": 16, "model_type": "vit"}"#,
        )
        .unwrap();
        assert_eq!(cfg.num_hidden_layers, 12);
        assert!(cfg.qkv_bias);
    }

    #[test]
    fn test_forward_shapes_on_random_weights() {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VitModel::new(&cfg, vb).unwrap();

        let pixels = Tensor::randn(0f32, 1f32, (2, 3, 8, 8), &device).unwrap();
        let hidden = model.last_hidden_state(&pixels).unwrap();
        assert_eq!(hidden.dims(), &[2, 5, 8]);

        let cls = model.cls_features(&pixels).unwrap();
        assert_eq!(cls.dims(), &[2, 8]);
        assert_eq!(cls.dim(D::Minus1).unwrap(), 8);
    }
}
