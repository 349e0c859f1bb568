//! Vision transformer classifier with timm parameter naming
//! (`patch_embed.proj`, `blocks.N.attn.qkv`, `head`, ...), so checkpoints
//! trained with `timm.create_model("vit_tiny_patch16_224")` load unchanged.

use crate::{
    config::DevicePreference,
    error::{ClassifierError, ClassifierResult},
    model_service::Classifier,
    preprocess::InputTensor,
};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{init::Init, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct VitConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_channels: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    pub layer_norm_eps: f64,
    pub num_classes: usize,
}

impl VitConfig {
    /// `vit_tiny_patch16_224`
    pub fn tiny_patch16(image_size: usize, num_classes: usize) -> Self {
        Self {
            image_size,
            patch_size: 16,
            in_channels: 3,
            embed_dim: 192,
            depth: 12,
            num_heads: 3,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            num_classes,
        }
    }

    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

#[derive(Debug)]
struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(
            cfg.in_channels,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        Ok(Self { proj })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // (B, C, H, W) -> (B, N, C)
        self.proj.forward(xs)?.flatten_from(2)?.transpose(1, 2)
    }
}

#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = dim / cfg.num_heads;
        Ok(Self {
            qkv: candle_nn::linear(dim, dim * 3, vb.pp("qkv"))?,
            proj: candle_nn::linear(dim, dim, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            scale: 1. / (head_dim as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let xs = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&xs)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.embed_dim * cfg.mlp_ratio;
        Ok(Self {
            fc1: candle_nn::linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

#[derive(Debug)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head: Linear,
}

impl VisionTransformer {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let init = Init::Randn {
            mean: 0.,
            stdev: 0.02,
        };
        let cls_token = vb.get_with_hints((1, 1, cfg.embed_dim), "cls_token", init)?;
        let pos_embed = vb.get_with_hints(
            (1, cfg.num_patches() + 1, cfg.embed_dim),
            "pos_embed",
            init,
        )?;
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let blocks = (0..cfg.depth)
            .map(|i| Block::new(cfg, vb.pp("blocks").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let norm = candle_nn::layer_norm(cfg.embed_dim, cfg.layer_norm_eps, vb.pp("norm"))?;
        let head = candle_nn::linear(cfg.embed_dim, cfg.num_classes, vb.pp("head"))?;

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            head,
        })
    }
}

impl Module for VisionTransformer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.patch_embed.forward(xs)?;
        let (b, _, c) = xs.dims3()?;
        let cls = self.cls_token.expand((b, 1, c))?;
        let mut xs = Tensor::cat(&[&cls, &xs], 1)?.broadcast_add(&self.pos_embed)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.norm.forward(&xs)?;
        // Class token pooling.
        self.head.forward(&xs.i((.., 0))?)
    }
}

/// Picks the compute device for the candle backend: the first GPU when allowed
/// and present, otherwise the CPU.
pub fn select_device(preference: DevicePreference) -> ClassifierResult<Device> {
    let device = match preference {
        DevicePreference::Auto => Device::cuda_if_available(0)?,
        DevicePreference::Cuda => Device::new_cuda(0).map_err(|e| {
            ClassifierError::Checkpoint(format!("CUDA device requested but unavailable: {}", e))
        })?,
        DevicePreference::Cpu => Device::Cpu,
    };
    Ok(device)
}

pub fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

fn load_error(err: candle_core::Error) -> ClassifierError {
    match err {
        candle_core::Error::WithBacktrace { inner, .. } => load_error(*inner),
        candle_core::Error::CannotFindTensor { path } => ClassifierError::MissingParameter(path),
        err @ candle_core::Error::UnexpectedShape { .. } => {
            ClassifierError::ShapeMismatch(err.to_string())
        }
        err => ClassifierError::Checkpoint(err.to_string()),
    }
}

/// ViT classifier running on candle.
#[derive(Debug)]
pub struct VitClassifier {
    model: VisionTransformer,
    device: Device,
    config: VitConfig,
}

impl VitClassifier {
    /// Builds the network from a bare parameter map and moves it onto `device`.
    pub fn from_state_dict(
        weights: HashMap<String, Tensor>,
        config: &VitConfig,
        device: Device,
    ) -> ClassifierResult<Self> {
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = VisionTransformer::new(config, vb).map_err(load_error)?;
        Ok(Self {
            model,
            device,
            config: config.clone(),
        })
    }
}

impl Classifier for VitClassifier {
    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn device(&self) -> &str {
        device_name(&self.device)
    }

    fn logits(&self, input: &InputTensor) -> ClassifierResult<Vec<f32>> {
        let data = input
            .as_slice()
            .ok_or_else(|| ClassifierError::Inference("input is not contiguous".to_string()))?;
        let xs = Tensor::from_slice(data, input.shape(), &self.device)?;
        // Candle keeps no autograd state for plain tensors.
        let logits = self.model.forward(&xs)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        Ok(logits.to_device(&Device::Cpu)?.to_vec1::<f32>()?)
    }
}
