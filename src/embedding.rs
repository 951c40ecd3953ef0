//! 视觉特征提取
//!
//! 两种策略在初始化时二选一，之后不再切换：
//! - `ClipExtractor`: CLIP 视觉编码器（需启用 `clip` 特性且权重可加载）
//! - `DigestExtractor`: 对原始像素做 SHA256，得到 32 维确定性特征（降级模式）

use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// 当前打分模式，供健康检查与日志使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    Model,
    Degraded,
}

/// 视觉模型的加载参数
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// 架构名，例如 "ViT-B-32"
    pub name: String,
    /// 预训练权重标签，例如 "openai"
    pub pretrained: String,
    /// Hugging Face 仓库
    pub repo: String,
    pub revision: String,
    /// "cpu" | "cuda" | "metal"
    pub device: String,
}

impl ModelSpec {
    /// 模型版本标识 `"{model_name}:{pretrained_tag}"`
    pub fn version(&self) -> String {
        format!("{}:{}", self.name, self.pretrained)
    }

    /// 未显式指定标签时，从仓库名推导：取仓库所有者，例如 `openai/clip-vit-base-patch32` -> `openai`
    pub fn pretrained_tag_for(repo: &str) -> String {
        repo.split('/').next().unwrap_or(repo).to_ascii_lowercase()
    }

    /// 标签必须出现在仓库名中（忽略大小写与 `-` `_` `/`），
    /// 避免健康检查报告的版本与实际加载的权重不符
    pub fn pretrained_matches_repo(&self) -> bool {
        let normalize = |s: &str| -> String {
            s.chars()
                .filter(|c| !matches!(c, '-' | '_' | '/'))
                .flat_map(char::to_lowercase)
                .collect()
        };
        let tag = normalize(&self.pretrained);
        !tag.is_empty() && normalize(&self.repo).contains(&tag)
    }
}

/// 特征提取器
///
/// 实现者只读共享，必须能被多个请求并发调用。
pub trait FeatureExtractor: Send + Sync {
    fn mode(&self) -> ScoringMode;

    /// 输出特征的长度
    fn feature_dim(&self) -> usize;

    /// 模型的原生投影维度；降级模式下没有模型，返回 None
    fn native_dim(&self) -> Option<usize>;

    fn extract(&self, image: &RgbImage) -> Result<Vec<f32>>;
}

/// 原地 L2 归一化。零向量保持不变
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// SHA256 摘要长度，也是降级特征的维度
pub const DIGEST_DIM: usize = 32;

/// 降级模式：像素字节的 SHA256，每个字节转成 [0, 255] 的浮点数
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestExtractor;

impl FeatureExtractor for DigestExtractor {
    fn mode(&self) -> ScoringMode {
        ScoringMode::Degraded
    }

    fn feature_dim(&self) -> usize {
        DIGEST_DIM
    }

    fn native_dim(&self) -> Option<usize> {
        None
    }

    fn extract(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let digest = Sha256::digest(image.as_raw());
        Ok(digest.iter().map(|&b| b as f32).collect())
    }
}

/// 按配置选出提取器。模型不可用时退回降级模式，不视为启动失败
pub fn select_extractor(spec: &ModelSpec) -> Box<dyn FeatureExtractor> {
    #[cfg(feature = "clip")]
    {
        match clip::ClipExtractor::load(spec) {
            Ok(extractor) => {
                tracing::info!(model = %spec.version(), "✅ 视觉编码器加载完成");
                return Box::new(extractor);
            }
            Err(e) => {
                tracing::warn!(model = %spec.version(), error = %e, "视觉编码器不可用，进入降级模式");
            }
        }
    }

    #[cfg(not(feature = "clip"))]
    tracing::warn!(model = %spec.version(), "未启用 clip 特性，进入降级模式");

    Box::new(DigestExtractor)
}

#[cfg(feature = "clip")]
mod clip {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::clip::{ClipConfig, ClipModel};
    use hf_hub::{api::sync::Api, Repo, RepoType};
    use image::{imageops::FilterType, DynamicImage, RgbImage};

    use super::{l2_normalize, FeatureExtractor, ModelSpec, ScoringMode};
    use crate::error::{DetectError, Result};

    const SUPPORTED_ARCH: &str = "ViT-B-32";
    const IMAGE_SIZE: usize = 224;
    const WEIGHTS_FILE: &str = "model.safetensors";

    // CLIP 训练时使用的通道均值 / 标准差
    const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
    const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

    pub struct ClipExtractor {
        model: ClipModel,
        device: Device,
        projection_dim: usize,
    }

    fn select_device(name: &str) -> Device {
        let device = match name {
            "cuda" => Device::new_cuda(0),
            "metal" => Device::new_metal(0),
            _ => return Device::Cpu,
        };
        device.unwrap_or_else(|e| {
            tracing::warn!(device = name, error = %e, "加速设备不可用，使用 CPU");
            Device::Cpu
        })
    }

    impl ClipExtractor {
        pub fn load(spec: &ModelSpec) -> anyhow::Result<Self> {
            if spec.name != SUPPORTED_ARCH {
                anyhow::bail!("不支持的模型架构: {}", spec.name);
            }

            let device = select_device(&spec.device);
            tracing::info!(repo = %spec.repo, ?device, "加载 CLIP 权重");

            let api = Api::new()?;
            let repo = api.repo(Repo::with_revision(
                spec.repo.clone(),
                RepoType::Model,
                spec.revision.clone(),
            ));
            let weights = repo.get(WEIGHTS_FILE)?;

            let config = ClipConfig::vit_base_patch32();
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
            let model = ClipModel::new(vb, &config)?;

            Ok(Self {
                model,
                device,
                projection_dim: config.text_config.projection_dim,
            })
        }

        /// 短边缩放到 224 后中心裁剪，按 CHW 排布并做通道标准化
        fn preprocess(&self, image: &RgbImage) -> candle_core::Result<Tensor> {
            let side = IMAGE_SIZE as u32;
            let resized = DynamicImage::ImageRgb8(image.clone())
                .resize_to_fill(side, side, FilterType::CatmullRom)
                .to_rgb8();

            let plane = IMAGE_SIZE * IMAGE_SIZE;
            let mut data = vec![0f32; 3 * plane];
            for (i, pixel) in resized.pixels().enumerate() {
                for c in 0..3 {
                    data[c * plane + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
                }
            }

            Tensor::from_vec(data, (1, 3, IMAGE_SIZE, IMAGE_SIZE), &self.device)
        }

        fn forward(&self, image: &RgbImage) -> candle_core::Result<Vec<f32>> {
            let input = self.preprocess(image)?;
            let features = self.model.get_image_features(&input)?;
            features.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()
        }
    }

    impl FeatureExtractor for ClipExtractor {
        fn mode(&self) -> ScoringMode {
            ScoringMode::Model
        }

        fn feature_dim(&self) -> usize {
            self.projection_dim
        }

        fn native_dim(&self) -> Option<usize> {
            Some(self.projection_dim)
        }

        fn extract(&self, image: &RgbImage) -> Result<Vec<f32>> {
            let mut features = self
                .forward(image)
                .map_err(|e| DetectError::Embedding(e.to_string()))?;
            l2_normalize(&mut features);
            Ok(features)
        }
    }
}
