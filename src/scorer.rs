//! 逻辑回归打分头
//!
//! `probability = sigmoid(dot(features[:k], weights[:k]) + bias)`，
//! 其中 `k = min(len(features), len(weights))`。维度不一致时只取重叠前缀，
//! 不补零也不报错；首次发现不一致时记一条警告。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DetectError, Result};

/// 没有模型时占位权重的维度
pub const FALLBACK_DIM: usize = 512;

/// 占位权重的随机种子，保证跨进程可复现
pub const FALLBACK_SEED: u64 = 42;

/// 权重来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// 从训练产物加载
    Trained,
    /// 固定种子生成的占位权重，分数没有判别意义
    DeterministicFallback,
}

/// 磁盘上的打分头产物 `{"weights": [...], "bias": 0.0}`
#[derive(Debug, Deserialize)]
struct HeadArtifact {
    weights: Vec<f32>,
    #[serde(default)]
    bias: f32,
}

#[derive(Debug, Clone)]
pub struct ScoringParameters {
    pub weights: Vec<f32>,
    pub bias: f32,
    pub provenance: Provenance,
}

impl ScoringParameters {
    pub fn trained(weights: Vec<f32>, bias: f32) -> Self {
        Self {
            weights,
            bias,
            provenance: Provenance::Trained,
        }
    }

    /// 固定种子的标准正态权重，bias 为 0
    pub fn deterministic(dim: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(FALLBACK_SEED);
        let weights = (0..dim).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Self {
            weights,
            bias: 0.0,
            provenance: Provenance::DeterministicFallback,
        }
    }

    /// 产物存在则加载；不存在则按 `native_dim`（无模型时 512）生成占位权重
    ///
    /// 产物存在但无法解析、或含有非有限数值（NaN / 溢出成 inf 的大数）属于配置错误，直接返回错误。
    pub fn load_or_synthesize(path: &Path, native_dim: Option<usize>) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let artifact: HeadArtifact = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("打分头产物无法解析 {}: {}", path.display(), e))?;
            if let Some(i) = artifact.weights.iter().position(|w| !w.is_finite()) {
                anyhow::bail!("打分头产物 {} 的第 {} 个权重不是有限数", path.display(), i);
            }
            if !artifact.bias.is_finite() {
                anyhow::bail!("打分头产物 {} 的 bias 不是有限数", path.display());
            }
            if artifact.weights.is_empty() {
                tracing::warn!(path = %path.display(), "打分头权重为空，分数将只由 bias 决定");
            }
            tracing::info!(path = %path.display(), dim = artifact.weights.len(), "已加载训练好的打分头");
            return Ok(Self::trained(artifact.weights, artifact.bias));
        }

        let dim = native_dim.unwrap_or(FALLBACK_DIM);
        tracing::warn!(dim, "未找到打分头，使用固定种子的占位权重");
        Ok(Self::deterministic(dim))
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }
}

pub fn sigmoid(logit: f64) -> f64 {
    1.0 / (1.0 + (-logit).exp())
}

/// 只读共享的线性打分器
#[derive(Debug)]
pub struct LinearScorer {
    params: ScoringParameters,
    mismatch_reported: AtomicBool,
}

impl LinearScorer {
    pub fn new(params: ScoringParameters) -> Self {
        Self {
            params,
            mismatch_reported: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &ScoringParameters {
        &self.params
    }

    /// 重叠前缀上的点积加 bias
    pub fn logit(&self, features: &[f32]) -> f64 {
        let weights = &self.params.weights;
        if features.len() != weights.len() && !self.mismatch_reported.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                features = features.len(),
                weights = weights.len(),
                "特征维度与打分头不一致，按重叠前缀计算"
            );
        }

        let dot: f64 = features
            .iter()
            .zip(weights.iter())
            .map(|(&f, &w)| f as f64 * w as f64)
            .sum();
        dot + self.params.bias as f64
    }

    /// 概率分数，落在 [0, 1]
    ///
    /// logit 为 NaN（例如特征里混入 NaN）时返回 `Scoring` 错误，不让 NaN 流出。
    /// ±inf 的 logit 经 sigmoid 收敛到 0 或 1，仍是合法分数。
    pub fn score(&self, features: &[f32]) -> Result<f64> {
        let logit = self.logit(features);
        let probability = sigmoid(logit);
        if !(0.0..=1.0).contains(&probability) {
            return Err(DetectError::Scoring(format!("logit 非有限: {}", logit)));
        }
        tracing::trace!(probability, "打分完成");
        Ok(probability)
    }
}
