use anyhow::{bail, Context};
use std::env;
use std::path::PathBuf;

use crate::embedding::ModelSpec;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// 视频上传的暂存目录
    pub media_tmp_dir: PathBuf,
    /// 视频抽帧间隔（秒）
    pub frame_sample_rate: f64,
    /// 请求未指定阈值时使用
    pub default_threshold: f64,
    pub model: ModelSpec,
    /// 训练好的打分头 JSON，可以不存在
    pub head_path: PathBuf,
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = var_or(key, default);
    raw.trim()
        .parse()
        .with_context(|| format!("{} 无法解析: {:?}", key, raw))
}

/// `MODEL_PRETRAINED` 缺省时由 `MODEL_REPO` 推导
fn model_from_env() -> ModelSpec {
    let repo = var_or("MODEL_REPO", "openai/clip-vit-base-patch32");
    let pretrained = env::var("MODEL_PRETRAINED").unwrap_or_else(|_| ModelSpec::pretrained_tag_for(&repo));
    ModelSpec {
        name: var_or("MODEL_NAME", "ViT-B-32"),
        pretrained,
        repo,
        revision: var_or("MODEL_REVISION", "refs/pr/15"),
        device: var_or("DEVICE", "cpu"),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            host: var_or("HOST", "0.0.0.0"),
            port: parse_var("PORT", "8000")?,
            db_path: var_or("DB_PATH", "data/db/detections"),
            media_tmp_dir: PathBuf::from(var_or("MEDIA_TMP_DIR", "/tmp/media")),
            frame_sample_rate: parse_var("FRAME_SAMPLE_RATE", "1.0")?,
            default_threshold: parse_var("DEFAULT_THRESHOLD", "0.5")?,
            model: model_from_env(),
            head_path: PathBuf::from(var_or("HEAD_PATH", "checkpoints/clip_logreg.json")),
            allowed_origins: var_or("ALLOWED_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", "268435456")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.default_threshold) {
            bail!("DEFAULT_THRESHOLD 必须在 [0, 1] 之间: {}", self.default_threshold);
        }
        if !(self.frame_sample_rate.is_finite() && self.frame_sample_rate > 0.0) {
            bail!("FRAME_SAMPLE_RATE 必须为正数: {}", self.frame_sample_rate);
        }
        if !self.model.pretrained_matches_repo() {
            bail!(
                "MODEL_PRETRAINED {:?} 与 MODEL_REPO {:?} 不符",
                self.model.pretrained,
                self.model.repo
            );
        }
        Ok(())
    }

    /// 允许任意来源（`*`）
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }
}
