pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod sampler;
pub mod scorer;
pub mod store;
pub mod verdict;

pub use error::{DetectError, Result};
pub use pipeline::ScoringEngine;

/// 安装全局 tracing 订阅者，`RUST_LOG` 未设置时默认 info
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
