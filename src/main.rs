use jianwei_core::{api, config::Config, store::ResultStore, ScoringEngine};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jianwei_core::init_tracing();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path,
        head = %config.head_path.display(),
        "⚙️  配置加载完成"
    );
    std::fs::create_dir_all(&config.media_tmp_dir)?;

    // ----------------------------------------------------------------
    // 1. 打分引擎：只在这里初始化一次，之后只读共享
    // ----------------------------------------------------------------
    tracing::info!("🛡️ [鉴伪 Jianwei] 媒体真伪检测服务启动中...");
    let spec = config.model.clone();
    let head_path = config.head_path.clone();
    // 模型加载可能下载权重，放到 blocking 线程
    let engine = tokio::task::spawn_blocking(move || ScoringEngine::initialize(&spec, &head_path)).await??;

    // ----------------------------------------------------------------
    // 2. 结果库
    // ----------------------------------------------------------------
    let store = ResultStore::open(&config.db_path)?;
    tracing::info!(records = store.len(), "📚 检测结果库就绪");

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let addr = format!("{}:{}", config.host, config.port);
    let shared_state = Arc::new(api::AppState {
        engine: Arc::new(engine),
        store: Arc::new(store),
        config: Arc::new(config),
    });
    let app = api::app(shared_state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🚀 API 服务已运行在: http://{}", addr);
    tracing::info!("   - POST /detect/image   : 图片真伪检测");
    tracing::info!("   - POST /detect/video   : 视频逐帧检测");
    tracing::info!("   - GET  /detections/{{id}} : 查询检测记录");
    tracing::info!("   - GET  /health         : 引擎状态");

    axum::serve(listener, app).await?;

    Ok(())
}
