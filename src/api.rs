use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use axum::extract::multipart::{Field, MultipartError};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWriteExt, BufWriter};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::{
    config::Config,
    error::DetectError,
    fingerprint, media,
    pipeline::{EngineStatus, ScoringEngine},
    store::{DetectionRecord, NewDetection, RequestMetadata, ResultStore},
    verdict::MediaType,
};

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 引擎与配置启动后只读；sled 自身线程安全，不需要额外加锁。
pub struct AppState {
    pub engine: Arc<ScoringEngine>,
    pub store: Arc<ResultStore>,
    pub config: Arc<Config>,
}

type ApiError = (StatusCode, String);

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Debug, Deserialize)]
pub struct DetectParams {
    /// 覆盖默认判定阈值
    pub threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub threshold: f64,
    pub frame_sample_rate: f64,
}

/// multipart 中 `file` 字段的头信息
struct UploadInfo {
    filename: Option<String>,
    content_type: Option<String>,
}

impl UploadInfo {
    fn from_field(field: &Field<'_>) -> Self {
        Self {
            filename: field.file_name().map(str::to_string),
            content_type: field.content_type().map(str::to_string),
        }
    }

    fn metadata(&self) -> RequestMetadata {
        RequestMetadata {
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            extras: Default::default(),
        }
    }
}

/// 图片上传，整体留在内存里解码
struct Upload {
    info: UploadInfo,
    bytes: Bytes,
}

/// 视频上传，已经落盘到暂存文件；文件随结构体 drop 删除
struct SpooledUpload {
    info: UploadInfo,
    file: NamedTempFile,
    media_hash: String,
    size: u64,
}

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

// ==========================================
// 3. 路由
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    let cors = if state.config.allows_any_origin() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/detect/image", post(detect_image))
        .route("/detect/video", post(detect_video))
        .route("/detections", get(list_detections))
        .route("/detections/{id}", get(get_detection))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

// ==========================================
// 4. 错误映射
// ==========================================

fn reject(e: DetectError) -> ApiError {
    let status = match &e {
        DetectError::UnsupportedMedia(_) | DetectError::MediaOpen(_) => StatusCode::BAD_REQUEST,
        DetectError::EmptySample => StatusCode::UNPROCESSABLE_ENTITY,
        DetectError::Decode(_) | DetectError::Embedding(_) | DetectError::Scoring(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    tracing::warn!(%status, error = %e, "检测请求被拒绝");
    (status, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "内部错误");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn resolve_threshold(params: &DetectParams, config: &Config) -> Result<f64, ApiError> {
    let threshold = params.threshold.unwrap_or(config.default_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("threshold 必须在 [0, 1] 之间: {}", threshold),
        ));
    }
    Ok(threshold)
}

fn multipart_error(e: MultipartError) -> ApiError {
    (e.status(), e.body_text())
}

fn missing_file_field() -> ApiError {
    (StatusCode::BAD_REQUEST, "缺少 file 字段".to_string())
}

/// 是否是上传文件字段；是的话先校验声明的媒体类型，在读取内容之前拒绝类型不符的上传
fn accept_file_field(field: &Field<'_>, expected: MediaType) -> Result<bool, ApiError> {
    if field.name() != Some("file") {
        return Ok(false);
    }
    media::ensure_media_type(field.content_type(), expected).map_err(reject)?;
    Ok(true)
}

async fn read_image_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if !accept_file_field(&field, MediaType::Image)? {
            continue;
        }
        let info = UploadInfo::from_field(&field);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(Upload { info, bytes });
    }
    Err(missing_file_field())
}

/// 视频上传：按块写入 `scratch_dir` 下的临时文件，同时计算 SHA256，不在内存里攒整个文件
async fn spool_video_upload(mut multipart: Multipart, scratch_dir: &FsPath) -> Result<SpooledUpload, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if !accept_file_field(&field, MediaType::Video)? {
            continue;
        }
        let info = UploadInfo::from_field(&field);

        let scratch = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(scratch_dir)
            .map_err(internal)?;
        let handle = scratch.as_file().try_clone().map_err(internal)?;
        let mut writer = BufWriter::with_capacity(fingerprint::CHUNK_SIZE, tokio::fs::File::from_std(handle));
        let mut hash = fingerprint::StreamingHash::new();

        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            hash.update(&chunk);
            writer.write_all(&chunk).await.map_err(internal)?;
        }
        writer.flush().await.map_err(internal)?;

        let size = hash.len();
        return Ok(SpooledUpload {
            info,
            file: scratch,
            media_hash: hash.finalize(),
            size,
        });
    }
    Err(missing_file_field())
}

/// CPU / 阻塞 IO 密集的部分放到 blocking 线程池
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| internal(format!("Task join error: {}", e)))?
}

// ==========================================
// 5. 处理函数 (Handlers)
// ==========================================

/// 接口：图片检测
async fn detect_image(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DetectParams>,
    multipart: Multipart,
) -> Result<Json<DetectionRecord>, ApiError> {
    let threshold = resolve_threshold(&params, &state.config)?;
    let upload = read_image_upload(multipart).await?;

    tracing::info!(filename = ?upload.info.filename, size = upload.bytes.len(), threshold, "📥 收到图片检测请求");

    let record = run_blocking(move || {
        let image = media::decode_image(&upload.bytes).map_err(reject)?;
        let verdict = state.engine.detect_image(&image, threshold).map_err(reject)?;
        state
            .store
            .insert(NewDetection {
                verdict,
                media_hash: fingerprint::hash_bytes(&upload.bytes),
                threshold,
                model_name: state.engine.model_name().to_string(),
                model_version: state.engine.model_version().to_string(),
                metadata: upload.info.metadata(),
            })
            .map_err(internal)
    })
    .await?;

    Ok(Json(record))
}

/// 接口：视频检测
///
/// 上传先落到暂存目录的临时文件，函数返回（含出错）时文件随之删除。
async fn detect_video(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DetectParams>,
    multipart: Multipart,
) -> Result<Json<DetectionRecord>, ApiError> {
    let threshold = resolve_threshold(&params, &state.config)?;
    let upload = spool_video_upload(multipart, &state.config.media_tmp_dir).await?;

    tracing::info!(filename = ?upload.info.filename, size = upload.size, threshold, "📥 收到视频检测请求");

    let record = run_blocking(move || {
        let verdict = state
            .engine
            .detect_video(upload.file.path(), state.config.frame_sample_rate, threshold)
            .map_err(reject)?;

        state
            .store
            .insert(NewDetection {
                verdict,
                media_hash: upload.media_hash.clone(),
                threshold,
                model_name: state.engine.model_name().to_string(),
                model_version: state.engine.model_version().to_string(),
                metadata: upload.info.metadata(),
            })
            .map_err(internal)
    })
    .await?;

    Ok(Json(record))
}

/// 接口：按 id 查询检测记录
async fn get_detection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<DetectionRecord>, ApiError> {
    let found = run_blocking(move || state.store.get(id).map_err(internal)).await?;
    found
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("记录不存在: {}", id)))
}

/// 接口：最近的检测记录
async fn list_detections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DetectionRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let records = run_blocking(move || state.store.recent(limit).map_err(internal)).await?;
    Ok(Json(records))
}

/// 接口：健康检查
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.engine.status(),
        threshold: state.config.default_threshold,
        frame_sample_rate: state.config.frame_sample_rate,
    })
}
