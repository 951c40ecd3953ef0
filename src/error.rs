use thiserror::Error;

/// 检测链路的错误分类
///
/// 维度不匹配不在这里：打分层按重叠前缀截断处理，从不报错。
#[derive(Debug, Error)]
pub enum DetectError {
    /// 媒体资源无法打开或无法解码（整张图片 / 整个视频容器）
    #[error("无法打开媒体: {0}")]
    MediaOpen(String),

    /// 上传内容与声明的媒体类型不符，在任何解码之前拒绝
    #[error("不支持的媒体类型: {0}")]
    UnsupportedMedia(String),

    /// 视频可以打开，但一帧都没有抽到
    #[error("视频中未抽取到任何帧")]
    EmptySample,

    /// 解码中途失败
    #[error("视频解码失败: {0}")]
    Decode(String),

    /// 视觉编码器前向计算失败
    #[error("特征提取失败: {0}")]
    Embedding(String),

    /// 打分结果不是合法概率（logit 为 NaN）
    #[error("打分失败: {0}")]
    Scoring(String),
}

pub type Result<T> = std::result::Result<T, DetectError>;
