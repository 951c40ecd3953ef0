use serde::{Deserialize, Serialize};

// 检测结果的数据结构，HTTP 响应与持久化记录共用

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    /// 对应的 MIME 主类型前缀
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            MediaType::Image => "image/",
            MediaType::Video => "video/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Real,
    Synthetic,
}

impl Label {
    /// 阈值判定，等于阈值算作 synthetic
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            Label::Synthetic
        } else {
            Label::Real
        }
    }
}

/// 单帧分数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub index: u64,
    /// 秒
    pub timestamp: f64,
    pub score: f64,
}

/// 核心链路的最终判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionVerdict {
    pub media_type: MediaType,
    /// 图片为单次打分，视频为各帧均值
    pub score: f64,
    pub label: Label,
    /// 仅视频有
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FrameScore>>,
}
