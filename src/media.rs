use image::RgbImage;

use crate::error::{DetectError, Result};
use crate::verdict::MediaType;

/// 校验上传声明的 Content-Type 是否属于期望的媒体大类
///
/// 在任何解码之前调用。
pub fn ensure_media_type(content_type: Option<&str>, expected: MediaType) -> Result<()> {
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().starts_with(expected.mime_prefix()) => Ok(()),
        Some(ct) => Err(DetectError::UnsupportedMedia(format!(
            "期望 {}*，实际为 {}",
            expected.mime_prefix(),
            ct
        ))),
        None => Err(DetectError::UnsupportedMedia("缺少 Content-Type".to_string())),
    }
}

/// 从内存字节解码静态图片并转成 RGB
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| DetectError::MediaOpen(format!("无法解析图片: {}", e)))?;
    Ok(img.to_rgb8())
}

/// 从磁盘解码静态图片并转成 RGB
pub fn open_image(path: &std::path::Path) -> Result<RgbImage> {
    let img = image::open(path)
        .map_err(|e| DetectError::MediaOpen(format!("无法解析图片 {}: {}", path.display(), e)))?;
    Ok(img.to_rgb8())
}
