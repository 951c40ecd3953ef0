use image::RgbImage;
use serde::Deserialize;
use std::ffi::OsString;
use std::io::Read;
use std::iter::FusedIterator;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::error::{DetectError, Result};

/// 容器报告不出帧率时使用的名义帧率
pub const FALLBACK_FPS: f64 = 30.0;

/// 单帧像素上限（DCI 8K），超出的视频在打开阶段拒绝
pub const MAX_FRAME_PIXELS: u64 = 8192 * 4320;

/// 按固定时间间隔抽出的一帧
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// 抽样序号，只在抽中时递增，被跳过的原始帧不可见
    pub index: u64,
    /// 距视频开头的秒数
    pub timestamp: f64,
    pub image: RgbImage,
}

/// 视频解码器接缝
///
/// 解码资源的生命周期与实现者绑定：drop 即释放。
pub trait VideoDecoder {
    /// 容器报告的帧率。`None` 或非正数表示不可用
    fn frame_rate(&self) -> Option<f64>;

    /// 按解码顺序读取下一帧，`Ok(None)` 表示流结束
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// 跳过一帧，不需要构造图像。返回 `false` 表示流结束
    fn skip_frame(&mut self) -> Result<bool> {
        Ok(self.next_frame()?.is_some())
    }
}

/// 每隔多少原始帧抽一帧：`max(round(fps * sample_rate), 1)`
pub fn interval_frames(fps: f64, sample_rate_secs: f64) -> u64 {
    let frames = (fps * sample_rate_secs).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as u64
    } else {
        1
    }
}

/// 惰性抽帧器
///
/// 每个实例只能遍历一次。正常结束、出错、或调用方提前 drop 时，
/// 底层解码器都会被释放。
pub struct FrameSampler<D: VideoDecoder> {
    decoder: Option<D>,
    fps: f64,
    interval: u64,
    raw_ordinal: u64,
    sampled: u64,
}

impl FrameSampler<FfmpegDecoder> {
    /// 打开本地视频文件并按 `sample_rate_secs` 秒的间隔抽帧
    pub fn open(path: &Path, sample_rate_secs: f64) -> Result<Self> {
        let decoder = FfmpegDecoder::open(path)?;
        Ok(Self::new(decoder, sample_rate_secs))
    }
}

impl<D: VideoDecoder> FrameSampler<D> {
    pub fn new(decoder: D, sample_rate_secs: f64) -> Self {
        let fps = match decoder.frame_rate() {
            Some(fps) if fps.is_finite() && fps > 0.0 => fps,
            reported => {
                tracing::warn!(?reported, "帧率不可用，按 {} fps 抽帧", FALLBACK_FPS);
                FALLBACK_FPS
            }
        };
        let interval = interval_frames(fps, sample_rate_secs);
        tracing::debug!(fps, interval, "抽帧器就绪");

        Self {
            decoder: Some(decoder),
            fps,
            interval,
            raw_ordinal: 0,
            sampled: 0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn interval_frames(&self) -> u64 {
        self.interval
    }

    fn release(&mut self) {
        self.decoder = None;
    }

    fn finish(&mut self) -> Option<Result<SampledFrame>> {
        tracing::debug!(raw = self.raw_ordinal, sampled = self.sampled, "视频流结束");
        self.release();
        None
    }
}

impl<D: VideoDecoder> Iterator for FrameSampler<D> {
    type Item = Result<SampledFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let decoder = self.decoder.as_mut()?;
            let ordinal = self.raw_ordinal;

            if ordinal % self.interval != 0 {
                match decoder.skip_frame() {
                    Ok(true) => {
                        self.raw_ordinal += 1;
                        continue;
                    }
                    Ok(false) => return self.finish(),
                    Err(e) => {
                        self.release();
                        return Some(Err(e));
                    }
                }
            }

            match decoder.next_frame() {
                Ok(Some(image)) => {
                    self.raw_ordinal += 1;
                    let frame = SampledFrame {
                        index: self.sampled,
                        timestamp: ordinal as f64 / self.fps,
                        image,
                    };
                    self.sampled += 1;
                    return Some(Ok(frame));
                }
                Ok(None) => return self.finish(),
                Err(e) => {
                    self.release();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<D: VideoDecoder> FusedIterator for FrameSampler<D> {}

// ==========================================
// ffmpeg 解码后端
// ==========================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// 解析 ffprobe 的分数帧率，例如 "30000/1001"。"0/0" 返回 None
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = match raw.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (raw.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 {
        return None;
    }
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// 校验 ffprobe 报告的编码尺寸，拒绝缺失、为零或超过上限的尺寸
fn frame_geometry(stream: &ProbeStream) -> std::result::Result<(u32, u32), String> {
    match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {
            if w as u64 * h as u64 > MAX_FRAME_PIXELS {
                Err(format!("视频尺寸过大 {}x{}", w, h))
            } else {
                Ok((w, h))
            }
        }
        _ => Err("视频流缺少有效尺寸".to_string()),
    }
}

/// ffmpeg 解码命令行参数
///
/// 只解码第一条视频流（与 ffprobe `v:0` 一致），并关闭自动旋转，
/// 输出帧尺寸因此始终等于 ffprobe 报告的编码尺寸。
fn ffmpeg_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args.extend(
        [
            "-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-vsync", "passthrough", "pipe:1",
        ]
        .into_iter()
        .map(OsString::from),
    );
    args
}

/// 通过 ffmpeg 子进程解码：stdout 输出连续的 rgb24 原始帧
///
/// drop 时杀掉并回收子进程。
pub struct FfmpegDecoder {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_rate: Option<f64>,
    /// 跳帧时复用的缓冲区
    scratch: Vec<u8>,
}

impl FfmpegDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(DetectError::MediaOpen(format!("文件不存在: {}", path.display())));
        }

        let probe = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate,avg_frame_rate",
                "-of",
                "json",
            ])
            .arg(path)
            .output()
            .map_err(|e| DetectError::MediaOpen(format!("ffprobe 不可用: {}", e)))?;

        if !probe.status.success() {
            let stderr = String::from_utf8_lossy(&probe.stderr);
            return Err(DetectError::MediaOpen(format!(
                "ffprobe 无法解析 {}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        let parsed: ProbeOutput = serde_json::from_slice(&probe.stdout)
            .map_err(|e| DetectError::MediaOpen(format!("ffprobe 输出无法解析: {}", e)))?;
        let stream = parsed
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| DetectError::MediaOpen(format!("未找到视频流: {}", path.display())))?;

        let (width, height) = frame_geometry(&stream)
            .map_err(|reason| DetectError::MediaOpen(format!("{}: {}", reason, path.display())))?;

        let frame_rate = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

        let mut child = Command::new("ffmpeg")
            .args(ffmpeg_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DetectError::MediaOpen(format!("ffmpeg 不可用: {}", e)))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DetectError::MediaOpen("ffmpeg stdout 不可读".to_string()));
            }
        };

        tracing::debug!(path = %path.display(), width, height, ?frame_rate, "视频已打开");

        Ok(Self {
            child,
            stdout,
            width,
            height,
            frame_rate,
            scratch: Vec::new(),
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// 读满 `buf` 或读到 EOF，返回实际读到的字节数
fn read_frame(stdout: &mut ChildStdout, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stdout.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DetectError::Decode(e.to_string())),
        }
    }
    Ok(filled)
}

/// 整帧为 true，空读为 false；尾部残帧按流结束处理
fn complete_frame(filled: usize, expected: usize) -> bool {
    if filled > 0 && filled < expected {
        tracing::warn!(filled, expected, "丢弃不完整的尾帧");
    }
    filled == expected
}

impl VideoDecoder for FfmpegDecoder {
    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.frame_len()];
        let filled = read_frame(&mut self.stdout, &mut buf)?;
        if !complete_frame(filled, buf.len()) {
            return Ok(None);
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| DetectError::Decode("帧尺寸与缓冲区不符".to_string()))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        let len = self.frame_len();
        self.scratch.resize(len, 0);
        let filled = read_frame(&mut self.stdout, &mut self.scratch)?;
        Ok(complete_frame(filled, len))
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// 内存解码器：产出 `total` 帧纯色图，drop 时打标记
    struct FakeDecoder {
        fps: Option<f64>,
        total: u64,
        produced: u64,
        fail_at: Option<u64>,
        released: Rc<Cell<bool>>,
        skipped: Rc<Cell<u64>>,
    }

    impl FakeDecoder {
        fn new(fps: Option<f64>, total: u64) -> (Self, Rc<Cell<bool>>) {
            let released = Rc::new(Cell::new(false));
            let decoder = Self {
                fps,
                total,
                produced: 0,
                fail_at: None,
                released: released.clone(),
                skipped: Rc::new(Cell::new(0)),
            };
            (decoder, released)
        }
    }

    impl VideoDecoder for FakeDecoder {
        fn frame_rate(&self) -> Option<f64> {
            self.fps
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.fail_at == Some(self.produced) {
                return Err(DetectError::Decode("boom".to_string()));
            }
            if self.produced >= self.total {
                return Ok(None);
            }
            let shade = (self.produced % 256) as u8;
            self.produced += 1;
            Ok(Some(RgbImage::from_pixel(4, 4, image::Rgb([shade, shade, shade]))))
        }

        fn skip_frame(&mut self) -> Result<bool> {
            self.skipped.set(self.skipped.get() + 1);
            Ok(self.next_frame()?.is_some())
        }
    }

    impl Drop for FakeDecoder {
        fn drop(&mut self) {
            self.released.set(true);
        }
    }

    #[test]
    fn test_three_fps_two_seconds() {
        let (decoder, released) = FakeDecoder::new(Some(3.0), 6);
        let skipped = decoder.skipped.clone();
        let sampler = FrameSampler::new(decoder, 1.0);
        assert_eq!(sampler.interval_frames(), 3);

        let frames: Vec<_> = sampler.map(|f| f.unwrap()).collect();
        let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
        let timestamps: Vec<f64> = frames.iter().map(|f| f.timestamp).collect();

        assert_eq!(indices, vec![0, 1]);
        assert_eq!(timestamps, vec![0.0, 1.0]);
        // 抽中的是原始第 0、3 帧
        assert_eq!(frames[1].image.get_pixel(0, 0)[0], 3);
        // 原始第 1、2、4、5 帧走跳帧路径，最后一次跳帧读到流结束
        assert_eq!(skipped.get(), 5);
        assert!(released.get());
    }

    #[test]
    fn test_indices_contiguous_and_timestamps_spaced() {
        let (decoder, _) = FakeDecoder::new(Some(25.0), 250);
        let sampler = FrameSampler::new(decoder, 0.5);
        let interval = sampler.interval_frames();
        assert_eq!(interval, 13); // round(12.5)

        let frames: Vec<_> = sampler.map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 20); // ceil(250 / 13)
        for (expected, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, expected as u64);
        }
        for pair in frames.windows(2) {
            let gap = pair[1].timestamp - pair[0].timestamp;
            assert!((gap - interval as f64 / 25.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_missing_frame_rate_falls_back() {
        for reported in [None, Some(0.0), Some(f64::NAN)] {
            let (decoder, _) = FakeDecoder::new(reported, 61);
            let sampler = FrameSampler::new(decoder, 1.0);
            assert_eq!(sampler.fps(), FALLBACK_FPS);
            assert_eq!(sampler.interval_frames(), 30);
            assert_eq!(sampler.count(), 3);
        }
    }

    #[test]
    fn test_interval_never_below_one() {
        assert_eq!(interval_frames(30.0, 0.0), 1);
        assert_eq!(interval_frames(30.0, 0.01), 1);
        assert_eq!(interval_frames(29.97, 1.0), 30);
        assert_eq!(interval_frames(24.0, 2.0), 48);
    }

    #[test]
    fn test_empty_stream_is_not_an_error() {
        let (decoder, released) = FakeDecoder::new(Some(30.0), 0);
        let mut sampler = FrameSampler::new(decoder, 1.0);
        assert!(sampler.next().is_none());
        assert!(released.get());
    }

    #[test]
    fn test_early_abandon_releases_decoder() {
        let (decoder, released) = FakeDecoder::new(Some(30.0), 600);
        let mut sampler = FrameSampler::new(decoder, 1.0);
        assert!(sampler.next().is_some());
        assert!(!released.get());
        drop(sampler);
        assert!(released.get());
    }

    #[test]
    fn test_decode_error_releases_and_stops() {
        let (mut decoder, released) = FakeDecoder::new(Some(1.0), 10);
        decoder.fail_at = Some(2);
        let mut sampler = FrameSampler::new(decoder, 1.0);

        assert!(sampler.next().unwrap().is_ok());
        assert!(sampler.next().unwrap().is_ok());
        assert!(matches!(sampler.next(), Some(Err(DetectError::Decode(_)))));
        assert!(released.get());
        assert!(sampler.next().is_none());
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 1e-3);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_open_missing_file() {
        let err = FrameSampler::open(Path::new("/no/such/video.mp4"), 1.0).err().unwrap();
        assert!(matches!(err, DetectError::MediaOpen(_)));
    }

    #[test]
    fn test_ffmpeg_pins_probed_stream_without_rotation() {
        let args: Vec<String> = ffmpeg_args(Path::new("/tmp/clip.mp4"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        // -noautorotate 是输入选项，必须在 -i 之前
        assert!(pos("-noautorotate") < pos("-i"));
        assert_eq!(args[pos("-i") + 1], "/tmp/clip.mp4");
        assert_eq!(args[pos("-map") + 1], "0:v:0");
        assert!(pos("-map") > pos("-i"));
        assert_eq!(args[pos("-pix_fmt") + 1], "rgb24");
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_frame_geometry_limits() {
        let stream = |width, height| ProbeStream {
            width,
            height,
            r_frame_rate: None,
            avg_frame_rate: None,
        };

        assert_eq!(frame_geometry(&stream(Some(1920), Some(1080))), Ok((1920, 1080)));
        assert_eq!(frame_geometry(&stream(Some(8192), Some(4320))), Ok((8192, 4320)));
        assert!(frame_geometry(&stream(Some(0), Some(1080))).is_err());
        assert!(frame_geometry(&stream(None, Some(1080))).is_err());
        assert!(frame_geometry(&stream(Some(65535), Some(65535))).is_err());
    }

    #[test]
    fn test_partial_tail_frame_ends_stream() {
        assert!(complete_frame(12, 12));
        assert!(!complete_frame(0, 12));
        assert!(!complete_frame(5, 12));
    }
}
