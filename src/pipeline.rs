//! 打分链路编排
//!
//! 图片：特征提取 -> 线性打分。
//! 视频：抽帧 -> 逐帧打分（保持抽样顺序）-> 均值聚合。
//!
//! `ScoringEngine` 在进程启动时构造一次，之后只读共享；热路径上没有锁。

use image::RgbImage;
use serde::Serialize;
use std::path::Path;

use crate::embedding::{FeatureExtractor, ModelSpec, ScoringMode};
use crate::error::{DetectError, Result};
use crate::sampler::{FrameSampler, SampledFrame};
use crate::scorer::{LinearScorer, Provenance, ScoringParameters};
use crate::verdict::{DetectionVerdict, FrameScore, Label, MediaType};

/// 引擎状态快照，供健康检查输出
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: ScoringMode,
    pub model_name: String,
    pub model_version: String,
    pub head: Provenance,
    pub feature_dim: usize,
}

pub struct ScoringEngine {
    extractor: Box<dyn FeatureExtractor>,
    scorer: LinearScorer,
    model_name: String,
    model_version: String,
}

impl ScoringEngine {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        params: ScoringParameters,
        spec: &ModelSpec,
    ) -> Self {
        Self {
            extractor,
            scorer: LinearScorer::new(params),
            model_name: spec.name.clone(),
            model_version: spec.version(),
        }
    }

    /// 选提取器、加载打分头，组装引擎
    pub fn initialize(spec: &ModelSpec, head_path: &Path) -> anyhow::Result<Self> {
        let extractor = crate::embedding::select_extractor(spec);
        let params = ScoringParameters::load_or_synthesize(head_path, extractor.native_dim())?;
        let engine = Self::new(extractor, params, spec);

        let status = engine.status();
        tracing::info!(
            mode = ?status.mode,
            head = ?status.head,
            feature_dim = status.feature_dim,
            version = %status.model_version,
            "打分引擎初始化完成"
        );
        Ok(engine)
    }

    pub fn mode(&self) -> ScoringMode {
        self.extractor.mode()
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            mode: self.mode(),
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone(),
            head: self.scorer.params().provenance,
            feature_dim: self.extractor.feature_dim(),
        }
    }

    /// 单张图片的合成概率，落在 [0, 1]
    pub fn score_image(&self, image: &RgbImage) -> Result<f64> {
        let features = self.extractor.extract(image)?;
        self.scorer.score(&features)
    }

    /// 逐帧打分，保持抽样顺序。任何一帧出错即整体失败
    pub fn score_frames<I>(&self, frames: I) -> Result<Vec<FrameScore>>
    where
        I: IntoIterator<Item = Result<SampledFrame>>,
    {
        frames
            .into_iter()
            .map(|frame| {
                let frame = frame?;
                let score = self.score_image(&frame.image)?;
                Ok(FrameScore {
                    index: frame.index,
                    timestamp: frame.timestamp,
                    score,
                })
            })
            .collect()
    }

    /// 打开本地视频，按 `sample_rate_secs` 秒间隔抽帧并逐帧打分
    pub fn score_video(&self, path: &Path, sample_rate_secs: f64) -> Result<Vec<FrameScore>> {
        let sampler = FrameSampler::open(path, sample_rate_secs)?;
        let scores = self.score_frames(sampler)?;
        tracing::debug!(path = %path.display(), frames = scores.len(), "视频逐帧打分完成");
        Ok(scores)
    }

    pub fn detect_image(&self, image: &RgbImage, threshold: f64) -> Result<DetectionVerdict> {
        let score = self.score_image(image)?;
        Ok(DetectionVerdict {
            media_type: MediaType::Image,
            score,
            label: Label::from_score(score, threshold),
            frames: None,
        })
    }

    /// 把逐帧分数聚合成一个视频判定
    pub fn verdict_from_frames(frames: Vec<FrameScore>, threshold: f64) -> Result<DetectionVerdict> {
        let score = aggregate(&frames)?;
        Ok(DetectionVerdict {
            media_type: MediaType::Video,
            score,
            label: Label::from_score(score, threshold),
            frames: Some(frames),
        })
    }

    pub fn detect_video(
        &self,
        path: &Path,
        sample_rate_secs: f64,
        threshold: f64,
    ) -> Result<DetectionVerdict> {
        let frames = self.score_video(path, sample_rate_secs)?;
        Self::verdict_from_frames(frames, threshold)
    }
}

/// 逐帧分数的算术平均；没有帧时报 `EmptySample`
pub fn aggregate(frames: &[FrameScore]) -> Result<f64> {
    if frames.is_empty() {
        return Err(DetectError::EmptySample);
    }
    let sum: f64 = frames.iter().map(|f| f.score).sum();
    Ok(sum / frames.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DigestExtractor;
    use crate::sampler::VideoDecoder;

    fn spec() -> ModelSpec {
        ModelSpec {
            name: "ViT-B-32".to_string(),
            pretrained: "openai".to_string(),
            repo: "openai/clip-vit-base-patch32".to_string(),
            revision: "refs/pr/15".to_string(),
            device: "cpu".to_string(),
        }
    }

    fn degraded_engine() -> ScoringEngine {
        ScoringEngine::new(
            Box::new(DigestExtractor),
            ScoringParameters::deterministic(crate::scorer::FALLBACK_DIM),
            &spec(),
        )
    }

    /// 固定长度、逐帧变色的内存视频
    struct SyntheticVideo {
        fps: f64,
        remaining: u32,
        shade: u8,
    }

    impl VideoDecoder for SyntheticVideo {
        fn frame_rate(&self) -> Option<f64> {
            Some(self.fps)
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.shade = self.shade.wrapping_add(37);
            Ok(Some(RgbImage::from_pixel(8, 8, image::Rgb([self.shade, 0, 255 - self.shade]))))
        }
    }

    #[test]
    fn test_score_image_in_range_and_deterministic() {
        let engine = degraded_engine();
        let image = RgbImage::from_pixel(32, 32, image::Rgb([255, 0, 0]));

        let first = engine.score_image(&image).unwrap();
        assert!((0.0..=1.0).contains(&first));
        for _ in 0..5 {
            assert_eq!(engine.score_image(&image.clone()).unwrap(), first);
        }
    }

    #[test]
    fn test_degraded_engine_reports_status() {
        let status = degraded_engine().status();
        assert_eq!(status.mode, ScoringMode::Degraded);
        assert_eq!(status.head, Provenance::DeterministicFallback);
        assert_eq!(status.feature_dim, 32);
        assert_eq!(status.model_version, "ViT-B-32:openai");
    }

    #[test]
    fn test_video_scores_follow_sample_order() {
        let engine = degraded_engine();
        let video = SyntheticVideo { fps: 3.0, remaining: 6, shade: 0 };
        let frames = engine.score_frames(FrameSampler::new(video, 1.0)).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[0].timestamp, 0.0);
        assert_eq!(frames[1].timestamp, 1.0);
        assert!(frames.iter().all(|f| (0.0..=1.0).contains(&f.score)));
    }

    #[test]
    fn test_video_aggregate_is_mean_of_frames() {
        let engine = degraded_engine();
        let video = SyntheticVideo { fps: 10.0, remaining: 95, shade: 0 };
        let frames = engine.score_frames(FrameSampler::new(video, 0.5)).unwrap();
        assert_eq!(frames.len(), 19);

        let expected = frames.iter().map(|f| f.score).sum::<f64>() / frames.len() as f64;
        let verdict = ScoringEngine::verdict_from_frames(frames, 0.5).unwrap();

        assert!((verdict.score - expected).abs() < 1e-9);
        assert_eq!(verdict.media_type, MediaType::Video);
        assert_eq!(verdict.label, Label::from_score(expected, 0.5));
    }

    #[test]
    fn test_empty_video_is_empty_sample() {
        let engine = degraded_engine();
        let video = SyntheticVideo { fps: 30.0, remaining: 0, shade: 0 };
        let frames = engine.score_frames(FrameSampler::new(video, 1.0)).unwrap();

        assert!(frames.is_empty());
        assert!(matches!(
            ScoringEngine::verdict_from_frames(frames, 0.5),
            Err(DetectError::EmptySample)
        ));
    }

    #[test]
    fn test_unopenable_video_is_media_open() {
        let engine = degraded_engine();
        let err = engine.detect_video(Path::new("/missing/clip.mp4"), 1.0, 0.5).unwrap_err();
        assert!(matches!(err, DetectError::MediaOpen(_)));
    }

    #[test]
    fn test_single_frame_mean() {
        let frames = vec![FrameScore { index: 0, timestamp: 0.0, score: 0.42 }];
        assert_eq!(aggregate(&frames).unwrap(), 0.42);
    }

    #[test]
    fn test_image_threshold_per_request() {
        let engine = degraded_engine();
        let image = RgbImage::from_pixel(16, 16, image::Rgb([1, 2, 3]));
        let score = engine.score_image(&image).unwrap();

        let at = engine.detect_image(&image, score).unwrap();
        assert_eq!(at.label, Label::Synthetic);
        assert!(at.frames.is_none());

        if score < 1.0 {
            let above = engine.detect_image(&image, (score + 1e-6).min(1.0)).unwrap();
            assert_eq!(above.label, Label::Real);
        }
    }

    #[test]
    fn test_dimension_mismatch_still_scores() {
        // 32 维特征配 3 维打分头：只用前 3 维
        let engine = ScoringEngine::new(
            Box::new(DigestExtractor),
            ScoringParameters::trained(vec![0.01, -0.02, 0.03], -0.1),
            &spec(),
        );
        let image = RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9]));
        let features = DigestExtractor.extract(&image).unwrap();
        let logit = 0.01 * features[0] as f64 - 0.02 * features[1] as f64 + 0.03 * features[2] as f64 - 0.1;
        let expected = crate::scorer::sigmoid(logit);

        assert!((engine.score_image(&image).unwrap() - expected).abs() < 1e-6);
    }
}
