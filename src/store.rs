use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::verdict::{DetectionVerdict, FrameScore, Label, MediaType};

/// 上传请求的附带信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// 待入库的一次检测
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub verdict: DetectionVerdict,
    pub media_hash: String,
    pub threshold: f64,
    pub model_name: String,
    pub model_version: String,
    pub metadata: RequestMetadata,
}

/// 已入库的检测记录，也是 HTTP 响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: u64,
    pub media_type: MediaType,
    pub media_hash: String,
    pub score: f64,
    pub threshold: f64,
    pub label: Label,
    pub model_name: String,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub metadata: RequestMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<FrameScore>>,
}

/// 检测结果仓库
///
/// sled 的 `detections` 树，键为大端 u64 id（按插入顺序递增），值为 JSON。
/// 只追加，不修改历史记录。
pub struct ResultStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl ResultStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree("detections")?;
        Ok(Self { db, tree })
    }

    /// 临时库，进程退出即删除
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("detections")?;
        Ok(Self { db, tree })
    }

    /// 写入一条检测记录
    ///
    /// 分数、阈值、逐帧分数与时间戳必须是有限数：JSON 会把 NaN / inf 写成 `null`，
    /// 这样的记录无法再读回，所以在分配 id 之前直接拒绝。
    pub fn insert(&self, detection: NewDetection) -> anyhow::Result<DetectionRecord> {
        ensure_finite(&detection)?;
        let id = self.db.generate_id()?;
        let verdict = detection.verdict;
        let record = DetectionRecord {
            id,
            media_type: verdict.media_type,
            media_hash: detection.media_hash,
            score: verdict.score,
            threshold: detection.threshold,
            label: verdict.label,
            model_name: detection.model_name,
            model_version: detection.model_version,
            created_at: Utc::now(),
            metadata: detection.metadata,
            frames: verdict.frames,
        };

        let payload = serde_json::to_vec(&record)?;
        self.tree.insert(id.to_be_bytes(), payload)?;
        self.tree.flush()?;

        tracing::info!(id, media_type = ?record.media_type, label = ?record.label, score = record.score, "检测结果已入库");
        Ok(record)
    }

    pub fn get(&self, id: u64) -> anyhow::Result<Option<DetectionRecord>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// 最近的 `limit` 条记录，新的在前
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<DetectionRecord>> {
        self.tree
            .iter()
            .rev()
            .take(limit)
            .map(|entry| -> anyhow::Result<DetectionRecord> {
                let (_, raw) = entry?;
                Ok(serde_json::from_slice(&raw)?)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

fn ensure_finite(detection: &NewDetection) -> anyhow::Result<()> {
    let verdict = &detection.verdict;
    if !verdict.score.is_finite() {
        anyhow::bail!("拒绝写入非有限分数: {}", verdict.score);
    }
    if !detection.threshold.is_finite() {
        anyhow::bail!("拒绝写入非有限阈值: {}", detection.threshold);
    }
    for frame in verdict.frames.iter().flatten() {
        if !frame.score.is_finite() || !frame.timestamp.is_finite() {
            anyhow::bail!(
                "拒绝写入非有限帧数据: index={} score={} timestamp={}",
                frame.index,
                frame.score,
                frame.timestamp
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(score: f64, frames: Option<Vec<FrameScore>>) -> NewDetection {
        let media_type = if frames.is_some() { MediaType::Video } else { MediaType::Image };
        NewDetection {
            verdict: DetectionVerdict {
                media_type,
                score,
                label: Label::from_score(score, 0.5),
                frames,
            },
            media_hash: "ab".repeat(32),
            threshold: 0.5,
            model_name: "ViT-B-32".to_string(),
            model_version: "ViT-B-32:openai".to_string(),
            metadata: RequestMetadata {
                filename: Some("cat.png".to_string()),
                content_type: Some("image/png".to_string()),
                extras: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_insert_then_get() {
        let store = ResultStore::temporary().unwrap();
        let record = store.insert(detection(0.8, None)).unwrap();

        assert_eq!(record.label, Label::Synthetic);
        assert_eq!(store.get(record.id).unwrap(), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_video_frames_round_trip() {
        let store = ResultStore::temporary().unwrap();
        let frames = vec![
            FrameScore { index: 0, timestamp: 0.0, score: 0.2 },
            FrameScore { index: 1, timestamp: 1.0, score: 0.4 },
        ];
        let record = store.insert(detection(0.3, Some(frames.clone()))).unwrap();

        let loaded = store.get(record.id).unwrap().unwrap();
        assert_eq!(loaded.frames, Some(frames));
        assert_eq!(loaded.media_type, MediaType::Video);
        assert_eq!(loaded.label, Label::Real);
    }

    #[test]
    fn test_ids_increase_and_recent_is_newest_first() {
        let store = ResultStore::temporary().unwrap();
        let ids: Vec<u64> = (0..4)
            .map(|i| store.insert(detection(i as f64 / 4.0, None)).unwrap().id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let recent: Vec<u64> = store.recent(2).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(recent, vec![ids[3], ids[2]]);
    }

    #[test]
    fn test_missing_id() {
        let store = ResultStore::temporary().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get(42).unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let id = {
            let store = ResultStore::open(&path).unwrap();
            store.insert(detection(0.9, None)).unwrap().id
        };

        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().score, 0.9);
    }

    #[test]
    fn test_non_finite_scores_are_refused() {
        let store = ResultStore::temporary().unwrap();

        assert!(store.insert(detection(f64::NAN, None)).is_err());
        assert!(store.insert(detection(f64::INFINITY, None)).is_err());

        let frames = vec![
            FrameScore { index: 0, timestamp: 0.0, score: 0.4 },
            FrameScore { index: 1, timestamp: 1.0, score: f64::NAN },
        ];
        assert!(store.insert(detection(0.4, Some(frames))).is_err());

        // 被拒绝的写入不占位，历史仍然可读
        assert!(store.is_empty());
        let ok = store.insert(detection(0.6, None)).unwrap();
        assert_eq!(store.recent(10).unwrap(), vec![ok]);
    }
}
