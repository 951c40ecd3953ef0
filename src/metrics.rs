//! 离线评测：在带标注的数据集目录上跑打分，计算 ROC-AUC 与 0.5 阈值准确率
//!
//! 目录结构：`<root>/real/**` 标为 0，`<root>/synthetic/**` 标为 1。

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::media;
use crate::pipeline::ScoringEngine;

/// 准确率使用的固定阈值
pub const EVAL_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// 只有一个类别时为 NaN（序列化为 null）
    pub roc_auc: f64,
    #[serde(rename = "accuracy_at_0.5")]
    pub accuracy_at_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub metrics: Metrics,
    pub num_samples: usize,
}

/// 基于秩的 ROC-AUC（Mann-Whitney U），同分取平均秩
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> f64 {
    let n = scores.len().min(labels.len());
    let n_pos = labels[..n].iter().filter(|&&l| l).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = (0..n).filter(|&k| labels[k]).map(|k| ranks[k]).sum();
    let n_pos = n_pos as f64;
    (pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// `score >= threshold` 判为 synthetic 时的准确率；空输入为 0
pub fn accuracy_at(scores: &[f64], labels: &[bool], threshold: f64) -> f64 {
    let n = scores.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let correct = scores
        .iter()
        .zip(labels)
        .filter(|&(&s, &l)| (s >= threshold) == l)
        .count();
    correct as f64 / n as f64
}

pub fn compute_metrics(scores: &[f64], labels: &[bool]) -> Metrics {
    Metrics {
        roc_auc: roc_auc(scores, labels),
        accuracy_at_threshold: accuracy_at(scores, labels, EVAL_THRESHOLD),
    }
}

/// 递归列出目录下所有文件，按路径排序保证顺序稳定
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// 给数据集目录下每张图片打分，返回 (分数, 是否合成)
///
/// 无法解码的文件跳过并记警告。
pub fn evaluate_folder(engine: &ScoringEngine, root: &Path) -> anyhow::Result<(Vec<f64>, Vec<bool>)> {
    let real_dir = root.join("real");
    let fake_dir = root.join("synthetic");
    if !real_dir.is_dir() || !fake_dir.is_dir() {
        anyhow::bail!("数据集目录必须包含 real 和 synthetic 两个子目录: {}", root.display());
    }

    let mut scores = Vec::new();
    let mut labels = Vec::new();

    for (dir, label) in [(&real_dir, false), (&fake_dir, true)] {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;

        for path in files {
            let image = match media::open_image(&path) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "跳过无法解码的文件");
                    continue;
                }
            };
            scores.push(engine.score_image(&image)?);
            labels.push(label);
        }
    }

    tracing::info!(samples = scores.len(), "数据集打分完成");
    Ok((scores, labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), 1.0);
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), 0.0);
    }

    #[test]
    fn test_auc_ties_count_half() {
        // 所有分数相同：AUC = 0.5
        assert_eq!(roc_auc(&[0.5; 4], &[false, true, false, true]), 0.5);
        // 一对正负样本同分，其余全部排对：(3 + 0.5) / 4
        let auc = roc_auc(&[0.1, 0.6, 0.6, 0.9], &[false, false, true, true]);
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_auc_single_class_is_nan() {
        assert!(roc_auc(&[0.1, 0.9], &[true, true]).is_nan());
        assert!(roc_auc(&[], &[]).is_nan());
    }

    #[test]
    fn test_accuracy_boundary_inclusive() {
        let scores = [0.5, 0.4999, 0.7, 0.1];
        let labels = [true, false, false, false];
        assert_eq!(accuracy_at(&scores, &labels, 0.5), 0.75);
        assert_eq!(accuracy_at(&[], &[], 0.5), 0.0);
    }

    #[test]
    fn test_report_serialization() {
        let report = EvalReport {
            metrics: compute_metrics(&[0.2, 0.8], &[false, true]),
            num_samples: 2,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metrics"]["roc_auc"], 1.0);
        assert_eq!(json["metrics"]["accuracy_at_0.5"], 1.0);
        assert_eq!(json["num_samples"], 2);
    }
}
