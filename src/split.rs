//! データセットの train / val / test 分割
//!
//! メタデータに載っている画像をシャッフルして3つのフォルダにコピーし、
//! それぞれのラベルCSV（`train_labels.csv` など）を書き出す。

use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

use crate::csv_loader;
use crate::error::PipelineError;
use crate::metadata::validate_rows;
use crate::types::MetadataRow;

pub const TRAIN_RATIO: f64 = 0.70;
pub const VAL_RATIO: f64 = 0.15;

/// 各分割の枚数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSizes {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitSizes {
    /// train・val は切り捨て、残りを test に割り当てる
    pub fn for_total(total: usize) -> Self {
        let train = (total as f64 * TRAIN_RATIO).floor() as usize;
        let val = (total as f64 * VAL_RATIO).floor() as usize;
        Self {
            train,
            val,
            test: total - train - val,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SplitReport {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    /// コピーに失敗したファイル
    pub failed: Vec<String>,
}

/// メタデータの行をシード付きでシャッフルして3分割する
pub fn partition(mut rows: Vec<MetadataRow>, seed: u64) -> [(&'static str, Vec<MetadataRow>); 3] {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    rows.shuffle(&mut rng);

    let sizes = SplitSizes::for_total(rows.len());
    let test = rows.split_off(sizes.train + sizes.val);
    let val = rows.split_off(sizes.train);
    [("train", rows), ("val", val), ("test", test)]
}

/// 画像をコピーしてラベルCSVを書き出す
pub fn split_dataset(
    image_dir: &Path,
    rows: Vec<MetadataRow>,
    output_dir: &Path,
    seed: u64,
) -> Result<SplitReport, PipelineError> {
    let (rows, _) = validate_rows(rows, image_dir);
    if rows.is_empty() {
        return Err(PipelineError::InvalidInput(format!(
            "{} に分割できる画像がありません",
            image_dir.display()
        )));
    }

    let mut report = SplitReport::default();

    for (name, subset) in partition(rows, seed) {
        let dest = output_dir.join(name);
        std::fs::create_dir_all(&dest)?;

        let mut copied = Vec::with_capacity(subset.len());
        for row in subset {
            let src = image_dir.join(&row.image_filename);
            match std::fs::copy(&src, dest.join(&row.image_filename)) {
                Ok(_) => copied.push(row),
                Err(e) => {
                    tracing::warn!("コピーに失敗しました {}: {}", row.image_filename, e);
                    report.failed.push(row.image_filename);
                }
            }
        }

        csv_loader::save_metadata_rows(&output_dir.join(format!("{}_labels.csv", name)), &copied)?;
        tracing::info!("{}: {} 枚", name, copied.len());

        match name {
            "train" => report.train = copied.len(),
            "val" => report.val = copied.len(),
            _ => report.test = copied.len(),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColorLabel;

    fn rows(n: usize) -> Vec<MetadataRow> {
        (0..n)
            .map(|i| MetadataRow {
                image_filename: format!("card{i}.jpg"),
                label: ColorLabel::ALL[i % ColorLabel::ALL.len()],
            })
            .collect()
    }

    #[test]
    fn test_split_sizes() {
        assert_eq!(SplitSizes::for_total(100), SplitSizes { train: 70, val: 15, test: 15 });
        assert_eq!(SplitSizes::for_total(10), SplitSizes { train: 7, val: 1, test: 2 });
        assert_eq!(SplitSizes::for_total(1), SplitSizes { train: 0, val: 0, test: 1 });
    }

    #[test]
    fn test_partition_is_deterministic_and_disjoint() {
        let a = partition(rows(20), 42);
        let b = partition(rows(20), 42);
        for ((_, x), (_, y)) in a.iter().zip(b.iter()) {
            assert_eq!(x, y);
        }

        let mut all: Vec<String> = a
            .iter()
            .flat_map(|(_, subset)| subset.iter().map(|r| r.image_filename.clone()))
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn test_split_dataset_copies_files_and_writes_labels() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for row in rows(10) {
            std::fs::write(src.path().join(&row.image_filename), b"img").unwrap();
        }

        let mut input = rows(10);
        input.push(MetadataRow {
            image_filename: "missing.jpg".into(),
            label: ColorLabel::Red,
        });

        let report = split_dataset(src.path(), input, out.path(), 42).unwrap();
        assert_eq!((report.train, report.val, report.test), (7, 1, 2));

        for name in ["train", "val", "test"] {
            let labels = csv_loader::load_metadata_rows(&out.path().join(format!("{name}_labels.csv"))).unwrap();
            for row in labels {
                assert!(out.path().join(name).join(&row.image_filename).is_file());
            }
        }
    }
}
