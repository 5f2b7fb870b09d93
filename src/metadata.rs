//! 学習用メタデータの生成
//!
//! カタログの各カードに色ラベルを付け、実際に画像が存在するカードだけを
//! `image_filename,label` 形式で書き出す。

use std::collections::HashSet;
use std::path::Path;

use crate::csv_loader;
use crate::download::image_filename;
use crate::error::PipelineError;
use crate::types::{CardRecord, ColorLabel, MetadataRow};

#[derive(Debug, Clone, Default)]
pub struct MetadataReport {
    pub rows: usize,
    /// 画像が見つからなかったカード名
    pub missing_images: Vec<String>,
}

/// カタログと画像フォルダからメタデータ行を作る
///
/// 同じファイル名になるカードは最初の1件のみ採用する。
pub fn build_rows(cards: &[CardRecord], image_dir: &Path) -> (Vec<MetadataRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut missing = Vec::new();
    let mut seen = HashSet::new();

    for card in cards {
        let filename = match image_filename(&card.name, &card.image_url) {
            Some(f) => f,
            None => {
                missing.push(card.name.clone());
                continue;
            }
        };
        if !image_dir.join(&filename).is_file() {
            missing.push(card.name.clone());
            continue;
        }
        if !seen.insert(filename.clone()) {
            continue;
        }
        rows.push(MetadataRow {
            image_filename: filename,
            label: ColorLabel::from_identity(&card.color_identity),
        });
    }

    (rows, missing)
}

/// 画像が存在しない行を除外する（学習前の整合性チェック）
pub fn validate_rows(rows: Vec<MetadataRow>, image_dir: &Path) -> (Vec<MetadataRow>, Vec<MetadataRow>) {
    let (kept, dropped): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|row| image_dir.join(&row.image_filename).is_file());

    for row in &dropped {
        tracing::warn!("画像が見つからないため除外します: {}", row.image_filename);
    }
    (kept, dropped)
}

/// カタログを読み込んでメタデータCSVを書き出す
pub fn run_metadata(catalog_path: &Path, image_dir: &Path, output: &Path) -> Result<MetadataReport, PipelineError> {
    let cards = csv_loader::load_catalog(catalog_path)?;
    let (rows, missing_images) = build_rows(&cards, image_dir);

    if !missing_images.is_empty() {
        tracing::info!("画像が無いカード {} 枚は除外しました", missing_images.len());
        for name in &missing_images {
            tracing::debug!("画像なし: {}", name);
        }
    }

    csv_loader::save_metadata_rows(output, &rows)?;
    tracing::info!("{} 行のメタデータを {} に保存しました", rows.len(), output.display());

    Ok(MetadataReport {
        rows: rows.len(),
        missing_images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, ColorIdentity};

    fn card(name: &str, colors: &[Color]) -> CardRecord {
        CardRecord {
            name: name.into(),
            color_identity: ColorIdentity::new(colors.iter().copied()),
            image_url: "https://img/x.jpg".into(),
        }
    }

    #[test]
    fn test_rows_reference_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Present.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("Other.jpg"), b"x").unwrap();

        let cards = vec![
            card("Present", &[Color::Red]),
            card("Absent", &[Color::Blue]),
            card("Other", &[]),
        ];
        let (rows, missing) = build_rows(&cards, dir.path());

        assert_eq!(missing, vec!["Absent"]);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(dir.path().join(&row.image_filename).is_file());
        }
        assert_eq!(rows[0].label, ColorLabel::Red);
        assert_eq!(rows[1].label, ColorLabel::Colorless);
    }

    #[test]
    fn test_duplicate_filenames_emit_one_row() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("FireIce.jpg"), b"x").unwrap();
        let cards = vec![card("Fire // Ice", &[Color::Red, Color::Blue]), card("Fire Ice", &[Color::Red])];
        let (rows, _) = build_rows(&cards, dir.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, ColorLabel::Multicolor);
    }

    #[test]
    fn test_validate_rows_drops_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        let rows = vec![
            MetadataRow {
                image_filename: "a.jpg".into(),
                label: ColorLabel::White,
            },
            MetadataRow {
                image_filename: "b.jpg".into(),
                label: ColorLabel::Blue,
            },
        ];
        let (kept, dropped) = validate_rows(rows, dir.path());
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped[0].image_filename, "b.jpg");
    }
}
