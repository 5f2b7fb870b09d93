//! カタログ・メタデータCSVの読み書き
//!
//! 書き込みは同じディレクトリの一時ファイルに出力してからリネームするため、
//! 途中で失敗しても中途半端なファイルは残らない。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};

use crate::error::PipelineError;
use crate::types::{CardRecord, MetadataRow};

/// ヘッダー付きCSVを読み込む
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PipelineError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

/// ヘッダー付きCSVをアトミックに書き込む
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), PipelineError> {
    write_atomic(path, |file| {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// 一時ファイル経由でファイルを書き込む
pub fn write_atomic<F>(path: &Path, write: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut std::fs::File) -> Result<(), PipelineError>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    write(temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    temp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

pub fn load_catalog(path: &Path) -> Result<Vec<CardRecord>, PipelineError> {
    read_rows(path)
}

pub fn save_catalog(path: &Path, cards: &[CardRecord]) -> Result<(), PipelineError> {
    write_rows(path, cards)
}

pub fn load_metadata_rows(path: &Path) -> Result<Vec<MetadataRow>, PipelineError> {
    read_rows(path)
}

pub fn save_metadata_rows(path: &Path, rows: &[MetadataRow]) -> Result<(), PipelineError> {
    write_rows(path, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, ColorIdentity, ColorLabel};

    #[test]
    fn test_catalog_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let cards = vec![
            CardRecord {
                name: "Card B".into(),
                color_identity: ColorIdentity::new([Color::Blue, Color::White]),
                image_url: "https://img.example/b.jpg".into(),
            },
            CardRecord {
                name: "Wastes".into(),
                color_identity: ColorIdentity::colorless(),
                image_url: String::new(),
            },
        ];
        save_catalog(&path, &cards).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("name,color_identity,image_url"));
        assert_eq!(lines.next(), Some("Card B,\"W,U\",https://img.example/b.jpg"));
        assert_eq!(lines.next(), Some("Wastes,,"));

        assert_eq!(load_catalog(&path).unwrap(), cards);
    }

    #[test]
    fn test_catalog_accepts_legacy_color_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        std::fs::write(
            &path,
            "name,color_identity,image_url\nBolt,\"['R']\",https://x/bolt.jpg\nRelic,Colorless,https://x/relic.png\n",
        )
        .unwrap();

        let cards = load_catalog(&path).unwrap();
        assert_eq!(cards[0].color_identity, ColorIdentity::new([Color::Red]));
        assert!(cards[1].color_identity.is_empty());
    }

    #[test]
    fn test_metadata_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("meta.csv");
        let rows = vec![MetadataRow {
            image_filename: "CardA.jpg".into(),
            label: ColorLabel::White,
        }];
        save_metadata_rows(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "image_filename,label\nCardA.jpg,White\n");
        assert_eq!(load_metadata_rows(&path).unwrap(), rows);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_catalog(&dir.path().join("nope.csv")).is_err());
    }
}
