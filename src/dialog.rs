//! パス引数の解決
//!
//! コマンドラインで省略されたフォルダ・ファイルは、`dialog` フィーチャーが
//! 有効な場合のみネイティブのファイル選択ダイアログで選ばせる。

use anyhow::Result;
use std::path::{Path, PathBuf};

/// 選択対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickKind {
    Folder,
    File,
}

/// 引数のパスをそのまま使うか、ダイアログで選ばせる
///
/// - `arg`: コマンドライン引数（指定済みならそのまま返す）
/// - `title`: ダイアログのタイトル兼エラーメッセージ
/// - `start_dir`: ダイアログの初期フォルダ（前回使用したフォルダなど）
pub fn resolve_path(arg: Option<PathBuf>, kind: PickKind, title: &str, start_dir: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = arg {
        return Ok(path);
    }
    pick(kind, title, start_dir.map(Path::new))
}

#[cfg(feature = "dialog")]
fn pick(kind: PickKind, title: &str, start_dir: Option<&Path>) -> Result<PathBuf> {
    let mut dialog = rfd::FileDialog::new().set_title(title);
    if let Some(dir) = start_dir.filter(|d| d.is_dir()) {
        dialog = dialog.set_directory(dir);
    }

    let picked = match kind {
        PickKind::Folder => dialog.pick_folder(),
        PickKind::File => dialog.pick_file(),
    };
    picked.ok_or_else(|| anyhow::anyhow!("{}: 選択がキャンセルされました", title))
}

#[cfg(not(feature = "dialog"))]
fn pick(kind: PickKind, title: &str, _start_dir: Option<&Path>) -> Result<PathBuf> {
    let what = match kind {
        PickKind::Folder => "フォルダ",
        PickKind::File => "ファイル",
    };
    anyhow::bail!("{}: {}のパスを指定してください", title, what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_is_used() {
        let path = resolve_path(Some(PathBuf::from("cards")), PickKind::Folder, "画像フォルダ", None).unwrap();
        assert_eq!(path, PathBuf::from("cards"));
    }

    #[cfg(not(feature = "dialog"))]
    #[test]
    fn test_missing_path_without_dialog_is_error() {
        let err = resolve_path(None, PickKind::File, "モデルファイル", None).unwrap_err();
        assert!(err.to_string().contains("モデルファイル"));
    }
}
