//! カード画像のダウンロード
//!
//! カタログの各行について画像を取得し、カード名から決まるファイル名で保存する。
//! 既に存在するファイルはスキップするため、何度実行しても結果は変わらない。
//! 1枚ごとの失敗はログに残してスキップし、バッチ全体は止めない。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::csv_loader;
use crate::error::PipelineError;
use crate::http::{HttpClient, ImageSource};
use crate::model::DownloadSettings;
use crate::progress::Progress;
use crate::types::CardRecord;

/// ファイル名の最大長（拡張子を除く文字数）
const MAX_NAME_CHARS: usize = 80;

/// 画像として扱う拡張子
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// カード名からファイル名に使えない文字を取り除く
///
/// 英数字（アクセント付き文字を含む）と `_` `-` のみ残す。
/// `"Fire // Ice"` -> `"FireIce"`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_CHARS)
        .collect()
}

/// 画像URLから拡張子を決める（不明な場合は `.jpg`）
pub fn url_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    let ext = match last_segment.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return ".jpg",
    };
    match ext.as_str() {
        "jpeg" => ".jpeg",
        "png" => ".png",
        _ => ".jpg",
    }
}

/// カード名と画像URLから保存ファイル名を決める
///
/// 名前が空になる場合は `None`。
pub fn image_filename(name: &str, image_url: &str) -> Option<String> {
    let stem = sanitize_name(name);
    if stem.is_empty() {
        return None;
    }
    Some(format!("{}{}", stem, url_extension(image_url)))
}

/// 画像拡張子を持つファイルか
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub dest_dir: PathBuf,
    /// リクエスト間の待機時間
    pub delay: Duration,
    /// 一時的な失敗に対する最大試行回数
    pub max_attempts: u32,
    /// 再試行の待機時間（試行回数に比例）
    pub retry_backoff: Duration,
}

impl DownloadOptions {
    pub fn from_settings(settings: &DownloadSettings, dest_dir: &Path) -> Self {
        Self {
            dest_dir: dest_dir.to_path_buf(),
            delay: Duration::from_millis(settings.delay_ms),
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// 1枚分の失敗
#[derive(Debug, Clone)]
pub struct DownloadFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub skipped_existing: usize,
    pub failed: Vec<DownloadFailure>,
}

/// カタログの全カードの画像をダウンロードする
///
/// 保存先ディレクトリを作成できない場合のみエラーを返す。
pub async fn download_images<S: ImageSource>(
    source: &S,
    cards: &[CardRecord],
    options: &DownloadOptions,
) -> Result<DownloadReport, PipelineError> {
    std::fs::create_dir_all(&options.dest_dir)?;

    let mut report = DownloadReport::default();
    let progress = Progress::bar(cards.len() as u64, "画像をダウンロード中");
    // 今回の実行で割り当て済みのファイル名（大文字小文字を区別しない） -> カード名
    let mut claimed: HashMap<String, &str> = HashMap::new();

    for card in cards {
        progress.inc(1);

        let filename = match image_filename(&card.name, &card.image_url) {
            Some(f) => f,
            None => {
                record_failure(&mut report, &card.name, "ファイル名に使える文字がありません".to_string());
                continue;
            }
        };

        if let Some(owner) = claimed.get(&filename.to_lowercase()) {
            let reason = format!("ファイル名 {} が {} と重複しています", filename, owner);
            record_failure(&mut report, &card.name, reason);
            continue;
        }
        claimed.insert(filename.to_lowercase(), &card.name);

        let save_path = options.dest_dir.join(&filename);
        if save_path.exists() {
            report.skipped_existing += 1;
            continue;
        }

        if !card.image_url.starts_with("http") {
            record_failure(&mut report, &card.name, "有効な画像URLがありません".to_string());
            continue;
        }

        progress.set_message(&filename);
        match fetch_with_retry(source, &card.image_url, options).await {
            Ok(bytes) => match store_image(&save_path, &bytes) {
                Ok(()) => report.downloaded += 1,
                Err(e) => record_failure(&mut report, &card.name, e.to_string()),
            },
            Err(e) => record_failure(&mut report, &card.name, e.to_string()),
        }

        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }

    progress.finish(&format!(
        "完了: {} 枚取得, {} 枚スキップ, {} 枚失敗",
        report.downloaded,
        report.skipped_existing,
        report.failed.len()
    ));
    Ok(report)
}

fn record_failure(report: &mut DownloadReport, name: &str, reason: String) {
    tracing::warn!("{} の画像を取得できませんでした: {}", name, reason);
    report.failed.push(DownloadFailure {
        name: name.to_string(),
        reason,
    });
}

async fn fetch_with_retry<S: ImageSource>(
    source: &S,
    url: &str,
    options: &DownloadOptions,
) -> Result<Vec<u8>, PipelineError> {
    let mut attempt = 1;
    loop {
        match source.fetch_image(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < options.max_attempts => {
                tracing::debug!("再試行します ({}/{}): {} - {}", attempt, options.max_attempts, url, e);
                tokio::time::sleep(options.retry_backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 画像としてデコードできることを確認してから保存する
fn store_image(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    image::load_from_memory(bytes)?;
    csv_loader::write_atomic(path, |file| {
        use std::io::Write;
        file.write_all(bytes)?;
        Ok(())
    })
}

/// カタログCSVを読み込み、画像をダウンロードする
pub async fn run_download(
    settings: &DownloadSettings,
    user_agent: &str,
    catalog_path: &Path,
    dest_dir: &Path,
) -> Result<DownloadReport, PipelineError> {
    settings
        .validate()
        .map_err(|e| PipelineError::InvalidInput(format!("{:#}", e)))?;
    let cards = csv_loader::load_catalog(catalog_path)?;
    tracing::info!(
        "{} 枚分の画像を {} にダウンロードします",
        cards.len(),
        dest_dir.display()
    );

    let client = HttpClient::new(user_agent, Duration::from_secs(settings.timeout_secs))?;
    let options = DownloadOptions::from_settings(settings, dest_dir);
    download_images(&client, &cards, &options).await
}
