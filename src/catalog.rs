//! スタンダード適正カードのカタログ取得
//!
//! 検索APIのページを `next_page` が無くなるまで辿り、
//! カード名・カラーアイデンティティ・画像URLをCSVに書き出す。
//! 途中でエラーが起きた場合は何も書き込まずに中断する。

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::csv_loader;
use crate::error::PipelineError;
use crate::http::{CardSearch, HttpClient};
use crate::model::CatalogSettings;
use crate::progress::Progress;
use crate::types::{CardRecord, ColorIdentity};

/// 検索APIのレスポンス1ページ
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub data: Vec<ApiCard>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub total_cards: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCard {
    pub name: String,
    #[serde(default)]
    pub color_identity: Vec<String>,
    #[serde(default)]
    pub image_uris: Option<ImageUris>,
    /// 両面カードなどは面ごとに画像を持つ
    #[serde(default)]
    pub card_faces: Vec<CardFace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardFace {
    #[serde(default)]
    pub image_uris: Option<ImageUris>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUris {
    #[serde(default)]
    pub normal: Option<String>,
    #[serde(default)]
    pub large: Option<String>,
}

impl ImageUris {
    fn preferred(&self) -> Option<&str> {
        self.normal.as_deref().or(self.large.as_deref())
    }
}

impl ApiCard {
    /// 画像URL（カード本体 → 第1面の順に探す）
    pub fn image_url(&self) -> Option<&str> {
        if let Some(url) = self.image_uris.as_ref().and_then(ImageUris::preferred) {
            return Some(url);
        }
        self.card_faces
            .first()
            .and_then(|face| face.image_uris.as_ref())
            .and_then(ImageUris::preferred)
    }

    pub fn into_record(self) -> Result<CardRecord, PipelineError> {
        let color_identity: ColorIdentity = self.color_identity.join(",").parse()?;
        let image_url = self.image_url().unwrap_or_default().to_string();
        Ok(CardRecord {
            name: self.name,
            color_identity,
            image_url,
        })
    }
}

/// 検索クエリ付きの最初のページURLを組み立てる
pub fn search_url(settings: &CatalogSettings) -> Result<String, PipelineError> {
    let url = reqwest::Url::parse_with_params(&settings.search_url, &[("q", settings.query.as_str())])
        .map_err(|e| PipelineError::InvalidInput(format!("search_url: {e}")))?;
    Ok(url.to_string())
}

/// 全ページを辿ってカタログを取得する
///
/// カード名で重複を除去し、最初に現れたものを残す。
pub async fn fetch_catalog<S: CardSearch>(
    source: &S,
    first_url: &str,
    page_delay: Duration,
) -> Result<Vec<CardRecord>, PipelineError> {
    let mut cards = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(first_url.to_string());
    let mut visited = HashSet::new();
    let progress = Progress::spinner("カタログを取得しています...");

    while let Some(url) = next.take() {
        if !visited.insert(url.clone()) {
            return Err(PipelineError::Parse(format!("ページが循環しています: {url}")));
        }

        let page = source.fetch_page(&url).await?;
        tracing::debug!(cards = page.data.len(), has_more = page.has_more, "ページ取得: {url}");

        for card in page.data {
            if seen.contains(&card.name) {
                continue;
            }
            let record = card.into_record()?;
            seen.insert(record.name.clone());
            cards.push(record);
        }

        match page.total_cards {
            Some(total) => progress.set_message(&format!("{} / {} 枚", cards.len(), total)),
            None => progress.set_message(&format!("{} 枚", cards.len())),
        }

        if page.has_more {
            next = page.next_page;
            if next.is_some() && !page_delay.is_zero() {
                tokio::time::sleep(page_delay).await;
            }
        }
    }

    progress.finish(&format!("{} 枚取得しました", cards.len()));

    if cards.is_empty() {
        return Err(PipelineError::InvalidInput("検索結果が0件でした".to_string()));
    }
    Ok(cards)
}

/// カタログを取得してCSVに保存し、件数を返す
pub async fn run_fetch(settings: &CatalogSettings, output: &Path) -> Result<usize, PipelineError> {
    let client = HttpClient::new(&settings.user_agent, Duration::from_secs(30))?;
    let url = search_url(settings)?;
    tracing::info!("カタログ取得を開始します: {}", settings.query);

    let cards = fetch_catalog(&client, &url, Duration::from_millis(settings.page_delay_ms)).await?;
    csv_loader::save_catalog(output, &cards)?;

    tracing::info!("{} 枚のカードを {} に保存しました", cards.len(), output.display());
    Ok(cards.len())
}
