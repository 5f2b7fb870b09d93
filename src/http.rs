//! カードデータAPI・画像サーバーへのHTTPアクセス
//!
//! カタログ取得と画像ダウンロードは `CardSearch` / `ImageSource` トレイト越しに
//! HTTPへアクセスするため、テストではネットワーク無しの実装に差し替えられる。

use reqwest::header::{ACCEPT, USER_AGENT};
use std::time::Duration;

use crate::catalog::SearchPage;
use crate::error::PipelineError;

/// 検索APIの1ページを取得する
#[allow(async_fn_in_trait)]
pub trait CardSearch {
    async fn fetch_page(&self, url: &str) -> Result<SearchPage, PipelineError>;
}

/// 画像のバイト列を取得する
#[allow(async_fn_in_trait)]
pub trait ImageSource {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// reqwestベースのHTTPクライアント
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response, PipelineError> {
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, accept)
            .send()
            .await?;
        check_response(resp).await
    }
}

impl CardSearch for HttpClient {
    async fn fetch_page(&self, url: &str) -> Result<SearchPage, PipelineError> {
        let resp = self.get(url, "application/json").await?;
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| PipelineError::Parse(format!("search page: {e}")))
    }
}

impl ImageSource for HttpClient {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let resp = self.get(url, "image/*").await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// ステータスコードを確認し、成功以外は [`PipelineError::Api`] に変換
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
    if !resp.status().is_success() {
        return Err(PipelineError::Api {
            status: resp.status().as_u16(),
            message: resp.text().await.unwrap_or_default(),
        });
    }
    Ok(resp)
}
