//! パイプライン共通のエラー型

use thiserror::Error;

/// カタログ取得・画像ダウンロード・CSV処理で発生するエラー
#[derive(Debug, Error)]
pub enum PipelineError {
    /// HTTP通信エラー
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// APIが成功以外のステータスを返した
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// レスポンスの解析に失敗
    #[error("parse error: {0}")]
    Parse(String),

    /// 画像としてデコードできない
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// 入力値が不正
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// 再試行で回復しうるエラーか
    ///
    /// タイムアウト・接続エラー・429・5xx のみ対象。
    /// TLS・リクエスト組み立て・デコードのエラーは再試行しない。
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Http(e) => e.is_timeout() || e.is_connect(),
            PipelineError::Api { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}
