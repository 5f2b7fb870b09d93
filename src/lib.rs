//! カードカタログの取得から色分類モデルの学習・推論までのパイプライン
//!
//! 各ステップはファイルを入力・出力とする独立したバッチ処理で、
//! 何度実行し直しても同じ結果になります。
//!
//! - [`catalog`]: Standardで使えるカードの一覧を取得
//! - [`download`]: カード画像のダウンロード
//! - [`metadata`]: 画像ファイル名と色ラベルの対応表を作成
//! - [`split`] / [`stats`]: データセット分割とラベル分布
//! - `ml`: CNN / ResNet50 の学習と推論（`ml` フィーチャー）
//! - [`model`]: 設定とモデルファイルの永続化

pub mod catalog;
pub mod csv_loader;
pub mod dialog;
pub mod download;
pub mod error;
pub mod http;
pub mod metadata;
pub mod model;
pub mod progress;
pub mod split;
pub mod stats;
pub mod types;

#[cfg(feature = "ml")]
pub mod ml;

pub use error::PipelineError;
pub use types::{CardRecord, Color, ColorIdentity, ColorLabel, MetadataRow, PredictionResult};
