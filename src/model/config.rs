//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・カタログ取得・ダウンロード・学習・推論の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::model_metadata::Architecture;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Cpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// カタログ取得設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// 検索APIのエンドポイント
    pub search_url: String,
    /// スタンダード適正カードの検索クエリ
    pub query: String,
    /// ページ取得間の待機時間（ミリ秒）
    pub page_delay_ms: u64,
    /// 出力CSVのパス
    pub output_path: String,
    pub user_agent: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            search_url: "https://api.scryfall.com/cards/search".to_string(),
            query: "game:paper legal:standard -is:promo -is:digital".to_string(),
            page_delay_ms: 100,
            output_path: "mtg_standard_cards.csv".to_string(),
            user_agent: concat!("planeswalker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// 画像ダウンロード設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// リクエストのタイムアウト（秒）
    pub timeout_secs: u64,
    /// リクエスト間の待機時間（ミリ秒）
    pub delay_ms: u64,
    /// 一時的な失敗に対する最大試行回数
    pub max_attempts: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            delay_ms: 100,
            max_attempts: 3,
        }
    }
}

impl DownloadSettings {
    /// 設定値の妥当性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs は1以上である必要があります");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts は1以上である必要があります");
        }
        Ok(())
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// モデル構成（cnn / resnet50）
    pub architecture: Architecture,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// モデル入力サイズ（正方形）
    pub image_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// ResNet50のバックボーンを固定するか
    pub freeze_backbone: bool,
    /// ResNet50の事前学習済み重み（burnレコード形式）
    pub backbone_weights: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            architecture: Architecture::Cnn,
            num_epochs: 10,
            batch_size: 16,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            image_size: 224,
            dropout: 0.5,
            freeze_backbone: true,
            backbone_weights: None,
        }
    }
}

impl TrainingSettings {
    /// 設定値の妥当性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_epochs == 0 {
            anyhow::bail!("num_epochs は1以上である必要があります");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size は1以上である必要があります");
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            anyhow::bail!("train_ratio は0と1の間である必要があります: {}", self.train_ratio);
        }
        if self.image_size < 32 {
            anyhow::bail!("入力サイズが小さすぎます: {} (最小32x32が必要)", self.image_size);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout は0以上1未満である必要があります: {}", self.dropout);
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate は正の値である必要があります");
        }
        Ok(())
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// 仕分け時にこの確信度未満の画像は "Other" に送る
    pub confidence_threshold: f32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
        }
    }
}

impl InferenceSettings {
    /// 設定値の妥当性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_confidence_threshold(self.confidence_threshold)
    }
}

/// 確信度しきい値は 0.0〜1.0
pub fn validate_confidence_threshold(threshold: f32) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        anyhow::bail!("confidence_threshold は0以上1以下である必要があります: {}", threshold);
    }
    Ok(())
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub catalog: CatalogSettings,
    pub download: DownloadSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    pub inference: InferenceSettings,
    /// 最後に使用した画像フォルダ（ダイアログの初期位置）
    pub last_image_dir: Option<String>,
    /// 最後に使用した出力ディレクトリ
    pub last_output_dir: Option<String>,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::debug!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(&Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 最後に使用した画像フォルダを更新
    pub fn update_last_image_dir<P: AsRef<Path>>(&mut self, path: P) {
        self.last_image_dir = Some(path.as_ref().to_string_lossy().to_string());
    }

    /// 最後に使用した出力ディレクトリを更新
    pub fn update_last_output_dir<P: AsRef<Path>>(&mut self, path: P) {
        self.last_output_dir = Some(path.as_ref().to_string_lossy().to_string());
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("検索クエリ: {}", self.catalog.query);
        println!("\n--- ダウンロード設定 ---");
        println!("タイムアウト: {}秒", self.download.timeout_secs);
        println!("待機時間: {}ms", self.download.delay_ms);
        println!("最大試行回数: {}", self.download.max_attempts);
        println!("\n--- トレーニング設定 ---");
        println!("モデル構成: {}", self.training.architecture);
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("入力サイズ: {}x{}", self.training.image_size, self.training.image_size);
        println!("\n--- 推論設定 ---");
        println!("確信度しきい値: {:.2}", self.inference.confidence_threshold);

        if let Some(ref dir) = self.last_image_dir {
            println!("\n最後に使用した画像フォルダ: {}", dir);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.download.max_attempts, 3);
        assert!(config.training.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.catalog.query, deserialized.catalog.query);
        assert_eq!(config.training.architecture, deserialized.training.architecture);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"training": {"architecture": "resnet50", "num_epochs": 3}}"#).unwrap();
        assert_eq!(config.training.architecture, Architecture::ResNet50);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.inference.confidence_threshold, 0.70);
    }

    #[test]
    fn test_invalid_training_settings() {
        let mut settings = TrainingSettings::default();
        settings.train_ratio = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = TrainingSettings::default();
        settings.image_size = 16;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unreadable_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[test]
    fn test_invalid_download_settings() {
        assert!(DownloadSettings::default().validate().is_ok());

        let mut settings = DownloadSettings::default();
        settings.timeout_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = DownloadSettings::default();
        settings.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_inference_settings() {
        assert!(InferenceSettings::default().validate().is_ok());
        for threshold in [-0.1, 1.5, f32::NAN] {
            let settings = InferenceSettings {
                confidence_threshold: threshold,
            };
            assert!(settings.validate().is_err(), "{threshold}");
        }
        assert!(validate_confidence_threshold(0.0).is_ok());
        assert!(validate_confidence_threshold(1.0).is_ok());
    }
}
