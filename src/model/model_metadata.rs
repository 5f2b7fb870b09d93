//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//! 推論時はここに記録された構成・ラベル順・入力サイズでモデルを復元します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデル構成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// ランダム初期化の小規模CNN
    Cnn,
    /// ResNet50バックボーン + 新しい分類ヘッド
    #[value(name = "resnet50")]
    ResNet50,
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Cnn
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Cnn => write!(f, "cnn"),
            Architecture::ResNet50 => write!(f, "resnet50"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデル構成
    pub architecture: Architecture,

    /// クラスID順のラベル
    /// 例: ["White", "Blue", "Black", "Red", "Green", "Colorless", "Multicolor"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub model_input_size: u32,

    /// 分類ヘッドのドロップアウト率
    #[serde(default)]
    pub dropout: f64,

    /// 学習エポック数
    pub num_epochs: u32,

    pub batch_size: u32,

    pub learning_rate: f64,

    /// 学習・検証に使用した枚数
    pub train_samples: u32,
    pub val_samples: u32,

    /// 最終エポック後の検証精度（検証データが無い場合はNone）
    #[serde(default)]
    pub val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: Architecture,
        class_labels: Vec<String>,
        model_input_size: u32,
        dropout: f64,
        num_epochs: u32,
        batch_size: u32,
        learning_rate: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            architecture,
            class_labels,
            model_input_size,
            dropout,
            num_epochs,
            batch_size,
            learning_rate,
            train_samples: 0,
            val_samples: 0,
            val_accuracy: None,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let mut metadata = ModelMetadata::new(
            Architecture::ResNet50,
            vec!["White".into(), "Blue".into()],
            224,
            0.5,
            3,
            16,
            1e-3,
        );
        metadata.val_accuracy = Some(0.75);

        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"architecture\": \"resnet50\""));

        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(restored.architecture, Architecture::ResNet50);
        assert_eq!(restored.num_classes(), 2);
        assert_eq!(restored.val_accuracy, Some(0.75));
    }

    #[test]
    fn test_rejects_unknown_architecture() {
        let json = r#"{"architecture":"vgg","class_labels":[],"model_input_size":1,
            "num_epochs":1,"batch_size":1,"learning_rate":0.1,"train_samples":0,
            "val_samples":0,"trained_at":"now"}"#;
        assert!(ModelMetadata::from_json_string(json).is_err());
    }
}
