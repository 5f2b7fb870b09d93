//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use anyhow::{Context, Result};
use std::path::Path;

use crate::model::model_metadata::{Architecture, ModelMetadata};
use crate::model::model_storage;
use crate::types::ColorLabel;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub architecture: Architecture,

    /// クラスID順のラベル
    pub class_labels: Vec<ColorLabel>,

    /// モデル入力解像度
    pub model_input_size: usize,

    pub dropout: f64,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    ///
    /// 未知のラベル名が含まれる場合はエラー。
    pub fn from_metadata(metadata: &ModelMetadata) -> Result<Self> {
        let class_labels = metadata
            .class_labels
            .iter()
            .map(|name| name.parse::<ColorLabel>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid class label in model metadata")?;

        if class_labels.is_empty() {
            anyhow::bail!("モデルメタデータにクラスラベルがありません");
        }
        if metadata.model_input_size == 0 {
            anyhow::bail!("モデル入力サイズが0です");
        }

        Ok(Self {
            architecture: metadata.architecture,
            class_labels,
            model_input_size: metadata.model_input_size as usize,
            dropout: metadata.dropout,
        })
    }

    /// モデルファイルから推論設定を読み込む
    pub fn load_from_model(model_path: &Path) -> Result<Self> {
        let metadata = model_storage::load_metadata(model_path)
            .context("Failed to load model metadata")?;
        Self::from_metadata(&metadata)
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<ColorLabel> {
        self.class_labels.get(index).copied()
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("モデル構成: {}", self.architecture);
        let labels: Vec<&str> = self.class_labels.iter().map(|l| l.as_str()).collect();
        println!("クラスラベル: {}", labels.join(", "));
        println!("モデル入力サイズ: {}x{}", self.model_input_size, self.model_input_size);
        println!("総クラス数: {}", self.num_classes());
        println!("==================");
    }
}
