//! モデル推論機能
//!
//! 保存済みモデルを読み込み、フォルダ内の画像を1枚ずつ分類します。
//! 1枚の失敗は記録して次の画像へ進み、全体は止めません。

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, ElementConversion, Tensor},
};

use crate::csv_loader;
use crate::download::has_image_extension;
use crate::ml::{load_and_normalize_image, CardCnn, CardCnnConfig, ColorNet, ResNet50Classifier, ResNet50Config};
use crate::model::{load_model_with_metadata, validate_confidence_threshold, Architecture, InferenceConfig};
use crate::progress::Progress;
use crate::types::PredictionResult;

/// 確信度が低い画像・読めない画像の仕分け先
pub const OTHER_FOLDER: &str = "Other";

/// メタデータの構成に応じて復元したモデル
enum LoadedModel<B: Backend> {
    Cnn(CardCnn<B>),
    ResNet50(ResNet50Classifier<B>),
}

impl<B: Backend> LoadedModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            LoadedModel::Cnn(model) => model.forward(images),
            LoadedModel::ResNet50(model) => model.forward(images),
        }
    }
}

/// 推論に失敗した画像
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceFailure {
    pub image_filename: String,
    pub reason: String,
}

/// フォルダ単位の推論結果
#[derive(Debug, Clone, Default)]
pub struct InferenceReport {
    pub predictions: Vec<PredictionResult>,
    pub failures: Vec<InferenceFailure>,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: LoadedModel<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path)
            .context(format!("モデルを読み込めません: {}", model_path.display()))?;
        let config = InferenceConfig::from_metadata(&metadata)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let model = match config.architecture {
            Architecture::Cnn => {
                let model = CardCnnConfig::new(config.num_classes())
                    .with_dropout(config.dropout)
                    .with_image_size(config.model_input_size)
                    .init::<B>(device);
                let record = Recorder::<B>::load(&recorder, model_binary, device)
                    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
                LoadedModel::Cnn(model.load_record(record))
            }
            Architecture::ResNet50 => {
                let model = ResNet50Config::new(config.num_classes())
                    .with_dropout(config.dropout)
                    .init::<B>(device);
                let record = Recorder::<B>::load(&recorder, model_binary, device)
                    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
                LoadedModel::ResNet50(model.load_record(record))
            }
        };

        tracing::info!(
            "モデルを読み込みました: {} ({}, {} クラス)",
            model_path.display(),
            config.architecture,
            config.num_classes()
        );

        Ok(Self {
            model,
            config,
            device: device.clone(),
        })
    }

    /// 単一画像を分類
    pub fn classify_image(&self, image_path: &Path) -> Result<PredictionResult> {
        let size = self.config.model_input_size;
        let image_data = load_and_normalize_image(image_path, size)?;

        // [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device).reshape([1, 3, size, size]);

        let probabilities = softmax(self.model.forward(tensor), 1);
        let class_idx = probabilities.clone().argmax(1).into_scalar().elem::<i64>() as usize;
        let confidence = probabilities.max_dim(1).into_scalar().elem::<f32>();
        let predicted_label = self
            .config
            .class_index_to_label(class_idx)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?;

        Ok(PredictionResult {
            image_filename: file_name(image_path),
            predicted_label,
            confidence,
        })
    }

    /// フォルダ内の画像を名前順に分類
    pub fn classify_directory(&self, image_dir: &Path) -> Result<InferenceReport> {
        let images = list_images(image_dir)?;
        tracing::info!("{} 枚の画像を分類します", images.len());

        let progress = Progress::bar(images.len() as u64, "分類中");
        let mut report = InferenceReport::default();

        for path in images {
            match self.classify_image(&path) {
                Ok(prediction) => {
                    tracing::debug!(
                        "{} -> {} ({:.3})",
                        prediction.image_filename,
                        prediction.predicted_label,
                        prediction.confidence
                    );
                    report.predictions.push(prediction);
                }
                Err(e) => {
                    tracing::warn!("分類に失敗しました {}: {:#}", path.display(), e);
                    report.failures.push(InferenceFailure {
                        image_filename: file_name(&path),
                        reason: format!("{:#}", e),
                    });
                }
            }
            progress.inc(1);
        }

        progress.finish(&format!(
            "{} 枚分類, {} 枚失敗",
            report.predictions.len(),
            report.failures.len()
        ));
        Ok(report)
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// フォルダ直下の画像ファイルを名前順に列挙（サブフォルダは対象外）
pub fn list_images(image_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(image_dir)
        .context(format!("フォルダを読み込めません: {}", image_dir.display()))?;

    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// 推論結果をCSVに書き出す（image_filename,predicted_label,confidence）
pub fn write_predictions_csv(path: &Path, predictions: &[PredictionResult]) -> Result<()> {
    csv_loader::write_rows(path, predictions)
        .context(format!("推論結果を書き出せません: {}", path.display()))?;
    tracing::info!("{} 件の推論結果を {} に保存しました", predictions.len(), path.display());
    Ok(())
}

/// 画像をラベル名のサブフォルダへ移動する
///
/// 確信度が `threshold` 未満の画像と分類に失敗した画像は `Other` に移動する。
/// 戻り値はフォルダごとの枚数。
pub fn sort_into_folders(image_dir: &Path, report: &InferenceReport, threshold: f32) -> Result<BTreeMap<String, usize>> {
    let destinations = report
        .predictions
        .iter()
        .map(|p| {
            let folder = if p.confidence >= threshold {
                p.predicted_label.as_str()
            } else {
                OTHER_FOLDER
            };
            (p.image_filename.as_str(), folder)
        })
        .chain(report.failures.iter().map(|f| (f.image_filename.as_str(), OTHER_FOLDER)));

    let mut counts = BTreeMap::new();
    for (filename, folder) in destinations {
        let dest_dir = image_dir.join(folder);
        std::fs::create_dir_all(&dest_dir)?;
        std::fs::rename(image_dir.join(filename), dest_dir.join(filename))
            .context(format!("{} を {} に移動できません", filename, folder))?;
        *counts.entry(folder.to_string()).or_insert(0) += 1;
    }

    for (folder, count) in &counts {
        tracing::info!("{}: {} 枚", folder, count);
    }
    Ok(counts)
}

/// 推論結果を表形式で表示
pub fn print_predictions(report: &InferenceReport) {
    println!("\n{:<48} {:<12} {:>10}", "画像", "予測", "確信度");
    for p in &report.predictions {
        println!(
            "{:<48} {:<12} {:>9.1}%",
            p.image_filename,
            p.predicted_label.as_str(),
            p.confidence * 100.0
        );
    }
    for f in &report.failures {
        println!("{:<48} {:<12} {}", f.image_filename, "ERROR", f.reason);
    }
    println!(
        "\n合計: {} 枚分類, {} 枚失敗",
        report.predictions.len(),
        report.failures.len()
    );
}

/// 推論の入力と出力オプション
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub model_path: PathBuf,
    pub image_dir: PathBuf,
    /// 指定された場合は推論結果をCSVに書き出す
    pub csv_output: Option<PathBuf>,
    /// 画像をラベル別フォルダへ移動する
    pub sort: bool,
    pub confidence_threshold: f32,
}

/// モデルを読み込んでフォルダを分類し、CSV出力・仕分けまで行う
pub fn run_inference<B: Backend>(device: &B::Device, request: &PredictRequest) -> Result<InferenceReport> {
    validate_confidence_threshold(request.confidence_threshold)?;
    let engine = InferenceEngine::<B>::load(&request.model_path, device)?;
    let report = engine.classify_directory(&request.image_dir)?;

    if let Some(csv_path) = &request.csv_output {
        write_predictions_csv(csv_path, &report.predictions)?;
    }
    if request.sort {
        sort_into_folders(&request.image_dir, &report, request.confidence_threshold)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColorLabel;

    fn prediction(name: &str, label: ColorLabel, confidence: f32) -> PredictionResult {
        PredictionResult {
            image_filename: name.into(),
            predicted_label: label,
            confidence,
        }
    }

    #[test]
    fn test_list_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.JPG", "c.jpeg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let names: Vec<String> = list_images(dir.path()).unwrap().iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.jpeg"]);
    }

    #[test]
    fn test_sort_into_folders_uses_threshold() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["sure.png", "unsure.png", "broken.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let report = InferenceReport {
            predictions: vec![
                prediction("sure.png", ColorLabel::Green, 0.91),
                prediction("unsure.png", ColorLabel::Red, 0.42),
            ],
            failures: vec![InferenceFailure {
                image_filename: "broken.png".into(),
                reason: "decode error".into(),
            }],
        };

        let counts = sort_into_folders(dir.path(), &report, 0.70).unwrap();

        assert!(dir.path().join("Green/sure.png").is_file());
        assert!(dir.path().join("Other/unsure.png").is_file());
        assert!(dir.path().join("Other/broken.png").is_file());
        assert!(!dir.path().join("sure.png").exists());
        assert_eq!(counts.get("Green"), Some(&1));
        assert_eq!(counts.get(OTHER_FOLDER), Some(&2));
    }

    #[test]
    fn test_predictions_csv_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        write_predictions_csv(&path, &[prediction("a.png", ColorLabel::Blue, 0.5)]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("image_filename,predicted_label,confidence\n"));
        assert!(text.contains("a.png,Blue,0.5"));
    }

    #[test]
    fn test_load_missing_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let result = InferenceEngine::<burn::backend::NdArray<f32>>::load(&dir.path().join("none.tar.gz"), &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_inference_rejects_out_of_range_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let request = PredictRequest {
            model_path: dir.path().join("model.tar.gz"),
            image_dir: dir.path().to_path_buf(),
            csv_output: None,
            sort: true,
            confidence_threshold: 1.5,
        };
        let error = run_inference::<burn::backend::NdArray<f32>>(&Default::default(), &request).unwrap_err();
        assert!(format!("{error:#}").contains("confidence_threshold"));
    }
}
