//! モデル学習
//!
//! メタデータCSVから学習データセットを作り、CNNまたはResNet50を学習して
//! 重みとメタデータを1つの tar.gz に保存します。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    train::ClassificationOutput,
};

use crate::csv_loader;
use crate::metadata::validate_rows;
use crate::ml::{load_and_normalize_image, CardCnnConfig, ColorNet, ResNet50Classifier, ResNet50Config};
use crate::model::{save_model_with_metadata, Architecture, ModelMetadata, TrainingSettings};
use crate::progress::Progress;
use crate::types::{ColorLabel, MetadataRow};

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct CardDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    // データセット分割用のインデックス範囲
    start_idx: usize,
    end_idx: usize,
}

impl CardDataset {
    /// メタデータの行からデータセットを作る
    pub fn from_rows(image_dir: &Path, rows: &[MetadataRow]) -> Self {
        let samples: Vec<(PathBuf, usize)> = rows
            .iter()
            .map(|row| (image_dir.join(&row.image_filename), row.label.class_id()))
            .collect();

        let len = samples.len();
        Self {
            samples,
            start_idx: 0,
            end_idx: len,
        }
    }

    /// クラスID順の枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; ColorLabel::ALL.len()];
        for (_, class_id) in &self.samples[self.start_idx..self.end_idx] {
            if let Some(count) = counts.get_mut(*class_id) {
                *count += 1;
            }
        }
        counts
    }

    /// データセットを学習用と検証用に分割（インデックス範囲のみ）
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut samples = self.samples[self.start_idx..self.end_idx].to_vec();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let train_len = (total_len as f32 * train_ratio) as usize;

        let train_dataset = Self {
            samples: samples.clone(),
            start_idx: 0,
            end_idx: train_len,
        };

        let val_dataset = Self {
            samples,
            start_idx: train_len,
            end_idx: total_len,
        };

        (train_dataset, val_dataset)
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct CardItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<CardItem> for CardDataset {
    fn get(&self, index: usize) -> Option<CardItem> {
        let actual_index = self.start_idx + index;
        if actual_index >= self.end_idx {
            return None;
        }

        let (path, label) = self.samples.get(actual_index)?;
        Some(CardItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// バッチャー
///
/// 読めない画像はゼロで埋めてバッチの形を保ち、パスを `CardBatch::failed` に残す。
/// 学習・検証側はこれを見て中断する。
#[derive(Clone)]
pub struct CardBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> CardBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, CardItem, CardBatch<B>> for CardBatcher<B> {
    fn batch(&self, items: Vec<CardItem>, _device: &B::Device) -> CardBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut labels = Vec::with_capacity(batch_size);
        let mut failed = Vec::new();

        for item in items {
            match load_and_normalize_image(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                    failed.push((item.path, format!("{:#}", e)));
                }
            }
            labels.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        CardBatch { images, targets, failed }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct CardBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// 読み込めなかった画像（パス, 理由）
    pub failed: Vec<(PathBuf, String)>,
}

impl<B: Backend> CardBatch<B> {
    /// 1枚でも読めない画像があればエラー
    fn ensure_loaded(&self) -> Result<()> {
        match self.failed.as_slice() {
            [] => Ok(()),
            [(path, reason), rest @ ..] => anyhow::bail!(
                "学習画像を読み込めません: {} ({}) ほか {} 枚",
                path.display(),
                reason,
                rest.len()
            ),
        }
    }
}

/// 1エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// 検証データが無い場合はNone
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// 損失と正解数の集計
#[derive(Debug, Default)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl RunningMetrics {
    fn update<B: Backend>(&mut self, item: &ClassificationOutput<B>) {
        let [batch_size, _] = item.output.dims();
        let loss = item.loss.clone().into_scalar().elem::<f64>();
        let correct = item
            .output
            .clone()
            .argmax(1)
            .reshape([batch_size])
            .equal(item.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.seen += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.loss_sum / self.seen as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.correct as f64 / self.seen as f64
        }
    }
}

/// 検証データで損失と正解率を計算（勾配なし）
fn evaluate<B: Backend, M: ColorNet<B>>(
    model: &M,
    dataset: &CardDataset,
    device: &B::Device,
    settings: &TrainingSettings,
) -> Result<Option<(f64, f64)>> {
    if dataset.is_empty() {
        return Ok(None);
    }

    let batcher = CardBatcher::<B>::new(device.clone(), settings.image_size);
    let items: Vec<CardItem> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
    let mut metrics = RunningMetrics::default();

    for chunk in items.chunks(settings.batch_size) {
        let batch = batcher.batch(chunk.to_vec(), device);
        batch.ensure_loaded()?;
        let item = model.forward_classification(batch.images, batch.targets);
        metrics.update(&item);
    }

    Ok(Some((metrics.loss(), metrics.accuracy())))
}

/// 学習ループ
///
/// エポックごとに学習データを1周し、検証データで評価する。
/// `step` はバッチ1つ分の順伝播と損失計算。
fn fit<B, M, F>(
    mut model: M,
    device: &B::Device,
    train: CardDataset,
    val: &CardDataset,
    settings: &TrainingSettings,
    step: F,
) -> Result<(M, Vec<EpochMetrics>)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ColorNet<B>,
    M::InnerModule: ColorNet<B::InnerBackend>,
    F: Fn(&M, Tensor<B, 4>, Tensor<B, 1, Int>) -> ClassificationOutput<B>,
{
    let batches_per_epoch = train.len().div_ceil(settings.batch_size) as u64;

    let dataloader_train = DataLoaderBuilder::new(CardBatcher::<B>::new(device.clone(), settings.image_size))
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(train);

    let mut optim = AdamConfig::new().init::<B, M>();
    let mut history = Vec::with_capacity(settings.num_epochs);

    for epoch in 1..=settings.num_epochs {
        let progress = Progress::bar(
            batches_per_epoch,
            &format!("エポック {}/{}", epoch, settings.num_epochs),
        );
        let mut metrics = RunningMetrics::default();

        for batch in dataloader_train.iter() {
            batch.ensure_loaded()?;
            let item = step(&model, batch.images, batch.targets);
            metrics.update(&item);

            let grads = GradientsParams::from_grads(item.loss.backward(), &model);
            model = optim.step(settings.learning_rate, model, grads);

            progress.set_message(&format!("loss {:.4}", metrics.loss()));
            progress.inc(1);
        }

        let valid = evaluate::<B::InnerBackend, _>(&model.valid(), val, device, settings)?;
        let result = EpochMetrics {
            epoch,
            train_loss: metrics.loss(),
            train_accuracy: metrics.accuracy(),
            val_loss: valid.map(|(loss, _)| loss),
            val_accuracy: valid.map(|(_, accuracy)| accuracy),
        };
        progress.finish(&format!(
            "loss {:.4} / acc {:.1}%",
            result.train_loss,
            result.train_accuracy * 100.0
        ));

        match (result.val_loss, result.val_accuracy) {
            (Some(val_loss), Some(val_accuracy)) => tracing::info!(
                "エポック {}/{}: train_loss={:.4} train_acc={:.3} val_loss={:.4} val_acc={:.3}",
                epoch,
                settings.num_epochs,
                result.train_loss,
                result.train_accuracy,
                val_loss,
                val_accuracy
            ),
            _ => tracing::info!(
                "エポック {}/{}: train_loss={:.4} train_acc={:.3}",
                epoch,
                settings.num_epochs,
                result.train_loss,
                result.train_accuracy
            ),
        }
        history.push(result);
    }

    Ok((model, history))
}

/// 学習済みモデルの重みをバイト列にする（f32精度）
fn export_record<B, M>(model: M) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B::InnerBackend>::record(&recorder, model.valid().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// 学習の入力と出力先
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub image_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub output_path: PathBuf,
    pub settings: TrainingSettings,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 実際に保存したモデルファイル
    pub model_path: PathBuf,
    pub train_samples: usize,
    pub val_samples: usize,
    /// メタデータから除外した行数（画像なし）
    pub dropped_rows: usize,
    pub history: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn final_metrics(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }
}

/// モデル学習を実行
///
/// 途中で失敗した場合はモデルファイルを書き出さない。
pub fn train_model<B: AutodiffBackend>(device: &B::Device, request: &TrainingRequest) -> Result<TrainingReport> {
    let settings = &request.settings;
    settings.validate()?;

    let rows = csv_loader::load_metadata_rows(&request.metadata_path)
        .context(format!("メタデータを読み込めません: {}", request.metadata_path.display()))?;
    let (rows, dropped) = validate_rows(rows, &request.image_dir);
    if rows.is_empty() {
        anyhow::bail!(
            "学習に使える画像がありません（{} と {} を確認してください）",
            request.metadata_path.display(),
            request.image_dir.display()
        );
    }

    let dataset = CardDataset::from_rows(&request.image_dir, &rows);
    for (label, count) in ColorLabel::ALL.iter().zip(dataset.class_counts()) {
        tracing::info!("  クラス '{}': {} 枚", label, count);
    }

    let (dataset_train, dataset_val) = dataset.split(settings.train_ratio, settings.seed);
    if dataset_train.is_empty() {
        anyhow::bail!("学習データが0枚です（train_ratio={}）", settings.train_ratio);
    }
    let train_samples = dataset_train.len();
    let val_samples = dataset_val.len();

    tracing::info!("学習データ: {} 枚", train_samples);
    tracing::info!("検証データ: {} 枚", val_samples);
    tracing::info!(
        "モデル: {}, 入力サイズ: {}x{}, エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.architecture,
        settings.image_size,
        settings.image_size,
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    let num_classes = ColorLabel::ALL.len();
    let (model_binary, history) = match settings.architecture {
        Architecture::Cnn => {
            let model = CardCnnConfig::new(num_classes)
                .with_dropout(settings.dropout)
                .with_image_size(settings.image_size)
                .init::<B>(device);
            let (model, history) = fit::<B, _, _>(model, device, dataset_train, &dataset_val, settings, |m, x, y| {
                m.forward_classification(x, y)
            })?;
            (export_record::<B, _>(model)?, history)
        }
        Architecture::ResNet50 => {
            let model = ResNet50Config::new(num_classes)
                .with_dropout(settings.dropout)
                .init_for_training::<B>(
                    device,
                    settings.backbone_weights.as_deref().map(Path::new),
                    settings.freeze_backbone,
                )?;
            // 凍結時はバックボーンを推論モードで通し、BatchNormの統計も更新しない
            let step: fn(&ResNet50Classifier<B>, Tensor<B, 4>, Tensor<B, 1, Int>) -> ClassificationOutput<B> =
                if settings.freeze_backbone {
                    ResNet50Classifier::forward_classification_frozen
                } else {
                    |m, x, y| m.forward_classification(x, y)
                };
            let (model, history) = fit::<B, _, _>(model, device, dataset_train, &dataset_val, settings, step)?;
            (export_record::<B, _>(model)?, history)
        }
    };

    let mut metadata = ModelMetadata::new(
        settings.architecture,
        ColorLabel::class_names(),
        settings.image_size as u32,
        settings.dropout,
        settings.num_epochs as u32,
        settings.batch_size as u32,
        settings.learning_rate,
    );
    metadata.train_samples = train_samples as u32;
    metadata.val_samples = val_samples as u32;
    metadata.val_accuracy = history.last().and_then(|m| m.val_accuracy);

    let model_path = save_model_with_metadata(&request.output_path, &metadata, &model_binary)?;
    tracing::info!(
        "学習完了: {} に保存しました ({:.2} MB)",
        model_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    Ok(TrainingReport {
        model_path,
        train_samples,
        val_samples,
        dropped_rows: dropped.len(),
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::load_model_with_metadata;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn rows(n: usize) -> Vec<MetadataRow> {
        (0..n)
            .map(|i| MetadataRow {
                image_filename: format!("card{i}.png"),
                label: ColorLabel::ALL[i % ColorLabel::ALL.len()],
            })
            .collect()
    }

    fn write_images(dir: &Path, rows: &[MetadataRow]) {
        for (i, row) in rows.iter().enumerate() {
            let shade = (i * 30 % 255) as u8;
            let img = image::RgbImage::from_pixel(20, 28, image::Rgb([shade, 255 - shade, 128]));
            img.save(dir.join(&row.image_filename)).unwrap();
        }
    }

    #[test]
    fn test_split_is_seeded_and_disjoint() {
        let dataset = CardDataset::from_rows(Path::new("imgs"), &rows(10));
        let (train, val) = dataset.clone().split(0.8, 42);
        let (train2, _) = dataset.split(0.8, 42);

        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);

        let paths = |d: &CardDataset| -> Vec<PathBuf> { (0..d.len()).filter_map(|i| d.get(i)).map(|i| i.path).collect() };
        assert_eq!(paths(&train), paths(&train2));
        for path in paths(&val) {
            assert!(!paths(&train).contains(&path));
        }
        assert!(val.get(2).is_none());
    }

    #[test]
    fn test_class_counts() {
        let dataset = CardDataset::from_rows(Path::new("imgs"), &rows(9));
        // White と Blue だけ 2 枚
        assert_eq!(dataset.class_counts(), vec![2, 2, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_batcher_reports_unreadable_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();
        let good = rows(1);
        write_images(dir.path(), &good);

        let device: <NdArray<f32> as Backend>::Device = Default::default();
        let batcher = CardBatcher::<NdArray<f32>>::new(device.clone(), 16);
        let batch = batcher.batch(
            vec![
                CardItem {
                    path: dir.path().join(&good[0].image_filename),
                    label: 0,
                },
                CardItem {
                    path: dir.path().join("broken.png"),
                    label: 3,
                },
            ],
            &device,
        );

        assert_eq!(batch.images.dims(), [2, 3, 16, 16]);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].0, dir.path().join("broken.png"));
        assert!(batch.ensure_loaded().is_err());
    }

    #[test]
    fn test_running_metrics_counts_correct_predictions() {
        let device: <NdArray<f32> as Backend>::Device = Default::default();
        let output = Tensor::<NdArray<f32>, 2>::from_floats([[0.1, 2.0, 0.3], [1.5, 0.2, 0.1], [0.0, 0.1, 0.9]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([1, 2, 2], &device);
        let loss = Tensor::<NdArray<f32>, 1>::from_floats([0.5], &device);

        let mut metrics = RunningMetrics::default();
        metrics.update(&ClassificationOutput::new(loss, output, targets));

        assert_eq!(metrics.seen, 3);
        assert_eq!(metrics.correct, 2);
        assert!((metrics.loss() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_train_model_aborts_on_corrupt_image() {
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut rows = rows(8);
        write_images(images.path(), &rows);
        std::fs::write(images.path().join("bad.png"), b"garbage").unwrap();
        rows.push(MetadataRow {
            image_filename: "bad.png".into(),
            label: ColorLabel::Red,
        });
        let metadata_path = images.path().join("metadata.csv");
        csv_loader::save_metadata_rows(&metadata_path, &rows).unwrap();

        let request = TrainingRequest {
            image_dir: images.path().to_path_buf(),
            metadata_path,
            output_path: out.path().join("model"),
            settings: TrainingSettings {
                num_epochs: 1,
                batch_size: 4,
                num_workers: 1,
                image_size: 32,
                ..Default::default()
            },
        };

        let error = train_model::<TestBackend>(&Default::default(), &request).unwrap_err();
        assert!(format!("{error:#}").contains("bad.png"));
        assert!(!out.path().join("model.tar.gz").exists());
    }

    #[test]
    fn test_train_model_writes_archive() {
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let rows = rows(8);
        write_images(images.path(), &rows);
        let metadata_path = images.path().join("metadata.csv");
        csv_loader::save_metadata_rows(&metadata_path, &rows).unwrap();

        let request = TrainingRequest {
            image_dir: images.path().to_path_buf(),
            metadata_path,
            output_path: out.path().join("model"),
            settings: TrainingSettings {
                num_epochs: 1,
                batch_size: 4,
                num_workers: 1,
                image_size: 32,
                train_ratio: 0.75,
                ..Default::default()
            },
        };

        let report = train_model::<TestBackend>(&Default::default(), &request).unwrap();
        assert_eq!(report.train_samples, 6);
        assert_eq!(report.val_samples, 2);
        assert_eq!(report.history.len(), 1);
        assert!(report.final_metrics().unwrap().val_accuracy.is_some());
        assert_eq!(report.model_path, out.path().join("model.tar.gz"));

        let (metadata, binary) = load_model_with_metadata(&report.model_path).unwrap();
        assert_eq!(metadata.architecture, Architecture::Cnn);
        assert_eq!(metadata.class_labels, ColorLabel::class_names());
        assert_eq!(metadata.model_input_size, 32);
        assert_eq!(metadata.train_samples, 6);
        assert!(!binary.is_empty());
    }

    #[test]
    fn test_train_model_without_images_fails_without_output() {
        let images = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let metadata_path = images.path().join("metadata.csv");
        csv_loader::save_metadata_rows(&metadata_path, &rows(4)).unwrap();

        let request = TrainingRequest {
            image_dir: images.path().to_path_buf(),
            metadata_path,
            output_path: out.path().join("model"),
            settings: TrainingSettings::default(),
        };

        assert!(train_model::<TestBackend>(&Default::default(), &request).is_err());
        assert!(!out.path().join("model.tar.gz").exists());
    }
}
