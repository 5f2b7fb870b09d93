//! ResNet50による転移学習モデル
//!
//! ImageNet等で事前学習したResNet50 (v1.5) をバックボーンとして使い、
//! 色分類用の新しい分類ヘッドを学習します。
//! 事前学習済みの重みはburnのレコード形式（.mpk）で読み込みます。

use anyhow::Context;
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use std::path::Path;

use crate::ml::{classification_output, ColorNet};

/// ボトルネックブロックの出力チャネル倍率
const EXPANSION: usize = 4;

/// 各ステージのブロック数 (ResNet50)
const STAGE_BLOCKS: [usize; 4] = [3, 4, 6, 3];

/// バックボーンの出力特徴次元
pub const FEATURE_DIM: usize = 512 * EXPANSION;

/// 1x1 / 3x3 の畳み込み（バイアスなし、BatchNormが後続）
fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

/// 残差接続側のチャネル・解像度合わせ
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// ボトルネックブロック (1x1 -> 3x3 -> 1x1)
///
/// v1.5 と同じく、ストライドは3x3畳み込み側に置く。
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv([in_channels, out_channels], 1, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: conv([in_channels, planes], 1, 1, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv([planes, planes], 3, stride, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: conv([planes, out_channels], 1, 1, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.activation.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.activation.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        self.activation.forward(out + identity)
    }
}

/// ResNet50 バックボーン（全結合層を除く）
#[derive(Module, Debug)]
pub struct ResNet50Backbone<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    maxpool: MaxPool2d,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
    avgpool: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> ResNet50Backbone<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut in_channels = 64;
        let mut stages = Vec::with_capacity(STAGE_BLOCKS.len());

        for (i, blocks) in STAGE_BLOCKS.iter().enumerate() {
            let planes = 64 << i;
            let stride = if i == 0 { 1 } else { 2 };
            let mut stage = Vec::with_capacity(*blocks);
            for b in 0..*blocks {
                let block_stride = if b == 0 { stride } else { 1 };
                stage.push(Bottleneck::new(in_channels, planes, block_stride, device));
                in_channels = planes * EXPANSION;
            }
            stages.push(stage);
        }

        let mut stages = stages.into_iter();
        let mut next_stage = || stages.next().unwrap_or_default();

        Self {
            conv1: conv([3, 64], 7, 2, device),
            bn1: BatchNormConfig::new(64).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: next_stage(),
            layer2: next_stage(),
            layer3: next_stage(),
            layer4: next_stage(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    /// 画像 [batch, 3, H, W] -> 特徴ベクトル [batch, 2048]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);

        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }

        let x = self.avgpool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }
}

/// ResNet50 転移学習モデル設定
#[derive(Config, Debug)]
pub struct ResNet50Config {
    /// 分類クラス数
    pub num_classes: usize,
    /// 分類ヘッドのドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ResNet50Config {
    /// ランダム初期化でモデルを作成（推論時は重みを後から読み込む）
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet50Classifier<B> {
        ResNet50Classifier {
            backbone: ResNet50Backbone::new(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(FEATURE_DIM, self.num_classes).init(device),
        }
    }

    /// 学習用にモデルを作成
    ///
    /// - `backbone_weights`: 事前学習済みバックボーンのレコードファイル
    /// - `freeze_backbone`: trueの場合、バックボーンのパラメータは更新しない
    pub fn init_for_training<B: Backend>(
        &self,
        device: &B::Device,
        backbone_weights: Option<&Path>,
        freeze_backbone: bool,
    ) -> anyhow::Result<ResNet50Classifier<B>> {
        let mut model = self.init(device);

        match backbone_weights {
            Some(path) => {
                let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
                model.backbone = model
                    .backbone
                    .load_file(path.to_path_buf(), &recorder, device)
                    .map_err(|e| anyhow::anyhow!("{:?}", e))
                    .context(format!("バックボーンの重みを読み込めません: {}", path.display()))?;
                tracing::info!("事前学習済みバックボーンを読み込みました: {}", path.display());
            }
            None => {
                tracing::warn!("バックボーンの重みが指定されていません。ランダム初期化から学習します");
            }
        }

        // 固定した場合は forward_classification_frozen で学習すること
        if freeze_backbone {
            model.backbone = model.backbone.no_grad();
            tracing::info!("バックボーンを固定し、分類ヘッドのみ学習します");
        }

        Ok(model)
    }
}

/// ResNet50 バックボーン + 新しい分類ヘッド
#[derive(Module, Debug)]
pub struct ResNet50Classifier<B: Backend> {
    backbone: ResNet50Backbone<B>,
    dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> ColorNet<B> for ResNet50Classifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(self.dropout.forward(features))
    }
}

impl<B: AutodiffBackend> ResNet50Classifier<B> {
    /// バックボーン固定時の学習用順伝播
    ///
    /// バックボーンは推論モード（BatchNormは保存済みの統計を使い、更新しない）で通し、
    /// 勾配は分類ヘッドにだけ流す。
    pub fn forward_classification_frozen(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let features = Tensor::from_inner(self.backbone.valid().forward(images.inner()));
        classification_output(self.head.forward(self.dropout.forward(features)), targets)
    }
}
