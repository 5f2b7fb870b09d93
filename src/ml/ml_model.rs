//! 機械学習モデルの共通定義
//!
//! カード画像の色分類用CNNモデル、分類モデル共通のトレイト、
//! 画像の前処理（レターボックス＋正規化）を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        loss::CrossEntropyLossConfig,
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use std::path::Path;

/// ImageNetの平均と標準偏差
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 分類モデル共通のインターフェース
///
/// 学習ループと推論エンジンはこのトレイト越しにモデルを扱う。
pub trait ColorNet<B: Backend>: Module<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// 順伝播と交差エントロピー損失
    fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        classification_output(self.forward(images), targets)
    }
}

/// ロジットと正解ラベルから損失付きの分類出力を作る
pub fn classification_output<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), targets.clone());

    ClassificationOutput::new(loss, output, targets)
}

/// CNNモデル設定
#[derive(Config, Debug)]
pub struct CardCnnConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

/// 全結合層の手前で揃える特徴マップのサイズ
const POOLED_SIZE: usize = 4;

impl CardCnnConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> CardCnn<B> {
        // 3x3 (padding 1) の畳み込みはサイズを保ち、プーリングごとに半分になる
        // size -> size/2 -> size/4 -> size/8 -> 適応平均プーリングで 4x4
        let d = 128 * POOLED_SIZE * POOLED_SIZE;
        tracing::debug!(
            "[Model] 入力サイズ: {}x{}, Pool3後: {}x{}, 特徴次元 d: {}",
            self.image_size,
            self.image_size,
            self.image_size / 8,
            self.image_size / 8,
            d
        );

        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        CardCnn {
            conv1: conv([3, 32]),
            conv2: conv([32, 64]),
            conv3: conv([64, 128]),
            conv4: conv([128, 128]),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            adaptive_pool: AdaptiveAvgPool2dConfig::new([POOLED_SIZE, POOLED_SIZE]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(d, 256).init(device),
            fc2: LinearConfig::new(256, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// カード色分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + ReLU + MaxPool 2x2} x 3層
/// - Conv 3x3 (padding 1) + ReLU
/// - AdaptiveAvgPool 4x4 -> Flatten (128 * 4 * 4 = 2048)
/// - Dropout -> FC: 2048 -> 256 + ReLU
/// - FC: 256 -> num_classes
#[derive(Module, Debug)]
pub struct CardCnn<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    conv2: Conv2d<B>, // 32 -> 64
    conv3: Conv2d<B>, // 64 -> 128
    conv4: Conv2d<B>, // 128 -> 128
    pool: MaxPool2d,
    adaptive_pool: AdaptiveAvgPool2d,
    dropout: Dropout,

    // 全結合層
    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> CardCnn<B> {
    /// 畳み込み部分の特徴マップ [batch_size, 128, size/8, size/8]
    pub fn conv_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));
        self.activation.forward(self.conv4.forward(x))
    }
}

impl<B: Backend> ColorNet<B> for CardCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.adaptive_pool.forward(self.conv_features(images));

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.dropout.forward(x);
        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }
}

/// 画像ファイルを読み込む（拡張子ではなく内容から形式を判定）
pub fn load_image(path: &Path) -> anyhow::Result<DynamicImage> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(img)
}

/// 縦横比を保ったまま縮小し、黒い正方形キャンバスの中央に配置する
pub fn letterbox(img: &DynamicImage, size: u32) -> RgbImage {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let scale = f64::min(size as f64 / width as f64, size as f64 / height as f64);
    let new_w = ((width as f64 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(size, size);
    let x = (size - new_w) / 2;
    let y = (size - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, x as i64, y as i64);
    canvas
}

/// ImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化する
pub fn normalize(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - MEAN[channel]) / STD[channel]);
            }
        }
    }

    data
}

/// 画像を読み込んで正規化
///
/// # 引数
/// - `path`: 画像ファイルのパス
/// - `size`: モデル入力サイズ
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn load_and_normalize_image(path: &Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let img = load_image(path)?;
    Ok(normalize(&letterbox(&img, size as u32)))
}
