use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use planeswalker_lib::model::Architecture;

/// カードカタログ取得から色分類モデルの学習・推論までを行うCLI
#[derive(Debug, Parser)]
#[command(name = "planeswalker", version, about)]
pub struct Cli {
    /// 設定ファイル（省略時は ./config.json）
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// デバッグログを表示
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// エラー以外の出力と進捗表示を抑制
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Standardで使えるカードの一覧を取得してCSVに保存
    Fetch(FetchArgs),
    /// カタログの全カードの画像をダウンロード
    Download(DownloadArgs),
    /// 画像ファイル名と色ラベルのメタデータCSVを作成
    Metadata(MetadataArgs),
    /// 画像を train / val / test に分割
    Split(SplitArgs),
    /// 色の組み合わせ・ラベルの分布を表示
    Stats(StatsArgs),
    /// 色分類モデルを学習
    Train(TrainArgs),
    /// モデルファイルのメタデータを表示
    Inspect(InspectArgs),
    /// フォルダ内の画像を分類
    Predict(PredictArgs),
    /// 現在の設定を表示（--init でデフォルト設定を書き出す）
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// 出力CSV（省略時は設定の catalog.output_path）
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// 検索クエリを上書き
    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// カタログCSV
    #[arg(short, long)]
    pub catalog: Option<PathBuf>,
    /// 画像の保存先フォルダ
    #[arg(short, long)]
    pub dest: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct MetadataArgs {
    /// カタログCSV（省略時は設定の catalog.output_path）
    #[arg(short, long)]
    pub catalog: Option<PathBuf>,
    /// 画像フォルダ
    #[arg(short, long)]
    pub images: Option<PathBuf>,
    /// 出力CSV
    #[arg(short, long, default_value = "card_metadata.csv")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct SplitArgs {
    /// 画像フォルダ
    #[arg(short, long)]
    pub images: Option<PathBuf>,
    /// メタデータCSV
    #[arg(short, long, default_value = "card_metadata.csv")]
    pub metadata: PathBuf,
    /// 出力先（train/ val/ test/ とラベルCSVを作成）
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// シャッフルのシード（省略時は設定の training.seed）
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    /// カタログCSV: 色の組み合わせごとの枚数
    #[arg(short, long)]
    pub catalog: Option<PathBuf>,
    /// メタデータCSV: ラベルごとの枚数
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct TrainArgs {
    /// 画像フォルダ
    #[arg(short, long)]
    pub images: Option<PathBuf>,
    /// メタデータCSV
    #[arg(short, long, default_value = "card_metadata.csv")]
    pub metadata: PathBuf,
    /// 出力モデル（.tar.gz が付与される）
    #[arg(short, long, default_value = "color_classifier.tar.gz")]
    pub output: PathBuf,
    /// モデル構成
    #[arg(short, long, value_enum)]
    pub architecture: Option<Architecture>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    /// 入力画像サイズ
    #[arg(long)]
    pub image_size: Option<usize>,
    /// 事前学習済みResNet50バックボーン（burnレコード .mpk）
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,
    /// バックボーンも含めて全体を学習する
    #[arg(long)]
    pub fine_tune: bool,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// モデルファイル
    pub model: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    /// モデルファイル
    #[arg(short, long)]
    pub model: Option<PathBuf>,
    /// 分類する画像のフォルダ
    #[arg(short, long)]
    pub images: Option<PathBuf>,
    /// 推論結果をCSVに書き出す
    #[arg(long)]
    pub csv: Option<PathBuf>,
    /// 画像をラベル別のサブフォルダへ移動する
    #[arg(long)]
    pub sort: bool,
    /// 仕分けの確信度しきい値（省略時は設定の inference.confidence_threshold）
    #[arg(long)]
    pub threshold: Option<f32>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// デフォルト設定を設定ファイルに書き出す
    #[arg(long)]
    pub init: bool,
}
