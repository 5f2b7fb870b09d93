use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};

use planeswalker_lib::dialog::{resolve_path, PickKind};
use planeswalker_lib::model::{load_metadata, print_metadata_info, AppConfig};
use planeswalker_lib::{catalog, csv_loader, download, metadata, progress, split, stats};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("planeswalker error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;
    progress::set_enabled(!cli.quiet);

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default_from(&config_path);

    match cli.command {
        Commands::Fetch(args) => {
            let mut settings = config.catalog.clone();
            if let Some(query) = args.query {
                settings.query = query;
            }
            let output = args.output.unwrap_or_else(|| PathBuf::from(&settings.output_path));
            let count = catalog::run_fetch(&settings, &output).await?;
            println!("{} 枚のカードを {} に保存しました", count, output.display());
        }
        Commands::Download(args) => {
            let catalog_path = args.catalog.unwrap_or_else(|| PathBuf::from(&config.catalog.output_path));
            let dest = pick_dir(&mut config, &config_path, args.dest, "画像の保存先フォルダ")?;
            let report =
                download::run_download(&config.download, &config.catalog.user_agent, &catalog_path, &dest).await?;
            println!(
                "ダウンロード: {} 枚, 既存: {} 枚, 失敗: {} 枚",
                report.downloaded,
                report.skipped_existing,
                report.failed.len()
            );
            for failure in &report.failed {
                println!("  {}: {}", failure.name, failure.reason);
            }
        }
        Commands::Metadata(args) => {
            let catalog_path = args.catalog.unwrap_or_else(|| PathBuf::from(&config.catalog.output_path));
            let images = pick_dir(&mut config, &config_path, args.images, "カード画像のフォルダ")?;
            let report = metadata::run_metadata(&catalog_path, &images, &args.output)?;
            println!(
                "{} 行を {} に保存しました（画像なし: {} 枚）",
                report.rows,
                args.output.display(),
                report.missing_images.len()
            );
        }
        Commands::Split(args) => {
            let images = pick_dir(&mut config, &config_path, args.images, "カード画像のフォルダ")?;
            let output = args.output.unwrap_or_else(|| images.join("dataset"));
            let rows = csv_loader::load_metadata_rows(&args.metadata)
                .context(format!("メタデータを読み込めません: {}", args.metadata.display()))?;
            let seed = args.seed.unwrap_or(config.training.seed);
            let report = split::split_dataset(&images, rows, &output, seed)?;
            println!(
                "train: {} 枚, val: {} 枚, test: {} 枚（コピー失敗: {} 枚）",
                report.train,
                report.val,
                report.test,
                report.failed.len()
            );
        }
        Commands::Stats(args) => {
            if args.catalog.is_none() && args.metadata.is_none() {
                anyhow::bail!("--catalog か --metadata を指定してください");
            }
            if let Some(path) = args.catalog {
                let cards = csv_loader::load_catalog(&path)?;
                stats::print_counts("色の組み合わせ", &stats::combination_counts(&cards));
            }
            if let Some(path) = args.metadata {
                let rows = csv_loader::load_metadata_rows(&path)?;
                stats::print_counts("ラベル", &stats::label_counts(&rows));
            }
        }
        Commands::Inspect(args) => {
            let model = resolve_path(args.model, PickKind::File, "モデルファイル", config.last_output_dir.as_deref())?;
            let metadata = load_metadata(&model)?;
            print_metadata_info(&metadata);
        }
        Commands::Config(args) => {
            if args.init {
                AppConfig::default().save(&config_path)?;
                println!("デフォルト設定を {} に書き出しました", config_path.display());
            } else {
                config.display();
            }
        }
        Commands::Train(args) => train(&mut config, &config_path, args)?,
        Commands::Predict(args) => predict(&mut config, &config_path, args)?,
    }

    Ok(())
}

/// フォルダ引数を解決し、ダイアログで選んだ場合は設定に記録する
fn pick_dir(config: &mut AppConfig, config_path: &Path, arg: Option<PathBuf>, title: &str) -> anyhow::Result<PathBuf> {
    let picked = arg.is_none();
    let dir = resolve_path(arg, PickKind::Folder, title, config.last_image_dir.as_deref())?;
    if picked {
        config.update_last_image_dir(&dir);
        remember(config, config_path);
    }
    Ok(dir)
}

fn remember(config: &AppConfig, config_path: &Path) {
    if let Err(e) = config.save(config_path) {
        tracing::warn!("設定を保存できませんでした ({}): {:#}", config_path.display(), e);
    }
}

#[cfg(feature = "ml")]
fn train(config: &mut AppConfig, config_path: &Path, args: cli::TrainArgs) -> anyhow::Result<()> {
    use planeswalker_lib::ml::{train_with_device_type, TrainingRequest};

    let image_dir = pick_dir(config, config_path, args.images, "学習に使う画像のフォルダ")?;

    let mut settings = config.training.clone();
    if let Some(architecture) = args.architecture {
        settings.architecture = architecture;
    }
    if let Some(epochs) = args.epochs {
        settings.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        settings.learning_rate = learning_rate;
    }
    if let Some(image_size) = args.image_size {
        settings.image_size = image_size;
    }
    if let Some(weights) = args.backbone_weights {
        settings.backbone_weights = Some(weights.to_string_lossy().into_owned());
    }
    if args.fine_tune {
        settings.freeze_backbone = false;
    }

    let request = TrainingRequest {
        image_dir,
        metadata_path: args.metadata,
        output_path: args.output,
        settings,
    };
    let report = train_with_device_type(config.device_type, &request)?;

    if let Some(parent) = report.model_path.parent() {
        config.update_last_output_dir(parent);
        remember(config, config_path);
    }

    println!("\n=== 学習結果 ===");
    println!("学習データ: {} 枚, 検証データ: {} 枚", report.train_samples, report.val_samples);
    if report.dropped_rows > 0 {
        println!("画像が無いため除外: {} 行", report.dropped_rows);
    }
    if let Some(last) = report.final_metrics() {
        println!("学習 loss: {:.4}, 正解率: {:.1}%", last.train_loss, last.train_accuracy * 100.0);
        if let (Some(loss), Some(accuracy)) = (last.val_loss, last.val_accuracy) {
            println!("検証 loss: {:.4}, 正解率: {:.1}%", loss, accuracy * 100.0);
        }
    }
    println!("モデル: {}", report.model_path.display());
    Ok(())
}

#[cfg(feature = "ml")]
fn predict(config: &mut AppConfig, config_path: &Path, args: cli::PredictArgs) -> anyhow::Result<()> {
    use planeswalker_lib::ml::{predict_with_device_type, print_predictions, PredictRequest};

    let model_path = resolve_path(args.model, PickKind::File, "モデルファイル", config.last_output_dir.as_deref())?;
    let image_dir = pick_dir(config, config_path, args.images, "分類する画像のフォルダ")?;

    let request = PredictRequest {
        model_path,
        image_dir,
        csv_output: args.csv,
        sort: args.sort,
        confidence_threshold: args.threshold.unwrap_or(config.inference.confidence_threshold),
    };
    let report = predict_with_device_type(config.device_type, &request)?;
    print_predictions(&report);
    Ok(())
}

#[cfg(not(feature = "ml"))]
fn train(_config: &mut AppConfig, _config_path: &Path, _args: cli::TrainArgs) -> anyhow::Result<()> {
    anyhow::bail!("このビルドは ml フィーチャーが無効です")
}

#[cfg(not(feature = "ml"))]
fn predict(_config: &mut AppConfig, _config_path: &Path, _args: cli::PredictArgs) -> anyhow::Result<()> {
    anyhow::bail!("このビルドは ml フィーチャーが無効です")
}

fn init_tracing(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
