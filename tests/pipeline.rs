//! カタログ → 画像 → メタデータ（→ 学習 → 推論）の通しテスト

use std::io::Cursor;
use std::path::Path;

use planeswalker_lib::csv_loader;
use planeswalker_lib::download::{download_images, DownloadOptions};
use planeswalker_lib::error::PipelineError;
use planeswalker_lib::http::ImageSource;
use planeswalker_lib::metadata::run_metadata;
use planeswalker_lib::types::{CardRecord, Color, ColorIdentity, ColorLabel};

/// URLごとに色を変えたPNGを返す
struct PaletteImages;

impl ImageSource for PaletteImages {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        if url.contains("missing") {
            return Err(PipelineError::Api {
                status: 404,
                message: "not found".into(),
            });
        }
        let shade = (url.len() * 17 % 255) as u8;
        Ok(png_bytes(shade))
    }
}

fn png_bytes(shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(24, 34, image::Rgb([shade, 200, 255 - shade]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn card(name: &str, colors: &[Color], url: &str) -> CardRecord {
    CardRecord {
        name: name.into(),
        color_identity: ColorIdentity::new(colors.iter().copied()),
        image_url: url.into(),
    }
}

fn options(dest: &Path) -> DownloadOptions {
    DownloadOptions {
        dest_dir: dest.to_path_buf(),
        delay: std::time::Duration::ZERO,
        max_attempts: 1,
        retry_backoff: std::time::Duration::ZERO,
    }
}

#[test]
fn metadata_from_catalog_and_existing_images() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    std::fs::create_dir(&images).unwrap();
    std::fs::write(images.join("CardA.jpg"), b"a").unwrap();
    std::fs::write(images.join("CardB.jpg"), b"b").unwrap();

    let catalog = dir.path().join("mtg_standard_cards.csv");
    csv_loader::save_catalog(
        &catalog,
        &[
            card("Card A", &[Color::White], "https://img.example/a.jpg"),
            card("Card B", &[Color::White, Color::Blue], "https://img.example/b.jpg"),
        ],
    )
    .unwrap();

    let output = dir.path().join("card_metadata.csv");
    let report = run_metadata(&catalog, &images, &output).unwrap();

    assert_eq!(report.rows, 2);
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "image_filename,label\nCardA.jpg,White\nCardB.jpg,Multicolor\n"
    );
}

#[tokio::test]
async fn download_then_metadata_skips_failed_cards() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let cards = vec![
        card("Llanowar Elves", &[Color::Green], "https://img.example/elves.png"),
        card("Ornithopter", &[], "https://img.example/thopter.png"),
        card("Lost Card", &[Color::Red], "https://img.example/missing.png"),
    ];
    let catalog = dir.path().join("catalog.csv");
    csv_loader::save_catalog(&catalog, &cards).unwrap();

    let first = download_images(&PaletteImages, &cards, &options(&images)).await.unwrap();
    assert_eq!(first.downloaded, 2);
    assert_eq!(first.failed.len(), 1);

    // 2回目は既存ファイルをスキップする
    let second = download_images(&PaletteImages, &cards, &options(&images)).await.unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped_existing, 2);

    let output = dir.path().join("card_metadata.csv");
    let report = run_metadata(&catalog, &images, &output).unwrap();
    assert_eq!(report.missing_images, vec!["Lost Card".to_string()]);

    let rows = csv_loader::load_metadata_rows(&output).unwrap();
    let labels: Vec<(String, ColorLabel)> = rows.into_iter().map(|r| (r.image_filename, r.label)).collect();
    assert_eq!(
        labels,
        vec![
            ("LlanowarElves.png".to_string(), ColorLabel::Green),
            ("Ornithopter.png".to_string(), ColorLabel::Colorless),
        ]
    );
}

#[cfg(feature = "ml")]
mod ml {
    use super::*;
    use planeswalker_lib::ml::{run_inference, train_model, CpuBackend, PredictRequest, TrainingRequest};
    use planeswalker_lib::model::TrainingSettings;
    use planeswalker_lib::types::MetadataRow;

    #[test]
    fn train_then_predict_isolates_corrupt_image() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();

        let mut rows = Vec::new();
        for i in 0..9 {
            let filename = format!("card{i}.png");
            std::fs::write(images.join(&filename), png_bytes((i * 28) as u8)).unwrap();
            rows.push(MetadataRow {
                image_filename: filename,
                label: ColorLabel::ALL[i % ColorLabel::ALL.len()],
            });
        }
        let metadata_path = dir.path().join("card_metadata.csv");
        csv_loader::save_metadata_rows(&metadata_path, &rows).unwrap();

        let training = TrainingRequest {
            image_dir: images.clone(),
            metadata_path,
            output_path: dir.path().join("color_classifier"),
            settings: TrainingSettings {
                num_epochs: 1,
                batch_size: 4,
                image_size: 32,
                ..Default::default()
            },
        };
        let trained = train_model::<burn::backend::Autodiff<CpuBackend>>(&Default::default(), &training).unwrap();
        assert!(trained.model_path.is_file());

        // 推論対象: 正常な画像9枚 + 壊れた画像1枚
        std::fs::write(images.join("corrupt.jpg"), b"\xff\xd8 truncated").unwrap();
        let csv_output = dir.path().join("predictions.csv");
        let request = PredictRequest {
            model_path: trained.model_path.clone(),
            image_dir: images.clone(),
            csv_output: Some(csv_output.clone()),
            sort: false,
            confidence_threshold: 0.7,
        };
        let report = run_inference::<CpuBackend>(&Default::default(), &request).unwrap();

        assert_eq!(report.predictions.len(), 9);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].image_filename, "corrupt.jpg");
        for prediction in &report.predictions {
            assert!((0.0..=1.0).contains(&prediction.confidence));
        }

        let exported = std::fs::read_to_string(&csv_output).unwrap();
        assert_eq!(exported.lines().count(), 10);
    }
}
