pub mod ml_model;
pub mod resnet;
pub mod training;
pub mod inference;

pub use ml_model::{
    classification_output, letterbox, load_and_normalize_image, load_image, normalize, CardCnn, CardCnnConfig, ColorNet,
};
pub use resnet::{ResNet50Classifier, ResNet50Config};
pub use training::{train_model, CardDataset, EpochMetrics, TrainingReport, TrainingRequest};
pub use inference::{
    print_predictions, run_inference, sort_into_folders, write_predictions_csv, InferenceEngine, InferenceFailure,
    InferenceReport, PredictRequest,
};

use crate::model::DeviceType;

/// CPUバックエンド
pub type CpuBackend = burn::backend::NdArray<f32>;

/// GPUバックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Wgpu;

/// 設定のデバイス種別に応じたバックエンドで学習する
pub fn train_with_device_type(device_type: DeviceType, request: &TrainingRequest) -> anyhow::Result<TrainingReport> {
    let device_type = resolve_device_type(device_type);
    tracing::info!("使用デバイス: {}", device_type);
    match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => train_model::<burn::backend::Autodiff<GpuBackend>>(&Default::default(), request),
        _ => train_model::<burn::backend::Autodiff<CpuBackend>>(&Default::default(), request),
    }
}

/// 設定のデバイス種別に応じたバックエンドで推論する
pub fn predict_with_device_type(device_type: DeviceType, request: &PredictRequest) -> anyhow::Result<InferenceReport> {
    match resolve_device_type(device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run_inference::<GpuBackend>(&Default::default(), request),
        _ => run_inference::<CpuBackend>(&Default::default(), request),
    }
}

/// `wgpu` フィーチャー無しでWGPUが選ばれた場合はCPUにフォールバック
fn resolve_device_type(device_type: DeviceType) -> DeviceType {
    if device_type == DeviceType::Wgpu && !cfg!(feature = "wgpu") {
        tracing::warn!("wgpu フィーチャーが無効のため CPU で実行します");
        return DeviceType::Cpu;
    }
    device_type
}
