// src/backend.rs

//! Compile-time backend selection.

use burn::tensor::backend::Backend;
use log::info;

#[cfg(not(feature = "wgpu"))]
pub type AutoBackend = burn_ndarray::NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type AutoBackend = burn::backend::Wgpu;

/// Training backend: autodiff enables dropout and label dropout.
pub type TrainBackend = burn::backend::Autodiff<AutoBackend>;

pub fn get_device() -> <AutoBackend as Backend>::Device {
    Default::default()
}

pub fn print_backend_info() {
    #[cfg(not(feature = "wgpu"))]
    info!("Backend: NdArray<f32> (CPU)");
    #[cfg(feature = "wgpu")]
    info!("Backend: Wgpu (default adapter)");
    info!("Device: {:?}", get_device());
}
