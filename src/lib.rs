//! `sd-img2img` runs a pretrained Stable Diffusion image-to-image model over a single image using [ONNX Runtime].
//!
//! The crate is split into a small generation routine ([`generate`]) and the ONNX-backed pipeline it drives
//! ([`StableDiffusionPipeline`]). The routine only talks to the pipeline through the [`Img2ImgPipeline`] trait:
//! ```ignore
//! use sd_img2img::{
//! 	generate, DiffusionDevice, GenerateConfig, OrtEnvironment, Precision, StableDiffusionOptions, StableDiffusionPipeline
//! };
//!
//! let environment = OrtEnvironment::builder().with_name("sd-img2img").build()?.into_arc();
//! let device = DiffusionDevice::detect();
//! let pipeline = StableDiffusionPipeline::new(
//! 	&environment,
//! 	"./stable-diffusion-v1-5/",
//! 	StableDiffusionOptions {
//! 		precision: Precision::for_device(&device),
//! 		device
//! 	}
//! )?;
//!
//! let config = GenerateConfig {
//! 	prompt: "oil painting of a lighthouse".to_string(),
//! 	input: "sketch.png".into(),
//! 	output: "result.png".into(),
//! 	..Default::default()
//! };
//! generate::generate(&pipeline, &config, None)?;
//! ```
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

#[doc(hidden)]
pub mod clip;
pub mod config;
pub mod error;
pub mod generate;
pub mod pipelines;
pub mod schedulers;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::error::{Error, Result};
pub use self::generate::GenerateConfig;
pub use self::pipelines::*;
pub use self::schedulers::*;

/// A device on which to place the diffusion models.
///
/// If a configured execution provider turns out not to be available at session creation, ONNX Runtime places the
/// model on the CPU instead.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. Requires an NVIDIA Kepler GPU or later.
	///
	/// The value is the device ID, which can be set to 0 in most cases.
	CUDA(usize)
}

impl DiffusionDevice {
	/// Picks CUDA device 0 if this ONNX Runtime build has the CUDA execution provider *and* the machine has a visible
	/// NVIDIA GPU, otherwise the CPU.
	///
	/// ONNX Runtime only reports which providers it was compiled with; a CUDA build on a machine without a GPU would
	/// otherwise silently run the float16 graphs on the CPU.
	pub fn detect() -> Self {
		let provider_available = ExecutionProvider::cuda().is_available();
		let gpus = if provider_available && cuda_devices_visible(std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref()) {
			nvidia_gpu_count()
		} else {
			0
		};
		tracing::debug!(provider_available, gpus, "probed CUDA");
		Self::select(provider_available, gpus)
	}

	/// Chooses a device from the result of probing for CUDA.
	pub fn select(cuda_provider_available: bool, cuda_gpus: usize) -> Self {
		if cuda_provider_available && cuda_gpus > 0 {
			DiffusionDevice::CUDA(0)
		} else {
			DiffusionDevice::CPU
		}
	}

	/// Whether this device is a hardware accelerator.
	pub fn is_accelerator(&self) -> bool {
		!matches!(self, DiffusionDevice::CPU)
	}
}

// an empty `CUDA_VISIBLE_DEVICES`, or one starting with `-1`, hides every GPU from CUDA
fn cuda_devices_visible(cuda_visible_devices: Option<&str>) -> bool {
	match cuda_visible_devices.map(str::trim) {
		None => true,
		Some(ids) => !ids.is_empty() && !ids.starts_with("-1")
	}
}

#[cfg(target_os = "linux")]
fn nvidia_gpu_count() -> usize {
	// the NVIDIA kernel driver lists one directory per GPU
	std::fs::read_dir("/proc/driver/nvidia/gpus").map(|gpus| gpus.filter_map(std::result::Result::ok).count()).unwrap_or(0)
}

#[cfg(windows)]
fn nvidia_gpu_count() -> usize {
	// the CUDA driver API ships with the NVIDIA display driver
	let system_root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
	usize::from(std::path::Path::new(&system_root).join("System32").join("nvcuda.dll").exists())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn nvidia_gpu_count() -> usize {
	0
}

impl Default for DiffusionDevice {
	fn default() -> Self {
		Self::CPU
	}
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device) => ExecutionProvider::cuda().with("device_id", device.to_string())
		}
	}
}

/// Numeric precision of the model graphs loaded by a pipeline.
///
/// ONNX graphs carry their precision in the weights, so choosing [`Precision::Float16`] selects the `fp16` export
/// listed in the model's `model.toml` when one exists. Reduced precision graphs are expected to keep float32 inputs
/// and outputs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
	/// Full precision. Used on the CPU, where float16 kernels are slow or missing.
	#[default]
	Float32,
	/// Half precision. Roughly halves VRAM usage on accelerators.
	Float16
}

impl Precision {
	/// Reduced precision on accelerators, full precision otherwise.
	pub fn for_device(device: &DiffusionDevice) -> Self {
		if device.is_accelerator() { Precision::Float16 } else { Precision::Float32 }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn precision_follows_device() {
		assert_eq!(Precision::for_device(&DiffusionDevice::CPU), Precision::Float32);
		assert_eq!(Precision::for_device(&DiffusionDevice::CUDA(0)), Precision::Float16);
	}

	#[test]
	fn cuda_needs_both_provider_and_gpu() {
		assert_eq!(DiffusionDevice::select(true, 1), DiffusionDevice::CUDA(0));
		assert_eq!(DiffusionDevice::select(true, 0), DiffusionDevice::CPU);
		assert_eq!(DiffusionDevice::select(false, 2), DiffusionDevice::CPU);
		assert_eq!(DiffusionDevice::select(false, 0), DiffusionDevice::CPU);
	}

	#[test]
	fn gpu_less_cuda_build_runs_at_full_precision() {
		let device = DiffusionDevice::select(true, 0);
		assert!(!device.is_accelerator());
		assert_eq!(Precision::for_device(&device), Precision::Float32);
	}

	#[test]
	fn cuda_visible_devices() {
		assert!(cuda_devices_visible(None));
		assert!(cuda_devices_visible(Some("0")));
		assert!(cuda_devices_visible(Some("1,2")));
		assert!(!cuda_devices_visible(Some("")));
		assert!(!cuda_devices_visible(Some(" ")));
		assert!(!cuda_devices_visible(Some("-1")));
	}

	#[test]
	fn cpu_is_not_an_accelerator() {
		assert!(!DiffusionDevice::default().is_accelerator());
		assert!(DiffusionDevice::CUDA(1).is_accelerator());
	}
}
