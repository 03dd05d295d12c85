//! Model directory configuration, read from `model.toml`.

use std::{
	fs,
	path::{Path, PathBuf}
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::Precision;

/// Name of the configuration file expected at the root of every model directory.
pub const MODEL_CONFIG_FILE: &str = "model.toml";

/// CLIP tokenizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenizerConfig {
	/// Path to a HuggingFace `tokenizer.json`, relative to the model root.
	pub path: String,
	/// Maximum sequence length accepted by the text encoder (77 for Stable Diffusion v1).
	pub model_max_length: usize,
	/// Beginning-of-string token ID.
	pub bos_token: u32,
	/// End-of-string token ID, also used as padding.
	pub eos_token: u32
}

/// Location of a single ONNX graph, with an optional reduced precision export.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OnnxModelConfig {
	/// Path to the float32 graph, relative to the model root.
	pub path: String,
	/// Path to the float16 graph, relative to the model root.
	#[serde(default)]
	pub fp16: Option<String>
}

impl OnnxModelConfig {
	/// Returns the graph path to load for `precision`, falling back to the float32 graph when there is no float16
	/// export.
	pub fn path_for(&self, precision: Precision) -> &str {
		match (precision, &self.fp16) {
			(Precision::Float16, Some(fp16)) => fp16,
			(Precision::Float16, None) => {
				tracing::debug!(path = %self.path, "no fp16 export listed, loading float32 graph");
				&self.path
			}
			(Precision::Float32, _) => &self.path
		}
	}
}

/// Variational autoencoder graphs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	/// Encoder graph; required for image-to-image.
	pub encoder: Option<OnnxModelConfig>,
	/// Decoder graph.
	pub decoder: OnnxModelConfig
}

/// Noise schedule the UNet was trained with.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
	/// Number of diffusion steps used to train the model.
	pub train_timesteps: usize,
	/// Starting `beta` of the scaled linear schedule.
	pub beta_start: f32,
	/// Final `beta` of the scaled linear schedule.
	pub beta_end: f32
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			train_timesteps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012
		}
	}
}

/// Contents of a model directory's `model.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelConfig {
	/// Tokenizer settings.
	pub tokenizer: TokenizerConfig,
	/// CLIP text encoder graph.
	pub text_encoder: OnnxModelConfig,
	/// VAE encoder and decoder graphs.
	pub vae: VAEConfig,
	/// UNet graph.
	pub unet: OnnxModelConfig,
	/// Noise schedule; Stable Diffusion v1 values when omitted.
	#[serde(default)]
	pub scheduler: SchedulerConfig
}

impl ModelConfig {
	/// Reads `model.toml` from the model directory `root`.
	pub fn from_dir(root: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path: PathBuf = root.as_ref().join(MODEL_CONFIG_FILE);
		let text = fs::read_to_string(&path).with_context(|| format!("could not read {}", path.display()))?;
		Self::from_toml(&text).with_context(|| format!("invalid model config {}", path.display()))
	}

	/// Parses a model configuration from TOML text.
	pub fn from_toml(text: &str) -> anyhow::Result<Self> {
		Ok(toml::from_str(text)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SD15: &str = r#"
[tokenizer]
path = "tokenizer/tokenizer.json"
model-max-length = 77
bos-token = 49406
eos-token = 49407

[text-encoder]
path = "text_encoder/model.onnx"

[vae.encoder]
path = "vae_encoder/model.onnx"

[vae.decoder]
path = "vae_decoder/model.onnx"

[unet]
path = "unet/model.onnx"
fp16 = "unet-fp16/model.onnx"
"#;

	#[test]
	fn parses_model_config() {
		let config = ModelConfig::from_toml(SD15).unwrap();
		assert_eq!(config.tokenizer.model_max_length, 77);
		assert_eq!(config.tokenizer.eos_token, 49407);
		assert_eq!(config.vae.encoder.as_ref().map(|e| e.path.as_str()), Some("vae_encoder/model.onnx"));
		assert_eq!(config.scheduler, SchedulerConfig::default());
	}

	#[test]
	fn fp16_graph_is_chosen_only_when_listed() {
		let config = ModelConfig::from_toml(SD15).unwrap();
		assert_eq!(config.unet.path_for(Precision::Float16), "unet-fp16/model.onnx");
		assert_eq!(config.unet.path_for(Precision::Float32), "unet/model.onnx");
		assert_eq!(config.text_encoder.path_for(Precision::Float16), "text_encoder/model.onnx");
	}

	#[test]
	fn scheduler_section_overrides_defaults() {
		let text = format!("{SD15}\n[scheduler]\nbeta-end = 0.02\n");
		let config = ModelConfig::from_toml(&text).unwrap();
		assert_eq!(config.scheduler.beta_end, 0.02);
		assert_eq!(config.scheduler.train_timesteps, 1000);
	}

	#[test]
	fn missing_model_dir_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let err = ModelConfig::from_dir(dir.path()).unwrap_err();
		assert!(err.to_string().contains("model.toml"));
	}
}
