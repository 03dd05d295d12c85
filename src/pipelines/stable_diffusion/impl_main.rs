// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
	path::{Path, PathBuf},
	sync::Arc
};

use anyhow::Context;
use image::{DynamicImage, Rgb32FImage};
use ndarray::{Array3, Array4, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, Session, SessionBuilder
};

use super::StableDiffusionOptions;
use crate::{
	clip::CLIPStandardTokenizer,
	config::{ModelConfig, OnnxModelConfig},
	schedulers::EulerDiscreteScheduler
};

/// Scaling factor between VAE latents and the latent space the UNet was trained on.
pub(crate) const VAE_SCALE_FACTOR: f32 = 0.18215;

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) image-to-image pipeline backed by ONNX graphs.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use image::imageops::FilterType;
/// use sd_img2img::{Img2ImgOptions, OrtEnvironment, StableDiffusionOptions, StableDiffusionPipeline};
///
/// let environment = OrtEnvironment::default().into_arc();
/// let pipeline = StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
/// let mut scheduler = pipeline.scheduler()?;
///
/// let sketch = image::open("sketch.png")?.resize_exact(768, 768, FilterType::CatmullRom);
/// let mut imgs = Img2ImgOptions::default()
/// 	.with_prompts("photo of a red fox", None)
/// 	.with_image(&sketch)?
/// 	.run(&pipeline, &mut scheduler)?;
/// imgs.remove(0).into_rgb8().save("result.png")?;
/// # Ok(())
/// # }
/// ```
pub struct StableDiffusionPipeline {
	config: ModelConfig,
	tokenizer: CLIPStandardTokenizer,
	text_encoder: Session,
	vae_encoder: Session,
	vae_decoder: Session,
	pub(crate) unet: Session
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading models from the model directory `root`.
	///
	/// `root` must contain a `model.toml` describing where the tokenizer and each ONNX graph live. All graphs are
	/// placed on `options.device`, choosing float16 exports when `options.precision` asks for them and the model
	/// provides them.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: StableDiffusionOptions) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let config = ModelConfig::from_dir(&root)?;

		tracing::info!(model = %root.display(), device = ?options.device, precision = ?options.precision, "loading pipeline");

		let tokenizer = CLIPStandardTokenizer::from_config(&root, &config.tokenizer)?;

		let vae_encoder_config = config
			.vae
			.encoder
			.as_ref()
			.context("image-to-image requires a VAE encoder, but the model config has no `[vae.encoder]`")?;

		let text_encoder = load_session(environment, &root, &config.text_encoder, &options)?;
		let vae_encoder = load_session(environment, &root, vae_encoder_config, &options)?;
		let vae_decoder = load_session(environment, &root, &config.vae.decoder, &options)?;
		let unet = load_session(environment, &root, &config.unet, &options)?;

		tracing::info!("pipeline ready");

		Ok(Self {
			config,
			tokenizer,
			text_encoder,
			vae_encoder,
			vae_decoder,
			unet
		})
	}

	/// Creates a fresh scheduler matching the noise schedule this model was trained with.
	pub fn scheduler(&self) -> anyhow::Result<EulerDiscreteScheduler> {
		EulerDiscreteScheduler::from_config(&self.config.scheduler)
	}

	/// Encodes the given prompt into text embeddings to be used as input to the UNet.
	///
	/// With classifier-free guidance the result has a batch of 2: the unconditional (negative prompt, or empty)
	/// embedding first, then the prompt embedding.
	pub fn encode_prompt(&self, prompt: &str, do_classifier_free_guidance: bool, negative_prompt: Option<&str>) -> anyhow::Result<Array3<f32>> {
		let prompts = if do_classifier_free_guidance {
			vec![negative_prompt.unwrap_or(""), prompt]
		} else {
			vec![prompt]
		};

		let input_ids = self.tokenizer.encode_for_text_model(&prompts)?;
		let outputs = self.text_encoder.run(vec![InputTensor::from_array(input_ids.into_dyn())])?;
		let embeddings: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		Ok(embeddings.view().to_owned().into_dimensionality()?)
	}

	/// Encodes an NCHW image in `[-1, 1]` into scaled UNet latents via the variational autoencoder.
	pub fn encode_image(&self, image: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let outputs = self.vae_encoder.run(vec![InputTensor::from_array(image.to_owned().into_dyn())])?;
		let latents: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		let latents: Array4<f32> = latents.view().to_owned().into_dimensionality()?;
		Ok(latents * VAE_SCALE_FACTOR)
	}

	/// Decodes UNet latents via the variational autoencoder into an array of [`image::DynamicImage`]s.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Vec<DynamicImage>> {
		let latents = 1.0 / VAE_SCALE_FACTOR * &latents;

		let mut images = Vec::new();
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.into_dyn().insert_axis(Axis(0));
			let image = self.vae_decoder.run(vec![InputTensor::from_array(latent_chunk.to_owned())])?;
			let image: OrtOwnedTensor<'_, f32, IxDyn> = image[0].try_extract()?;
			let f_image: Array4<f32> = image.view().to_owned().into_dimensionality()?;
			// nchw -> nhwc, [-1, 1] -> [0, 1]
			let f_image = f_image.permuted_axes([0, 2, 3, 1]) / 2.0 + 0.5;

			images.push(to_image(f_image.shape()[2] as _, f_image.shape()[1] as _, &f_image)?);
		}

		Ok(images)
	}
}

fn load_session(environment: &Arc<Environment>, root: &Path, model: &OnnxModelConfig, options: &StableDiffusionOptions) -> anyhow::Result<Session> {
	let path = root.join(model.path_for(options.precision));
	tracing::debug!(path = %path.display(), "creating session");
	SessionBuilder::new(environment)?
		.with_execution_providers([options.device.clone().into()])?
		.with_model_from_file(&path)
		.with_context(|| format!("could not load ONNX graph {}", path.display()))
}

fn to_image(width: u32, height: u32, arr: &Array4<f32>) -> anyhow::Result<DynamicImage> {
	Ok(DynamicImage::ImageRgb32F(
		Rgb32FImage::from_raw(width, height, arr.map(|f| f.clamp(0.0, 1.0)).into_iter().collect::<Vec<_>>())
			.ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
	))
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::to_image;

	#[test]
	fn to_image_keeps_row_major_pixels() {
		// 1x2x3x3 nhwc, pixel (x=2, y=1) is red
		let mut arr = Array4::<f32>::zeros((1, 2, 3, 3));
		arr[[0, 1, 2, 0]] = 1.0;
		let image = to_image(3, 2, &arr).unwrap().into_rgb8();
		assert_eq!(image.dimensions(), (3, 2));
		assert_eq!(image.get_pixel(2, 1).0, [255, 0, 0]);
		assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
	}

	#[test]
	fn to_image_clamps() {
		let arr = Array4::<f32>::from_elem((1, 1, 1, 3), 4.0);
		let image = to_image(1, 1, &arr).unwrap().into_rgb8();
		assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
	}
}
