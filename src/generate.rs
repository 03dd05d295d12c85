//! The generation routine: load an image, run it through an [`Img2ImgPipeline`] once, save the first result.

use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, ImageFormat};

use crate::{
	error::{Error, Result},
	Img2ImgPipeline, Img2ImgRequest, ProgressCallback
};

/// Width and height every input image is resized to before inference.
pub const TARGET_SIZE: u32 = 768;

/// Formats the output image can be encoded as, chosen by the output path's extension.
pub const OUTPUT_FORMATS: &[ImageFormat] =
	&[ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP, ImageFormat::Bmp, ImageFormat::Tiff, ImageFormat::Gif];

/// Everything needed for one image-to-image run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateConfig {
	/// Text prompt.
	pub prompt: String,
	/// Optional negative prompt for classifier-free guidance.
	pub negative_prompt: Option<String>,
	/// Source image path.
	pub input: PathBuf,
	/// Destination image path. The format is inferred from the extension.
	pub output: PathBuf,
	/// Number of sampling iterations for a full-strength run.
	pub steps: usize,
	/// Prompt-adherence strength.
	pub guidance: f32,
	/// How far the output may depart from the input, nominally in `[0, 1]`.
	pub strength: f32,
	/// Seed for reproducible runs.
	pub seed: Option<u64>
}

impl Default for GenerateConfig {
	fn default() -> Self {
		Self {
			prompt: String::new(),
			negative_prompt: None,
			input: PathBuf::new(),
			output: PathBuf::new(),
			steps: 30,
			guidance: 7.5,
			strength: 0.8,
			seed: None
		}
	}
}

impl GenerateConfig {
	/// Checks the parameters that would make a run pointless before any model is loaded.
	///
	/// Strength is deliberately not range-checked; the pipeline clamps it.
	pub fn validate(&self) -> Result<()> {
		if self.prompt.is_empty() {
			return Err(Error::InvalidParameter {
				name: "prompt",
				reason: "must not be empty".to_string()
			});
		}
		if self.steps == 0 {
			return Err(Error::InvalidParameter {
				name: "steps",
				reason: "must be greater than 0".to_string()
			});
		}
		if !self.guidance.is_finite() || self.guidance < 0.0 {
			return Err(Error::InvalidParameter {
				name: "guidance",
				reason: format!("must be a non-negative number, got {}", self.guidance)
			});
		}
		output_format(&self.output)?;
		if !self.input.exists() {
			return Err(Error::InputNotFound(self.input.clone()));
		}
		Ok(())
	}
}

/// Resolves the format `path` will be written in, failing for unknown extensions or formats without an encoder.
pub fn output_format(path: impl AsRef<Path>) -> Result<ImageFormat> {
	let path = path.as_ref();
	let format = ImageFormat::from_path(path).map_err(|_| Error::InvalidParameter {
		name: "output",
		reason: format!("cannot infer an image format from {}", path.display())
	})?;
	if !OUTPUT_FORMATS.contains(&format) {
		return Err(Error::InvalidParameter {
			name: "output",
			reason: format!("cannot write {format:?} images")
		});
	}
	Ok(format)
}

/// Loads an image, converts it to RGB and resizes it to [`TARGET_SIZE`]x[`TARGET_SIZE`].
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
	let path = path.as_ref();
	let image = image::open(path).map_err(|source| Error::ImageLoad { path: path.to_path_buf(), source })?;
	tracing::debug!(path = %path.display(), width = image.width(), height = image.height(), "loaded input image");
	Ok(prepare_image(&image))
}

/// Forces `image` into the RGB, [`TARGET_SIZE`]-square layout the pipeline expects.
pub fn prepare_image(image: &DynamicImage) -> DynamicImage {
	let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
	if rgb.width() == TARGET_SIZE && rgb.height() == TARGET_SIZE {
		rgb
	} else {
		rgb.resize_exact(TARGET_SIZE, TARGET_SIZE, FilterType::CatmullRom)
	}
}

/// Writes `image` as 8-bit RGB to `path`.
pub fn save_image(image: DynamicImage, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();
	image.into_rgb8().save(path).map_err(|source| Error::ImageSave { path: path.to_path_buf(), source })
}

/// Runs one image-to-image generation and writes the first output image to `config.output`.
///
/// The output path is only touched once the pipeline has returned an image, so any earlier failure leaves it as it
/// was.
pub fn generate<P>(pipeline: &P, config: &GenerateConfig, progress: Option<ProgressCallback<'_>>) -> Result<()>
where
	P: Img2ImgPipeline + ?Sized
{
	config.validate()?;

	let image = load_image(&config.input)?;

	let request = Img2ImgRequest {
		prompt: &config.prompt,
		negative_prompt: config.negative_prompt.as_deref(),
		image: &image,
		steps: config.steps,
		guidance_scale: config.guidance,
		strength: config.strength,
		seed: config.seed,
		progress
	};
	tracing::info!(prompt = %config.prompt, steps = config.steps, guidance = config.guidance, strength = config.strength, "generating");

	let output = pipeline.img2img(&request).map_err(Error::Inference)?.into_iter().next().ok_or(Error::EmptyOutput)?;

	save_image(output, &config.output)?;
	tracing::info!(output = %config.output.display(), "saved result");
	Ok(())
}
