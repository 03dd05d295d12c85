//! Diffusion pipelines.

use image::DynamicImage;

mod stable_diffusion;
pub use self::stable_diffusion::*;

/// Progress callback invoked after each denoising step with `(step, total_steps)`, where `step` starts at 1.
/// Returning `false` stops denoising early; the latents so far are still decoded.
pub type ProgressCallback<'a> = &'a dyn Fn(usize, usize) -> bool;

/// A single image-to-image request.
#[derive(Clone, Copy)]
pub struct Img2ImgRequest<'a> {
	/// Text prompt to steer the image towards.
	pub prompt: &'a str,
	/// Optional prompt to steer away from.
	pub negative_prompt: Option<&'a str>,
	/// Source image, already in the pipeline's working resolution.
	pub image: &'a DynamicImage,
	/// Number of inference steps for a full-strength run.
	pub steps: usize,
	/// Classifier-free guidance scale.
	pub guidance_scale: f32,
	/// How far the output may depart from `image`, from `0.0` (unchanged) to `1.0` (mostly discarded).
	pub strength: f32,
	/// Seed for the initial noise; random when `None`.
	pub seed: Option<u64>,
	/// Optional progress reporting.
	pub progress: Option<ProgressCallback<'a>>
}

impl std::fmt::Debug for Img2ImgRequest<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Img2ImgRequest")
			.field("prompt", &self.prompt)
			.field("negative_prompt", &self.negative_prompt)
			.field("image", &(self.image.width(), self.image.height()))
			.field("steps", &self.steps)
			.field("guidance_scale", &self.guidance_scale)
			.field("strength", &self.strength)
			.field("seed", &self.seed)
			.finish_non_exhaustive()
	}
}

/// A pretrained model that can transform an image according to a text prompt.
pub trait Img2ImgPipeline {
	/// Runs inference once, returning one or more output images.
	fn img2img(&self, request: &Img2ImgRequest<'_>) -> anyhow::Result<Vec<DynamicImage>>;
}
