use image::DynamicImage;
use ndarray::{concatenate, s, Array1, Array4, ArrayD, Axis, IxDyn};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use ort::tensor::{FromArray, InputTensor, OrtOwnedTensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{Img2ImgOptions, StableDiffusionCallback, StableDiffusionPipeline};
use crate::{DiffusionScheduler, Img2ImgPipeline, Img2ImgRequest, ProgressCallback};

impl Default for Img2ImgOptions {
	fn default() -> Self {
		Self {
			positive_prompt: String::new(),
			negative_prompt: None,
			steps: 30,
			guidance_scale: 7.5,
			strength: 0.8,
			seed: None,
			reference_image: None,
			callback: None
		}
	}
}

// builder for options
impl Img2ImgOptions {
	/// The number of steps a full-strength run would take. Lower strengths skip the noisiest steps, see
	/// [`Img2ImgOptions::start_step`].
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// Set the prompt(s) to use when generating the image.
	pub fn with_prompts<P>(mut self, positive_prompt: P, negative_prompt: Option<P>) -> Self
	where
		P: Into<String>
	{
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.map(|p| p.into());
		self
	}
	/// Set with given seed, so that each run generates the same image.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale mean the model will match the prompt(s) more strictly,
	/// but may introduce artifacts; `7.5` is a good balance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// How much the output may depart from the reference image. `0.0` keeps the image unchanged, `1.0` discards
	/// nearly all of it. Values outside `[0, 1]` are clamped.
	pub fn with_strength(mut self, strength: f32) -> Self {
		self.strength = strength;
		self
	}
	/// Set the reference image. Its width and height become the output size and **must be divisible by 8.**
	pub fn with_image(mut self, image: &DynamicImage) -> anyhow::Result<Self> {
		let (width, height) = (image.width(), image.height());
		if width % 8 != 0 || height % 8 != 0 || width == 0 || height == 0 {
			anyhow::bail!("reference image size {width}x{height} must be a positive multiple of 8");
		}

		// hwc [0, 255] -> nchw [-1, 1]
		let image = image.to_rgb32f();
		self.reference_image = Some(Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
			image.get_pixel(x as u32, y as u32).0[c] * 2.0 - 1.0
		}));
		Ok(self)
	}

	/// Index into the scheduler's timesteps at which denoising starts. Everything before it is skipped, so a strength
	/// of `1.0` runs all steps and `0.0` runs none.
	pub fn start_step(&self) -> usize {
		// NaN saturates to 0 steps
		let init_timestep = ((self.steps as f32 * self.strength.clamp(0.0, 1.0)) as usize).min(self.steps);
		self.steps - init_timestep
	}
}

// builder for callbacks
impl Img2ImgOptions {
	/// Registers a callback to receive progress updates.
	///
	/// The callback is called every `frequency` steps, and always after the last step, with the number of completed
	/// steps and the total number of steps this run takes. Returning `false` stops denoising early.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, usize) -> bool + 'static
	{
		self.callback = Some(StableDiffusionCallback::Progress {
			frequency: frequency.max(1),
			cb: Box::new(callback)
		});
		self
	}
}

impl Img2ImgOptions {
	/// Generates images from the reference image and prompt. Returns a vector of [`image::DynamicImage`]s, using
	/// float32 buffers. In most cases, you'll want to convert the images into RGB8 via `img.into_rgb8()`.
	///
	/// `scheduler` must be a Stable Diffusion-compatible scheduler, e.g. from [`StableDiffusionPipeline::scheduler`].
	pub fn run<S: DiffusionScheduler>(&self, session: &StableDiffusionPipeline, scheduler: &mut S) -> anyhow::Result<Vec<DynamicImage>> {
		match &self.callback {
			Some(StableDiffusionCallback::Progress { frequency, cb }) => {
				let progress = every_nth_step(*frequency, &**cb);
				let progress: ProgressCallback<'_> = &progress;
				self.denoise(session, scheduler, Some(progress))
			}
			None => self.denoise(session, scheduler, None)
		}
	}

	pub(crate) fn denoise<S: DiffusionScheduler>(
		&self,
		session: &StableDiffusionPipeline,
		scheduler: &mut S,
		progress: Option<ProgressCallback<'_>>
	) -> anyhow::Result<Vec<DynamicImage>> {
		let reference_image = match &self.reference_image {
			Some(image) => image,
			None => anyhow::bail!("no reference image set; see `Img2ImgOptions::with_image`")
		};
		if self.steps == 0 {
			anyhow::bail!("`steps` must be at least 1");
		}

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);
		tracing::debug!(seed, "seeded initial noise");

		let do_classifier_free_guidance = self.guidance_scale > 1.0;
		let text_embeddings = session.encode_prompt(&self.positive_prompt, do_classifier_free_guidance, self.negative_prompt.as_deref())?;
		let encoder_hidden_states: ArrayD<f32> = text_embeddings.into_dyn();

		scheduler.set_timesteps(self.steps);
		let timesteps = scheduler.timesteps().slice(s![self.start_step()..]).to_owned();

		let mut latents = session.encode_image(reference_image.view())?;
		if let Some(&latent_timestep) = timesteps.get(0) {
			let noise = Array4::<f32>::random_using(latents.raw_dim(), StandardNormal, &mut rng);
			latents = scheduler.add_noise(latents.view(), noise.view(), latent_timestep)?;
		}

		let total = timesteps.len();
		tracing::debug!(total, strength = self.strength, "denoising");

		for (i, t) in timesteps.iter().enumerate() {
			let latent_model_input = if do_classifier_free_guidance {
				concatenate![Axis(0), latents, latents]
			} else {
				latents.clone()
			};
			let latent_model_input: ArrayD<f32> = scheduler.scale_model_input(latent_model_input.view(), *t)?.into_dyn();
			let timestep: ArrayD<f32> = Array1::from_iter([*t]).into_dyn();

			let noise_pred = session.unet.run(vec![
				InputTensor::from_array(latent_model_input),
				InputTensor::from_array(timestep),
				InputTensor::from_array(encoder_hidden_states.clone()),
			])?;
			let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
			let mut noise_pred: Array4<f32> = noise_pred.view().to_owned().into_dimensionality()?;

			if do_classifier_free_guidance {
				let split_len = (noise_pred.shape()[0] / 2) as isize;
				let noise_pred_uncond = noise_pred.slice(s![..split_len, .., .., ..]);
				let noise_pred_text = noise_pred.slice(s![split_len.., .., .., ..]);
				noise_pred = &noise_pred_uncond + self.guidance_scale * (&noise_pred_text - &noise_pred_uncond);
			}

			latents = scheduler.step(noise_pred.view(), *t, latents.view())?.into_prev_sample();
			tracing::trace!(step = i + 1, timestep = *t, "denoised");

			if let Some(progress) = progress {
				if !progress(i + 1, total) {
					tracing::info!(step = i + 1, total, "stopped early by progress callback");
					break;
				}
			}
		}

		session.decode_latents(latents.view())
	}
}

// forwards every `frequency`th step and the last one; skipped steps never cancel
fn every_nth_step<'a>(frequency: usize, cb: &'a dyn Fn(usize, usize) -> bool) -> impl Fn(usize, usize) -> bool + 'a {
	let frequency = frequency.max(1);
	move |step, total| if step % frequency == 0 || step == total { cb(step, total) } else { true }
}

impl Img2ImgPipeline for StableDiffusionPipeline {
	fn img2img(&self, request: &Img2ImgRequest<'_>) -> anyhow::Result<Vec<DynamicImage>> {
		let mut scheduler = self.scheduler()?;
		let mut options = Img2ImgOptions::default()
			.with_prompts(request.prompt, request.negative_prompt)
			.with_steps(request.steps)
			.with_guidance_scale(request.guidance_scale)
			.with_strength(request.strength)
			.with_image(request.image)?;
		if let Some(seed) = request.seed {
			options = options.with_seed(seed);
		}
		options.denoise(self, &mut scheduler, request.progress)
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;

	use image::{DynamicImage, Rgb, RgbImage};

	use super::*;

	#[test]
	fn start_step_tracks_strength() {
		let options = Img2ImgOptions::default().with_steps(30);
		assert_eq!(options.start_step(), 30 - 24);
		assert_eq!(Img2ImgOptions::default().with_steps(30).with_strength(1.0).start_step(), 0);
		assert_eq!(Img2ImgOptions::default().with_steps(30).with_strength(0.0).start_step(), 30);
	}

	#[test]
	fn steps_run_grow_with_strength() {
		let mut last = 0;
		for i in 0..=20 {
			let options = Img2ImgOptions::default().with_steps(50).with_strength(i as f32 / 20.0);
			let run = options.steps - options.start_step();
			assert!(run >= last, "strength {} ran {run} steps, fewer than {last}", i as f32 / 20.0);
			last = run;
		}
		assert_eq!(last, 50);
	}

	#[test]
	fn strength_out_of_range_is_clamped() {
		assert_eq!(Img2ImgOptions::default().with_steps(10).with_strength(3.0).start_step(), 0);
		assert_eq!(Img2ImgOptions::default().with_steps(10).with_strength(-1.0).start_step(), 10);
		assert_eq!(Img2ImgOptions::default().with_steps(10).with_strength(f32::NAN).start_step(), 10);
	}

	#[test]
	fn reference_image_is_nchw_in_unit_range() {
		let mut image = RgbImage::new(16, 8);
		image.put_pixel(3, 5, Rgb([255, 0, 255]));
		let options = Img2ImgOptions::default().with_image(&DynamicImage::ImageRgb8(image)).unwrap();

		let tensor = options.reference_image.unwrap();
		assert_eq!(tensor.shape(), &[1, 3, 8, 16]);
		assert_eq!(tensor[[0, 0, 5, 3]], 1.0);
		assert_eq!(tensor[[0, 1, 5, 3]], -1.0);
		assert_eq!(tensor[[0, 2, 5, 3]], 1.0);
		assert_eq!(tensor[[0, 0, 0, 0]], -1.0);
	}

	#[test]
	fn reference_image_must_be_multiple_of_8() {
		let image = DynamicImage::new_rgb8(100, 64);
		assert!(Img2ImgOptions::default().with_image(&image).is_err());
	}

	#[test]
	fn progress_every_third_step_and_the_last() {
		let calls = RefCell::new(Vec::new());
		let cb = |step: usize, total: usize| {
			calls.borrow_mut().push((step, total));
			true
		};
		let progress = every_nth_step(3, &cb);
		assert!((1..=10).all(|step| progress(step, 10)));
		drop(progress);
		assert_eq!(calls.into_inner(), vec![(3, 10), (6, 10), (9, 10), (10, 10)]);
	}

	#[test]
	fn progress_frequency_zero_reports_every_step() {
		let calls = RefCell::new(Vec::new());
		let cb = |step: usize, _: usize| {
			calls.borrow_mut().push(step);
			true
		};
		let progress = every_nth_step(0, &cb);
		(1..=4).for_each(|step| assert!(progress(step, 4)));
		drop(progress);
		assert_eq!(calls.into_inner(), vec![1, 2, 3, 4]);

		match Img2ImgOptions::default().callback_progress(0, |_, _| true).callback {
			Some(StableDiffusionCallback::Progress { frequency, .. }) => assert_eq!(frequency, 1),
			None => panic!("callback was not registered")
		}
	}

	#[test]
	fn progress_cancellation_is_forwarded() {
		let cb = |step: usize, _: usize| step < 4;
		let progress = every_nth_step(2, &cb);
		assert!(progress(1, 10));
		assert!(progress(2, 10));
		assert!(progress(3, 10));
		assert!(!progress(4, 10));
		// skipped steps never cancel
		assert!(progress(5, 10));
		assert!(!progress(6, 10));
	}

	#[test]
	fn prompts_and_seed() {
		let options = Img2ImgOptions::default().with_prompts("a fox", Some("blurry")).with_seed(7);
		assert_eq!(options.positive_prompt, "a fox");
		assert_eq!(options.negative_prompt.as_deref(), Some("blurry"));
		assert_eq!(options.seed, Some(7));
		assert_eq!(options.with_random_seed().seed, None);
	}
}
