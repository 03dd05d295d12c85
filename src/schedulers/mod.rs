//! Schedulers take in the output of a trained model, a sample which the diffusion process is iterating on, and a
//! timestep to return a denoised sample.
//!
//! For image-to-image, the scheduler also decides how much noise to add to the encoded input image before denoising
//! starts, see [`DiffusionScheduler::add_noise`].

use ndarray::{Array4, ArrayView1, ArrayView4};

mod euler_discrete;
pub use self::euler_discrete::*;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule, used by Stable Diffusion.
	ScaledLinear
}

/// The output returned by a scheduler's `step` function.
#[derive(Debug)]
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(|s| s.view())
	}

	/// Consumes the output, returning the previous sample.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}
}

/// A scheduler to be used in diffusion pipelines.
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler {
	/// Scales the denoising model input to match the scheduler's noise level at `timestep`.
	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>>;

	/// Sets the number of inference steps. This should be called before `step` to properly compute the sigmas and
	/// timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>) -> anyhow::Result<SchedulerStepOutput>;

	/// Adds noise to the given samples, at the noise level of `timestep`.
	// NOTE: huggingface diffusers takes a `[batch_size]` array of timesteps here, but all elements are identical in
	// the img2img pipeline, so this takes a single float
	fn add_noise(&self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>>;

	/// Returns the computed scheduler timesteps.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32;

	/// Returns the number of train timesteps.
	fn len(&self) -> usize;
}

/// Piecewise linear interpolation of `fp` sampled at `xp = 0, 1, 2, ...`, clamped at both ends.
pub(crate) fn interp_unit_grid(x: f32, fp: ArrayView1<'_, f32>) -> f32 {
	let last = fp.len() - 1;
	if x <= 0.0 {
		return fp[0];
	}
	if x >= last as f32 {
		return fp[last];
	}
	let low = x.floor() as usize;
	let frac = x - low as f32;
	fp[low] + (fp[low + 1] - fp[low]) * frac
}

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::interp_unit_grid;

	#[test]
	fn interpolates_between_samples() {
		let fp = array![0.0_f32, 10.0, 20.0];
		assert_eq!(interp_unit_grid(0.5, fp.view()), 5.0);
		assert_eq!(interp_unit_grid(1.25, fp.view()), 12.5);
	}

	#[test]
	fn clamps_outside_the_grid() {
		let fp = array![1.0_f32, 2.0];
		assert_eq!(interp_unit_grid(-3.0, fp.view()), 1.0);
		assert_eq!(interp_unit_grid(9.0, fp.view()), 2.0);
	}
}
