use anyhow::anyhow;
use ndarray::{concatenate, s, Array1, Array4, ArrayView1, ArrayView4, Axis};

use super::{interp_unit_grid, BetaSchedule, DiffusionScheduler, SchedulerStepOutput};
use crate::config::SchedulerConfig;

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
	alphas_cumprod: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas for stepping the
	///   model; see [`BetaSchedule`]
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		if num_train_timesteps == 0 {
			anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
		}
		if !beta_start.is_normal() || !beta_end.is_normal() {
			anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
		}
		if beta_start >= beta_end {
			anyhow::bail!("beta_start must be < beta_end");
		}

		let betas = match beta_schedule {
			BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
			BetaSchedule::ScaledLinear => {
				let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
		};

		let alphas = 1.0 - betas;

		let alphas_cumprod = alphas
			.view()
			.into_iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<_>>();

		let sigmas = sigmas_from_alphas(&alphas_cumprod);
		let sigmas = concatenate![Axis(0), sigmas.slice(s![..;-1]), Array1::zeros(1,)];

		let timesteps = Array1::linspace(0.0, num_train_timesteps as f32 - 1.0, num_train_timesteps)
			.slice(s![..;-1])
			.to_owned();

		// standard deviation of the initial noise distribution
		let init_noise_sigma = sigmas
			.iter()
			.copied()
			.reduce(f32::max)
			.ok_or_else(|| anyhow!("init_noise_sigma could not be reduced from sigmas - this should never happen"))?;

		Ok(Self {
			alphas_cumprod,
			sigmas,
			init_noise_sigma,
			timesteps,
			num_train_timesteps
		})
	}

	/// Creates the scheduler described by a model's `[scheduler]` section, using a scaled linear beta schedule.
	pub fn from_config(config: &SchedulerConfig) -> anyhow::Result<Self> {
		Self::new(config.train_timesteps, config.beta_start, config.beta_end, &BetaSchedule::ScaledLinear)
	}

	/// The noise level of each inference step, followed by a final `0.0`.
	pub fn sigmas(&self) -> ArrayView1<'_, f32> {
		self.sigmas.view()
	}

	fn sigma_at(&self, timestep: f32) -> anyhow::Result<(usize, f32)> {
		let step_index = self
			.timesteps
			.iter()
			.position(|&p| p == timestep)
			.ok_or_else(|| anyhow!("timestep out of this scheduler's bounds: {timestep}"))?;
		let sigma = self
			.sigmas
			.get(step_index)
			.copied()
			.ok_or_else(|| anyhow!("step_index {step_index} out of sigma bounds - this shouldn't happen"))?;
		Ok((step_index, sigma))
	}
}

fn sigmas_from_alphas(alphas_cumprod: &Array1<f32>) -> Array1<f32> {
	let mut sigmas = alphas_cumprod.clone();
	sigmas.par_map_inplace(|f| {
		*f = ((1.0 - *f) / *f).sqrt();
	});
	sigmas
}

impl Default for EulerDiscreteScheduler {
	fn default() -> Self {
		Self::from_config(&SchedulerConfig::default()).expect("default Stable Diffusion v1 schedule is valid")
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>> {
		let (_, sigma) = self.sigma_at(timestep)?;
		Ok(sample.to_owned() / (sigma.powi(2) + 1.0).sqrt())
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {

		let timesteps = Array1::linspace(0.0_f32, (self.num_train_timesteps - 1) as f32, num_inference_steps)
			.slice(s![..;-1])
			.to_owned();

		let sigmas = sigmas_from_alphas(&self.alphas_cumprod);
		let n_timesteps = timesteps.len();
		let mut sigmas_int = Array1::zeros((n_timesteps + 1,));
		for (i, x) in timesteps.iter().enumerate() {
			sigmas_int[i] = interp_unit_grid(*x, sigmas.view());
		}
		sigmas_int[n_timesteps] = 0.0;

		self.init_noise_sigma = sigmas_int.iter().copied().fold(0.0, f32::max);
		self.sigmas = sigmas_int;
		self.timesteps = timesteps;
	}

	// s_churn is fixed at 0, so sigma_hat == sigma and no noise is injected during the step
	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>) -> anyhow::Result<SchedulerStepOutput> {
		let (step_index, sigma) = self.sigma_at(timestep)?;

		let pred_original_sample = &sample - &(model_output.to_owned() * sigma);
		let derivative = (&sample - &pred_original_sample) / sigma;
		let dt = self.sigmas[step_index + 1] - sigma;

		let prev_sample = &sample + &(derivative * dt);

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}

	fn add_noise(&self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>> {
		let (_, sigma) = self.sigma_at(timestep)?;
		Ok(&original_samples + &(noise.to_owned() * sigma))
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
	}

	fn len(&self) -> usize {
		self.num_train_timesteps
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::*;

	#[test]
	fn rejects_bad_betas() {
		assert!(EulerDiscreteScheduler::new(0, 0.1, 0.2, &BetaSchedule::Linear).is_err());
		assert!(EulerDiscreteScheduler::new(1000, 0.2, 0.1, &BetaSchedule::Linear).is_err());
		assert!(EulerDiscreteScheduler::new(1000, 0.0, 0.1, &BetaSchedule::ScaledLinear).is_err());
	}

	#[test]
	fn timesteps_descend_and_sigmas_end_at_zero() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(30);

		let timesteps = scheduler.timesteps();
		assert_eq!(timesteps.len(), 30);
		assert!((timesteps[0] - 999.0).abs() < 1e-3);
		assert_eq!(timesteps[29], 0.0);
		assert!(timesteps.windows(2).into_iter().all(|w| w[0] > w[1]));

		let sigmas = scheduler.sigmas();
		assert_eq!(sigmas.len(), 31);
		assert_eq!(sigmas[30], 0.0);
		assert!(sigmas.windows(2).into_iter().all(|w| w[0] > w[1]));
		assert_eq!(scheduler.init_noise_sigma(), sigmas[0]);
	}

	#[test]
	fn add_noise_without_noise_is_identity() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(10);
		let t = scheduler.timesteps()[3];

		let sample = Array4::from_elem((1, 4, 2, 2), 0.5_f32);
		let noise = Array4::zeros((1, 4, 2, 2));
		let noised = scheduler.add_noise(sample.view(), noise.view(), t).unwrap();
		assert_eq!(noised, sample);
	}

	#[test]
	fn add_noise_scales_by_sigma() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(10);
		let t = scheduler.timesteps()[0];
		let sigma = scheduler.sigmas()[0];

		let sample = Array4::zeros((1, 4, 2, 2));
		let noise = Array4::ones((1, 4, 2, 2));
		let noised = scheduler.add_noise(sample.view(), noise.view(), t).unwrap();
		assert!(noised.iter().all(|v| (v - sigma).abs() < 1e-6));
	}

	#[test]
	fn unknown_timestep_is_an_error() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(10);
		let sample = Array4::zeros((1, 4, 2, 2));
		assert!(scheduler.scale_model_input(sample.view(), 0.5).is_err());
	}

	#[test]
	fn last_step_returns_predicted_original() {
		let mut scheduler = EulerDiscreteScheduler::default();
		scheduler.set_timesteps(5);
		let t = scheduler.timesteps()[4];

		let sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
		let model_output = Array4::from_elem((1, 4, 2, 2), 0.25_f32);
		let output = scheduler.step(model_output.view(), t, sample.view()).unwrap();

		// the final sigma is 0, so the step lands exactly on x_0
		let pred = output.pred_original_sample().unwrap();
		assert!(output.prev_sample().iter().zip(pred.iter()).all(|(a, b)| (a - b).abs() < 1e-5));
	}
}
