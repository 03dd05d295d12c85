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

use std::{cell::RefCell, path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use kdam::{tqdm, Bar, BarExt};
use sd_img2img::{
	generate, DiffusionDevice, Error, GenerateConfig, OrtEnvironment, Precision, ProgressCallback, StableDiffusionOptions, StableDiffusionPipeline
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transform an image with a text prompt using a pretrained Stable Diffusion model.
#[derive(Parser, Debug)]
#[command(name = "sd-img2img", version, about, long_about = None)]
struct Args {
	/// Text prompt for generation.
	#[arg(long)]
	prompt: String,

	/// Input image path.
	#[arg(long, value_name = "PATH")]
	input: PathBuf,

	/// Output image path; the format follows the extension.
	#[arg(long, value_name = "PATH")]
	output: PathBuf,

	/// Number of inference steps.
	#[arg(long, default_value_t = 30)]
	steps: usize,

	/// Guidance scale.
	#[arg(long, default_value_t = 7.5)]
	guidance: f32,

	/// Prompt strength, from 0.0 (keep the input) to 1.0 (mostly ignore it).
	#[arg(long, default_value_t = 0.8)]
	strength: f32,

	/// Things the output should not look like.
	#[arg(long)]
	negative_prompt: Option<String>,

	/// Seed for reproducible output.
	#[arg(long)]
	seed: Option<u64>,

	/// Model directory containing a `model.toml`.
	#[arg(long, env = "SD_IMG2IMG_MODEL", default_value = "stable-diffusion-v1-5", value_name = "DIR")]
	model: PathBuf,

	/// Run on the CPU even if CUDA is available.
	#[arg(long)]
	cpu: bool,

	/// Enable debug logging.
	#[arg(short, long)]
	verbose: bool
}

fn main() -> ExitCode {
	let args = Args::parse();

	let log_level = if args.verbose { "debug" } else { "info" };
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("sd_img2img={log_level},ort=warn").into()))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();

	if let Err(err) = run(args) {
		tracing::error!("{err:#}");
		return ExitCode::FAILURE;
	}

	ExitCode::SUCCESS
}

fn run(args: Args) -> anyhow::Result<()> {
	let config = GenerateConfig {
		prompt: args.prompt,
		negative_prompt: args.negative_prompt,
		input: args.input,
		output: args.output,
		steps: args.steps,
		guidance: args.guidance,
		strength: args.strength,
		seed: args.seed
	};
	// fail on bad arguments before spending time loading the model
	config.validate()?;

	let device = if args.cpu { DiffusionDevice::CPU } else { DiffusionDevice::detect() };
	let precision = Precision::for_device(&device);
	if !device.is_accelerator() && !args.cpu {
		tracing::warn!("no CUDA device available; running on the CPU at full precision, this will be slow");
	}

	let environment = OrtEnvironment::builder()
		.with_name("sd-img2img")
		.build()
		.context("failed to initialize ONNX Runtime")?
		.into_arc();
	let pipeline = StableDiffusionPipeline::new(&environment, &args.model, StableDiffusionOptions { device, precision })
		.map_err(|source| Error::ModelLoad { path: args.model.clone(), source })?;

	let pb: RefCell<Option<Bar>> = RefCell::new(None);
	let progress = |step: usize, total: usize| {
		let mut pb = pb.borrow_mut();
		let pb = pb.get_or_insert_with(|| tqdm!(total = total, desc = "denoising"));
		pb.update_to(step);
		true
	};

	let progress: ProgressCallback<'_> = &progress;

	generate::generate(&pipeline, &config, Some(progress))?;
	eprintln!();

	Ok(())
}

#[cfg(test)]
mod tests {
	use clap::{error::ErrorKind, Parser};

	use super::Args;

	#[test]
	fn defaults_match_the_documented_cli() {
		let args = Args::try_parse_from(["sd-img2img", "--prompt", "a fox", "--input", "in.png", "--output", "out.png"]).unwrap();
		assert_eq!(args.prompt, "a fox");
		assert_eq!(args.steps, 30);
		assert_eq!(args.guidance, 7.5);
		assert_eq!(args.strength, 0.8);
		assert_eq!(args.seed, None);
		assert!(!args.cpu);
	}

	#[test]
	fn prompt_is_required() {
		let err = Args::try_parse_from(["sd-img2img", "--input", "in.png", "--output", "out.png"]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
	}

	#[test]
	fn output_is_required() {
		let err = Args::try_parse_from(["sd-img2img", "--prompt", "a fox", "--input", "in.png"]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
	}

	#[test]
	fn steps_must_be_an_integer() {
		let err = Args::try_parse_from(["sd-img2img", "--prompt", "p", "--input", "i", "--output", "o", "--steps", "2.5"]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::ValueValidation);
	}

	#[test]
	fn optional_flags_parse() {
		let args = Args::try_parse_from([
			"sd-img2img",
			"--prompt",
			"p",
			"--input",
			"i",
			"--output",
			"o",
			"--negative-prompt",
			"blurry",
			"--seed",
			"42",
			"--strength",
			"0.3",
			"--model",
			"./sd2",
			"--cpu"
		])
		.unwrap();
		assert_eq!(args.negative_prompt.as_deref(), Some("blurry"));
		assert_eq!(args.seed, Some(42));
		assert_eq!(args.strength, 0.3);
		assert_eq!(args.model, std::path::PathBuf::from("./sd2"));
		assert!(args.cpu);
	}
}
