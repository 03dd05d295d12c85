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

use std::fmt::Debug;

use ndarray::Array4;

mod impl_img2img;
mod impl_main;

pub use self::impl_main::StableDiffusionPipeline;
use crate::{DiffusionDevice, Precision};

/// Options for the Stable Diffusion pipeline: where to place the models, and at which precision to load them.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// The device every model is placed on.
	pub device: DiffusionDevice,
	/// Which graph precision to load. See [`Precision`].
	pub precision: Precision
}

/// Describes a function to be called on each step of the pipeline.
pub enum StableDiffusionCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The number of steps completed so far.
		/// - **`total`** (usize): The number of steps this run will take.
		cb: Box<dyn Fn(usize, usize) -> bool>
	}
}

impl Debug for StableDiffusionCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<StableDiffusionCallback>")
	}
}

/// Options for image-to-image generation, built with the `with_*` methods and executed with
/// [`Img2ImgOptions::run`].
#[derive(Debug)]
pub struct Img2ImgOptions {
	pub(crate) positive_prompt: String,
	pub(crate) negative_prompt: Option<String>,
	pub(crate) steps: usize,
	pub(crate) guidance_scale: f32,
	pub(crate) strength: f32,
	pub(crate) seed: Option<u64>,
	/// NCHW reference image in `[-1, 1]`.
	pub(crate) reference_image: Option<Array4<f32>>,
	pub(crate) callback: Option<StableDiffusionCallback>
}
