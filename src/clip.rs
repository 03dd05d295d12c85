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

//! CLIP tokenizer implementation.

use std::path::Path;

use anyhow::Context;
use ndarray::Array2;
use tokenizers::Tokenizer;

use crate::config::TokenizerConfig;

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer.
///
/// Stable Diffusion conditions its UNet on CLIP text embeddings; prompts are tokenized into fixed-length sequences
/// before being passed to the text encoder.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	bos_token_id: u32,
	eos_token_id: u32
}

impl CLIPStandardTokenizer {
	/// Loads a CLIP tokenizer described by `config`, resolving its path against the model `root`.
	pub fn from_config(root: impl AsRef<Path>, config: &TokenizerConfig) -> anyhow::Result<Self> {
		let path = root.as_ref().join(&config.path);
		let bytes = std::fs::read(&path).with_context(|| format!("could not read tokenizer {}", path.display()))?;
		Self::from_bytes(bytes, config.model_max_length, config.bos_token, config.eos_token)
	}

	/// Loads a CLIP tokenizer from the bytes of a `tokenizer.json`.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let tokenizer: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		Ok(Self {
			inner: tokenizer,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the maximum length of tokens this tokenizer supports. For most CLIP models, this is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Encodes a single prompt into token IDs, wrapped in beginning- and end-of-string tokens and padded or truncated
	/// to [`CLIPStandardTokenizer::len`].
	pub fn encode(&self, prompt: &str) -> anyhow::Result<Vec<u32>> {
		let encoding = self.inner.encode(prompt, false).map_err(|e| anyhow::anyhow!("{e:?}"))?;
		Ok(fit_to_length(encoding.get_ids(), self.model_max_length, self.bos_token_id, self.eos_token_id))
	}

	/// Encodes the input prompts into an [`Array2`] to be passed to a CLIPTextModel.
	pub fn encode_for_text_model(&self, prompts: &[&str]) -> anyhow::Result<Array2<i32>> {
		let mut ids = Vec::with_capacity(prompts.len() * self.len());
		for prompt in prompts {
			ids.extend(self.encode(prompt)?.into_iter().map(|tok| tok as i32));
		}
		Ok(Array2::from_shape_vec((prompts.len(), self.len()), ids)?)
	}
}

// `<bos> tokens... <eos> <eos>...`, CLIP pads with the end-of-string token
fn fit_to_length(tokens: &[u32], max_length: usize, bos: u32, eos: u32) -> Vec<u32> {
	let body = max_length.saturating_sub(2);
	let mut ids = Vec::with_capacity(max_length);
	ids.push(bos);
	ids.extend(tokens.iter().copied().take(body));
	ids.resize(max_length, eos);
	ids
}

#[cfg(test)]
mod tests {
	use super::fit_to_length;

	#[test]
	fn pads_with_eos() {
		assert_eq!(fit_to_length(&[7, 8], 6, 1, 2), vec![1, 7, 8, 2, 2, 2]);
	}

	#[test]
	fn truncates_long_prompts_keeping_eos() {
		let ids = fit_to_length(&[5; 100], 77, 49406, 49407);
		assert_eq!(ids.len(), 77);
		assert_eq!(ids[0], 49406);
		assert_eq!(ids[75], 5);
		assert_eq!(ids[76], 49407);
	}

	#[test]
	fn empty_prompt_is_bos_then_padding() {
		assert_eq!(fit_to_length(&[], 4, 1, 2), vec![1, 2, 2, 2]);
	}
}
