//! Errors surfaced by the generation routine.

use std::path::PathBuf;

use thiserror::Error;

/// Everything that can abort an image-to-image run.
#[derive(Error, Debug)]
pub enum Error {
	/// A run parameter is out of its valid range.
	#[error("invalid parameter `{name}`: {reason}")]
	InvalidParameter {
		/// Name of the offending parameter.
		name: &'static str,
		/// Why the value was rejected.
		reason: String
	},

	/// The input image path does not exist.
	#[error("input image {} does not exist", .0.display())]
	InputNotFound(PathBuf),

	/// The input image could not be read or decoded.
	#[error("failed to load image from {}", path.display())]
	ImageLoad {
		/// Path of the input image.
		path: PathBuf,
		/// Underlying error.
		#[source]
		source: image::ImageError
	},

	/// The pretrained model could not be loaded.
	#[error("failed to load model from {}", path.display())]
	ModelLoad {
		/// Model directory.
		path: PathBuf,
		/// Underlying error.
		#[source]
		source: anyhow::Error
	},

	/// The pipeline failed while generating.
	#[error("inference failed")]
	Inference(#[source] anyhow::Error),

	/// The pipeline finished without producing any images.
	#[error("pipeline returned no images")]
	EmptyOutput,

	/// The output image could not be encoded or written.
	#[error("failed to save image to {}", path.display())]
	ImageSave {
		/// Destination path.
		path: PathBuf,
		/// Underlying error.
		#[source]
		source: image::ImageError
	}
}

/// Result type alias for generation operations.
pub type Result<T> = std::result::Result<T, Error>;
