#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::dbg_macro,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Streaming archive creation and extraction.
//!
//! Both pipelines drive an abstract codec through the capability traits in
//! [`codec`]; no archive backend is linked here. The compressor walks a
//! source tree depth-first, resolves hardlinks through the codec's link
//! resolver and applies per-format constraints from a policy table. The
//! extractor scans first, sanitizes every entry path against the chosen
//! destination (directory-escape attacks collapse into the destination) and
//! extracts with per-entry conflict callbacks, reapplying directory metadata
//! at the end.

pub mod codec;
pub mod compressor;
pub mod extractor;
pub mod paths;

mod encoding;
mod users;

pub use compressor::{Compressor, CompressorHost, CompressorOptions};
pub use extractor::{ConflictAction, Extractor, ExtractorHost, ExtractorOptions};

use std::path::PathBuf;

use lode_fs::FileIoError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] FileIoError),
	#[error(transparent)]
	Codec(#[from] codec::CodecError),
	#[error("the input is not an archive")]
	NotAnArchive,
	#[error("the archive contains no entries")]
	EmptyArchive,
	#[error("the provided passphrase does not decrypt the archive")]
	IncorrectPassphrase,
	#[error("invalid archive format: {0}")]
	InvalidFormat(String),
	#[error("invalid archive filter: {0}")]
	InvalidFilter(String),
	#[error("a parent of an entry exists and is not a directory: <path='{}'>", .0.display())]
	NotADirectory(PathBuf),
	#[error("the operation was cancelled")]
	Cancelled,
	#[error("internal error: {0}")]
	Internal(String),
}

impl From<tokio::task::JoinError> for Error {
	fn from(e: tokio::task::JoinError) -> Self {
		Self::Internal(format!("archive worker died: {e}"))
	}
}

/// Host that ignores every signal; the default for both pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl CompressorHost for NullHost {}
impl ExtractorHost for NullHost {}
