//! Capability interface to the archive codec.
//!
//! Mirrors the narrow surface the pipelines need: a write side fed through a
//! byte sink, a read side pulling from a byte source (with seek/skip so raw
//! detection can rewind), entry records and a hardlink resolver. The [`mem`]
//! module implements the whole interface in-process for tests and demos.

pub mod mem;

use std::{borrow::Cow, io::SeekFrom};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Format {
	Ar,
	ArBsd,
	ArGnu,
	Cpio,
	Pax,
	PaxRestricted,
	Raw,
	SevenZip,
	Tar,
	Ustar,
	Zip,
}

impl Format {
	#[must_use]
	pub const fn extension(self) -> &'static str {
		match self {
			Self::Ar | Self::ArBsd | Self::ArGnu => ".a",
			Self::Cpio => ".cpio",
			Self::Pax | Self::PaxRestricted | Self::Tar | Self::Ustar => ".tar",
			Self::Raw => "",
			Self::SevenZip => ".7z",
			Self::Zip => ".zip",
		}
	}
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Filter {
	#[default]
	None,
	Bzip2,
	Compress,
	Gzip,
	Lz4,
	Lzip,
	Lzma,
	Lzop,
	Xz,
	Zstd,
}

impl Filter {
	#[must_use]
	pub const fn extension(self) -> &'static str {
		match self {
			Self::None => "",
			Self::Bzip2 => ".bz2",
			Self::Compress => ".Z",
			Self::Gzip => ".gz",
			Self::Lz4 => ".lz4",
			Self::Lzip => ".lz",
			Self::Lzma => ".lzma",
			Self::Lzop => ".lzo",
			Self::Xz => ".xz",
			Self::Zstd => ".zst",
		}
	}
}

/// Error surfaced by the codec, carrying its errno and message.
#[derive(thiserror::Error, Debug, Clone)]
#[error("codec error {errno}: {message}")]
pub struct CodecError {
	pub errno: i32,
	pub message: String,
	/// Set when entry payload decoding failed; during extraction this is
	/// attributed to an incorrect passphrase.
	pub data_failure: bool,
}

impl CodecError {
	#[must_use]
	pub fn new(errno: i32, message: impl Into<String>) -> Self {
		Self {
			errno,
			message: message.into(),
			data_failure: false,
		}
	}

	#[must_use]
	pub fn data(message: impl Into<String>) -> Self {
		Self {
			errno: -1,
			message: message.into(),
			data_failure: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
	Regular,
	Directory,
	Symlink,
	Fifo,
	Socket,
	BlockDevice,
	CharDevice,
}

/// Mirror of the codec's entry concept.
///
/// `pathname` is raw bytes: archives written on other systems may carry
/// non-UTF-8 names, which the extractor decodes with legacy-codepage
/// fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
	pub pathname: Vec<u8>,
	pub entry_type: EntryType,
	pub size: Option<u64>,
	pub mode: Option<u32>,
	pub uid: Option<u64>,
	pub gid: Option<u64>,
	pub uname: Option<String>,
	pub gname: Option<String>,
	/// Seconds + nanoseconds.
	pub mtime: Option<(i64, u32)>,
	pub atime: Option<(i64, u32)>,
	pub ctime: Option<(i64, u32)>,
	pub birthtime: Option<(i64, u32)>,
	pub dev: Option<u64>,
	pub ino: Option<u64>,
	pub nlink: Option<u64>,
	pub rdev: Option<u64>,
	/// Stored verbatim; never resolved.
	pub symlink_target: Option<String>,
	/// Archive pathname of the entry this one links to.
	pub hardlink_target: Option<String>,
	pub encrypted: bool,
}

impl Entry {
	#[must_use]
	pub fn new(pathname: &str, entry_type: EntryType) -> Self {
		Self {
			pathname: pathname.as_bytes().to_vec(),
			entry_type,
			size: None,
			mode: None,
			uid: None,
			gid: None,
			uname: None,
			gname: None,
			mtime: None,
			atime: None,
			ctime: None,
			birthtime: None,
			dev: None,
			ino: None,
			nlink: None,
			rdev: None,
			symlink_target: None,
			hardlink_target: None,
			encrypted: false,
		}
	}

	#[must_use]
	pub fn pathname_lossy(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(&self.pathname)
	}

	pub fn set_pathname(&mut self, pathname: &str) {
		self.pathname = pathname.as_bytes().to_vec();
	}
}

/// Destination byte stream for the write side.
pub trait ByteSink: Send {
	fn open(&mut self) -> Result<(), CodecError>;

	/// May write fewer bytes than given.
	fn write(&mut self, data: &[u8]) -> Result<usize, CodecError>;

	fn close(&mut self) -> Result<(), CodecError>;
}

/// Source byte stream for the read side; seek/skip enable raw-format
/// re-detection.
pub trait ByteSource: Send {
	fn open(&mut self) -> Result<(), CodecError>;

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, CodecError>;

	fn seek(&mut self, pos: SeekFrom) -> Result<u64, CodecError>;

	fn skip(&mut self, n: u64) -> Result<u64, CodecError>;

	fn close(&mut self) -> Result<(), CodecError>;
}

/// One chunk of entry payload. `data == None` is a legitimate sparse-hole
/// signal and must not be treated as end-of-entry.
#[derive(Debug)]
pub struct DataBlock {
	pub data: Option<Vec<u8>>,
	pub size: u64,
}

pub trait WriteCodec: Send {
	fn set_format(&mut self, format: Format) -> Result<(), CodecError>;

	fn add_filter(&mut self, filter: Filter) -> Result<(), CodecError>;

	/// Option string in `module:key=value` form (e.g.
	/// `zip:encryption=aes256`).
	fn set_options(&mut self, options: &str) -> Result<(), CodecError>;

	fn set_passphrase(&mut self, passphrase: &str) -> Result<(), CodecError>;

	fn set_bytes_in_last_block(&mut self, bytes: u32) -> Result<(), CodecError>;

	fn open(&mut self, sink: Box<dyn ByteSink>) -> Result<(), CodecError>;

	fn write_header(&mut self, entry: &Entry) -> Result<(), CodecError>;

	/// May accept fewer bytes than given; zero means "try again".
	fn write_data(&mut self, data: &[u8]) -> Result<usize, CodecError>;

	fn close(&mut self) -> Result<(), CodecError>;
}

pub trait ReadCodec: Send {
	fn support_format_all(&mut self);

	fn support_format_raw(&mut self);

	fn support_filter_all(&mut self);

	fn add_passphrase(&mut self, passphrase: &str);

	fn open(&mut self, source: Box<dyn ByteSource>) -> Result<(), CodecError>;

	fn next_header(&mut self) -> Result<Option<Entry>, CodecError>;

	fn read_data_block(&mut self) -> Result<Option<DataBlock>, CodecError>;

	fn data_skip(&mut self) -> Result<(), CodecError>;

	/// Number of filter layers including the terminal "none" layer; raw
	/// streams with a count of one are not archives.
	fn filter_count(&self) -> usize;

	fn format(&self) -> Option<Format>;
}

/// Entries produced by one `linkify` step; either may be absent.
#[derive(Debug, Default)]
pub struct ResolvedEntries {
	pub entry: Option<Entry>,
	pub sparse: Option<Entry>,
}

/// Deduplicates hardlinks by dev/inode into at most one content-carrying
/// entry plus named references.
pub trait LinkResolver: Send {
	/// Feed entries with `Some`, then drain deferred entries with `None`
	/// until nothing comes back.
	fn linkify(&mut self, entry: Option<Entry>) -> ResolvedEntries;
}

/// Factory for codec objects; each returned object is single-use.
pub trait Codec: Send + Sync + 'static {
	fn write_new(&self) -> Box<dyn WriteCodec>;

	fn read_new(&self) -> Box<dyn ReadCodec>;

	fn link_resolver(&self, format: Format) -> Box<dyn LinkResolver>;
}
