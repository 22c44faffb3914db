//! One-shot streaming archive creation.

use crate::{
	codec::{
		ByteSink, Codec, CodecError, Entry, EntryType, Filter, Format, LinkResolver, WriteCodec,
	},
	users::OwnerLookup,
	Error,
};

use lode_fs::FileIoError;

use std::{
	collections::HashMap,
	fs::{self, File, Metadata},
	io::{Read, Write},
	path::{Path, PathBuf},
	sync::Arc,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Bytes streamed per codec write.
const CHUNK: usize = 64 * 1024;
/// Zero-progress writes tolerated per chunk before giving up.
const WRITE_RETRY_LIMIT: u32 = 5;

/// Host-side observer for a compression run.
pub trait CompressorHost: Send + Sync + 'static {
	/// Emitted once the destination is fixed, before any byte is written.
	fn decide_destination(&self, dest: &Path) {
		let _ = dest;
	}

	fn on_progress(&self, completed_bytes: u64, completed_files: u64) {
		let _ = (completed_bytes, completed_files);
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorOptions {
	pub format: Format,
	pub filter: Filter,
	/// Only honored by encrypting formats (ZIP, with AES-256).
	pub passphrase: Option<String>,
	/// Prefix all entries with a directory named after the first source.
	pub create_top_level_directory: bool,
	/// Treat the output path as the final archive path instead of a
	/// directory to place the archive in.
	pub output_is_dest: bool,
	/// Minimum microseconds between progress notifications.
	pub notify_interval_us: u64,
}

impl Default for CompressorOptions {
	fn default() -> Self {
		Self {
			format: Format::Tar,
			filter: Filter::None,
			passphrase: None,
			create_top_level_directory: true,
			output_is_dest: false,
			notify_interval_us: 100_000,
		}
	}
}

/// Per-format behavior table.
#[derive(Debug, Clone, Copy)]
struct FormatPolicy {
	base_name_only: bool,
	refuse_directories: bool,
	refuse_symlinks: bool,
	refuse_special: bool,
	supports_filters: bool,
	supports_encryption: bool,
}

const fn policy_for(format: Format) -> FormatPolicy {
	match format {
		Format::Ar | Format::ArBsd | Format::ArGnu => FormatPolicy {
			base_name_only: true,
			refuse_directories: true,
			refuse_symlinks: true,
			refuse_special: true,
			supports_filters: false,
			supports_encryption: false,
		},
		Format::Zip => FormatPolicy {
			base_name_only: false,
			refuse_directories: false,
			refuse_symlinks: false,
			refuse_special: true,
			supports_filters: false,
			supports_encryption: true,
		},
		Format::SevenZip => FormatPolicy {
			base_name_only: false,
			refuse_directories: false,
			refuse_symlinks: false,
			refuse_special: false,
			supports_filters: false,
			supports_encryption: false,
		},
		Format::Cpio
		| Format::Pax
		| Format::PaxRestricted
		| Format::Raw
		| Format::Tar
		| Format::Ustar => FormatPolicy {
			base_name_only: false,
			refuse_directories: false,
			refuse_symlinks: false,
			refuse_special: false,
			supports_filters: true,
			supports_encryption: false,
		},
	}
}

/// Single-use streaming compressor.
pub struct Compressor<C: Codec> {
	codec: Arc<C>,
	options: CompressorOptions,
	host: Arc<dyn CompressorHost>,
}

impl<C: Codec> Compressor<C> {
	#[must_use]
	pub fn new(codec: Arc<C>, options: CompressorOptions) -> Self {
		Self {
			codec,
			options,
			host: Arc::new(crate::NullHost),
		}
	}

	#[must_use]
	pub fn with_host(mut self, host: Arc<dyn CompressorHost>) -> Self {
		self.host = host;
		self
	}

	/// Produces one archive from `sources` (in input order), returning the
	/// destination path.
	#[instrument(skip(self, cancel), fields(output = %output.display()))]
	pub async fn run(
		self,
		sources: Vec<PathBuf>,
		output: PathBuf,
		cancel: CancellationToken,
	) -> Result<PathBuf, Error> {
		let Self {
			codec,
			options,
			host,
		} = self;

		tokio::task::spawn_blocking(move || {
			run_sync(codec.as_ref(), &options, host.as_ref(), &sources, &output, &cancel)
		})
		.await?
	}
}

struct Ctx<'a> {
	writer: Box<dyn WriteCodec>,
	resolver: Box<dyn LinkResolver>,
	host: &'a dyn CompressorHost,
	cancel: &'a CancellationToken,
	policy: FormatPolicy,
	owners: OwnerLookup,
	/// Archive pathname → disk file, for deferred link-resolver output.
	pathname_to_file: HashMap<String, PathBuf>,
	completed_bytes: u64,
	completed_files: u64,
	last_notify: Instant,
	notify_interval: Duration,
}

impl Ctx<'_> {
	fn maybe_notify(&mut self) {
		if self.last_notify.elapsed() >= self.notify_interval {
			self.last_notify = Instant::now();
			self.host
				.on_progress(self.completed_bytes, self.completed_files);
		}
	}
}

fn run_sync<C: Codec>(
	codec: &C,
	options: &CompressorOptions,
	host: &dyn CompressorHost,
	sources: &[PathBuf],
	output: &Path,
	cancel: &CancellationToken,
) -> Result<PathBuf, Error> {
	if options.format == Format::Raw {
		return Err(Error::InvalidFormat("raw streams cannot be written".into()));
	}
	let policy = policy_for(options.format);

	if options.filter != Filter::None && !policy.supports_filters {
		return Err(Error::InvalidFilter(format!(
			"format {} does not take a {} filter",
			options.format, options.filter
		)));
	}

	let first = sources
		.first()
		.ok_or_else(|| Error::Internal("no sources given".into()))?;

	let dest = decide_dest(options, sources, output)?;
	host.decide_destination(&dest);
	debug!(dest = %dest.display(), "archive destination decided");

	let mut writer = codec.write_new();
	writer.set_format(options.format)?;
	if options.filter != Filter::None {
		writer.add_filter(options.filter)?;
	}

	if let Some(passphrase) = options.passphrase.as_deref() {
		if policy.supports_encryption {
			writer.set_options("zip:encryption=aes256")?;
			writer.set_passphrase(passphrase)?;
		} else {
			warn!(format = %options.format, "format cannot encrypt, ignoring passphrase");
		}
	}

	writer.set_bytes_in_last_block(1)?;
	writer.open(Box::new(FileSink::new(dest.clone())))?;

	let mut ctx = Ctx {
		writer,
		resolver: codec.link_resolver(options.format),
		host,
		cancel,
		policy,
		owners: OwnerLookup::default(),
		pathname_to_file: HashMap::new(),
		completed_bytes: 0,
		completed_files: 0,
		last_notify: Instant::now(),
		notify_interval: Duration::from_micros(options.notify_interval_us),
	};

	let top_level = options.create_top_level_directory.then(|| {
		let name = first.file_name().map_or_else(
			|| "archive".to_string(),
			|name| name.to_string_lossy().into_owned(),
		);
		match name.split_once('.') {
			Some((stem, _)) if !stem.is_empty() => stem.to_string(),
			_ => name,
		}
	});

	let result = (|| {
		for source in sources {
			let metadata = fs::symlink_metadata(source)
				.map_err(|e| FileIoError::from((source, e, "failed to stat source")))?;
			let entry_type = entry_type_of(&metadata);

			if refused(ctx.policy, entry_type) {
				// Per-format constraint: the whole source is skipped.
				trace!(source = %source.display(), "source refused by format policy");
				continue;
			}

			let basename = source.file_name().map_or_else(
				|| "data".to_string(),
				|name| name.to_string_lossy().into_owned(),
			);

			let archive_path = if ctx.policy.base_name_only {
				basename
			} else {
				match top_level.as_deref() {
					Some(top) => format!("{top}/{basename}"),
					None => basename,
				}
			};

			add_path(&mut ctx, source, &archive_path, &metadata)?;
		}

		// Drain entries the resolver held back.
		loop {
			let resolved = ctx.resolver.linkify(None);
			if resolved.entry.is_none() && resolved.sparse.is_none() {
				break;
			}
			for entry in [resolved.entry, resolved.sparse].into_iter().flatten() {
				write_resolved(&mut ctx, entry, None)?;
			}
		}

		ctx.writer.close()?;
		Ok(())
	})();

	match result {
		Ok(()) => {
			host.on_progress(ctx.completed_bytes, ctx.completed_files);
			Ok(dest)
		}
		Err(e) => Err(e),
	}
}

/// Emits one disk path (recursing into directories, depth-first, directories
/// before their contents).
fn add_path(
	ctx: &mut Ctx<'_>,
	disk_path: &Path,
	archive_path: &str,
	metadata: &Metadata,
) -> Result<(), Error> {
	if ctx.cancel.is_cancelled() {
		return Err(Error::Cancelled);
	}

	let entry_type = entry_type_of(metadata);
	if refused(ctx.policy, entry_type) {
		trace!(path = %disk_path.display(), "entry refused by format policy");
		return Ok(());
	}

	let entry = build_entry(ctx, disk_path, archive_path, metadata, entry_type)?;
	let disk_size = metadata.len();

	let resolved = ctx.resolver.linkify(Some(entry));
	for entry in [resolved.entry, resolved.sparse].into_iter().flatten() {
		ctx.pathname_to_file
			.insert(entry.pathname_lossy().into_owned(), disk_path.to_path_buf());
		write_resolved(ctx, entry, Some((disk_path, disk_size)))?;
	}

	if entry_type == EntryType::Directory {
		let children = fs::read_dir(disk_path)
			.map_err(|e| FileIoError::from((disk_path, e, "failed to read directory")))?;

		for child in children {
			let child =
				child.map_err(|e| FileIoError::from((disk_path, e, "failed to read entry")))?;
			let child_path = child.path();
			let child_metadata = fs::symlink_metadata(&child_path)
				.map_err(|e| FileIoError::from((&child_path, e, "failed to stat entry")))?;

			let child_archive_path = format!(
				"{archive_path}/{}",
				child.file_name().to_string_lossy()
			);

			add_path(ctx, &child_path, &child_archive_path, &child_metadata)?;
		}
	}

	Ok(())
}

/// Writes a resolver-produced entry: header, then content for regular
/// entries that carry their own data.
fn write_resolved(
	ctx: &mut Ctx<'_>,
	entry: Entry,
	disk: Option<(&Path, u64)>,
) -> Result<(), Error> {
	ctx.writer.write_header(&entry)?;

	let carries_content = entry.entry_type == EntryType::Regular
		&& entry.hardlink_target.is_none()
		&& entry.size.unwrap_or(0) > 0;

	if carries_content {
		let path = match disk {
			Some((path, _)) => path.to_path_buf(),
			// Deferred entries name a file recorded in the pathname map.
			None => ctx
				.pathname_to_file
				.get(entry.pathname_lossy().as_ref())
				.cloned()
				.ok_or_else(|| {
					Error::Internal(format!(
						"deferred entry without a recorded file: {}",
						entry.pathname_lossy()
					))
				})?,
		};
		stream_file(ctx, &path)?;
	} else {
		// Progress stays monotonic with input even for header-only entries.
		ctx.completed_bytes += disk.map_or(0, |(_, size)| size);
	}

	ctx.completed_files += 1;
	ctx.maybe_notify();
	Ok(())
}

fn stream_file(ctx: &mut Ctx<'_>, path: &Path) -> Result<(), Error> {
	let mut file =
		File::open(path).map_err(|e| FileIoError::from((path, e, "failed to open for reading")))?;
	let mut buf = vec![0_u8; CHUNK];

	loop {
		if ctx.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let n = file
			.read(&mut buf)
			.map_err(|e| FileIoError::from((path, e, "failed to read file contents")))?;
		if n == 0 {
			break;
		}

		let mut off = 0;
		let mut stalled = 0_u32;
		while off < n {
			if ctx.cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let written = ctx.writer.write_data(&buf[off..n])?;
			if written == 0 {
				stalled += 1;
				if stalled >= WRITE_RETRY_LIMIT {
					return Err(Error::Codec(CodecError::new(
						-1,
						"codec made no progress writing entry data",
					)));
				}
			} else {
				stalled = 0;
				off += written;
			}
		}

		ctx.completed_bytes += n as u64;
		ctx.maybe_notify();
	}

	Ok(())
}

fn build_entry(
	ctx: &mut Ctx<'_>,
	disk_path: &Path,
	archive_path: &str,
	metadata: &Metadata,
	entry_type: EntryType,
) -> Result<Entry, Error> {
	let mut entry = Entry::new(archive_path, entry_type);

	if entry_type == EntryType::Regular {
		entry.size = Some(metadata.len());
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;

		entry.mode = Some(metadata.mode());
		entry.uid = Some(u64::from(metadata.uid()));
		entry.gid = Some(u64::from(metadata.gid()));
		entry.uname = ctx.owners.name_for_uid(metadata.uid());
		entry.gname = ctx.owners.name_for_gid(metadata.gid());
		entry.dev = Some(metadata.dev());
		entry.ino = Some(metadata.ino());
		entry.nlink = Some(metadata.nlink());
		entry.rdev = Some(metadata.rdev());

		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		{
			entry.mtime = Some((metadata.mtime(), metadata.mtime_nsec() as u32));
			entry.atime = Some((metadata.atime(), metadata.atime_nsec() as u32));
			entry.ctime = Some((metadata.ctime(), metadata.ctime_nsec() as u32));
		}
	}

	if let Ok(created) = metadata.created() {
		if let Ok(since_epoch) = created.duration_since(std::time::UNIX_EPOCH) {
			#[allow(clippy::cast_possible_wrap)]
			{
				entry.birthtime = Some((since_epoch.as_secs() as i64, since_epoch.subsec_nanos()));
			}
		}
	}

	if entry_type == EntryType::Symlink {
		let target = fs::read_link(disk_path)
			.map_err(|e| FileIoError::from((disk_path, e, "failed to read symlink target")))?;
		// Stored verbatim; relative targets stay relative.
		entry.symlink_target = Some(target.to_string_lossy().into_owned());
	}

	Ok(entry)
}

fn entry_type_of(metadata: &Metadata) -> EntryType {
	let file_type = metadata.file_type();

	if file_type.is_dir() {
		return EntryType::Directory;
	}
	if file_type.is_symlink() {
		return EntryType::Symlink;
	}
	if file_type.is_file() {
		return EntryType::Regular;
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::FileTypeExt;

		if file_type.is_fifo() {
			return EntryType::Fifo;
		}
		if file_type.is_socket() {
			return EntryType::Socket;
		}
		if file_type.is_block_device() {
			return EntryType::BlockDevice;
		}
		if file_type.is_char_device() {
			return EntryType::CharDevice;
		}
	}

	EntryType::Regular
}

const fn refused(policy: FormatPolicy, entry_type: EntryType) -> bool {
	match entry_type {
		EntryType::Directory => policy.refuse_directories,
		EntryType::Symlink => policy.refuse_symlinks,
		EntryType::Fifo | EntryType::Socket | EntryType::BlockDevice | EntryType::CharDevice => {
			policy.refuse_special
		}
		EntryType::Regular => false,
	}
}

/// Known archive suffixes, longest first so compound ones win.
const ARCHIVE_SUFFIXES: &[&str] = &[
	".tar.bz2", ".tar.gz", ".tar.xz", ".tar.zst", ".cpio", ".tbz2", ".tgz", ".txz", ".7z",
	".tar", ".zip", ".a",
];

pub(crate) fn strip_archive_extension(name: &str) -> &str {
	for suffix in ARCHIVE_SUFFIXES {
		if let Some(stripped) = name.strip_suffix(suffix) {
			if !stripped.is_empty() {
				return stripped;
			}
		}
	}
	name
}

fn decide_dest(
	options: &CompressorOptions,
	sources: &[PathBuf],
	output: &Path,
) -> Result<PathBuf, Error> {
	if options.output_is_dest {
		if let Some(parent) = output.parent() {
			fs::create_dir_all(parent)
				.map_err(|e| FileIoError::from((parent, e, "failed to create parents")))?;
		}
		return Ok(output.to_path_buf());
	}

	let first = sources
		.first()
		.ok_or_else(|| Error::Internal("no sources given".into()))?;
	let metadata = fs::symlink_metadata(first)
		.map_err(|e| FileIoError::from((first, e, "failed to stat source")))?;

	let mut base = first.file_name().map_or_else(
		|| "archive".to_string(),
		|name| name.to_string_lossy().into_owned(),
	);
	if metadata.is_file() {
		base = strip_archive_extension(&base).to_string();
	}

	let extension = format!(
		"{}{}",
		options.format.extension(),
		options.filter.extension()
	);

	fs::create_dir_all(output)
		.map_err(|e| FileIoError::from((output, e, "failed to create output directory")))?;

	let mut dest = output.join(format!("{base}{extension}"));
	let mut n = 1_u32;
	while fs::symlink_metadata(&dest).is_ok() {
		dest = output.join(format!("{base}({n}){extension}"));
		n += 1;
	}

	Ok(dest)
}

struct FileSink {
	path: PathBuf,
	file: Option<File>,
}

impl FileSink {
	fn new(path: PathBuf) -> Self {
		Self { path, file: None }
	}
}

impl ByteSink for FileSink {
	fn open(&mut self) -> Result<(), CodecError> {
		let file = File::create(&self.path).map_err(|e| {
			CodecError::new(
				e.raw_os_error().unwrap_or(-1),
				format!("failed to create {}: {e}", self.path.display()),
			)
		})?;
		self.file = Some(file);
		Ok(())
	}

	fn write(&mut self, data: &[u8]) -> Result<usize, CodecError> {
		let file = self
			.file
			.as_mut()
			.ok_or_else(|| CodecError::new(-1, "sink is not open"))?;
		file.write(data)
			.map_err(|e| CodecError::new(e.raw_os_error().unwrap_or(-1), e.to_string()))
	}

	fn close(&mut self) -> Result<(), CodecError> {
		if let Some(mut file) = self.file.take() {
			file.flush()
				.map_err(|e| CodecError::new(e.raw_os_error().unwrap_or(-1), e.to_string()))?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::strip_archive_extension;

	#[test]
	fn archive_extensions_are_stripped_longest_first() {
		assert_eq!(strip_archive_extension("backup.tar.gz"), "backup");
		assert_eq!(strip_archive_extension("backup.tar"), "backup");
		assert_eq!(strip_archive_extension("photo.jpg"), "photo.jpg");
		assert_eq!(strip_archive_extension(".tar"), ".tar");
	}
}
