//! Two-phase archive extraction with path sanitization.
//!
//! Phase A scans the whole archive, sanitizing every entry path against the
//! output directory. Phase B picks the real destination from the common
//! prefix of the sanitized paths, consulting the host. Phase C re-reads the
//! archive and writes entries, running the conflict callback per entry and
//! refusing to ever follow a symlinked parent. Phase D reapplies directory
//! metadata that extraction perturbed.

use crate::{
	codec::{ByteSource, Codec, CodecError, Entry, EntryType, ReadCodec},
	compressor::strip_archive_extension,
	paths::{common_prefix, sanitize_entry_path},
	users::OwnerLookup,
	Error,
};

use lode_fs::FileIoError;

use std::{
	collections::HashMap,
	fs::{self, File},
	io::{Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	sync::Arc,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
	/// Best-effort delete of the existing path, then extract under the same
	/// name. Non-empty directories survive the delete, preventing mass data
	/// loss.
	Overwrite,
	/// Extract this entry to the given path instead; rechecked for conflicts.
	ChangeDestination(PathBuf),
	Skip,
	/// Treated as [`ConflictAction::Skip`].
	Unhandled,
}

/// Host-side callbacks for an extraction run.
pub trait ExtractorHost: Send + Sync + 'static {
	fn scanned(&self, total_files: u64) {
		let _ = total_files;
	}

	/// Offered the computed destination and the sanitized file list; a
	/// returned path replaces the destination.
	fn decide_destination(&self, dest: &Path, files: &[PathBuf]) -> Option<PathBuf> {
		let _ = (dest, files);
		None
	}

	fn conflict(&self, file: &Path) -> ConflictAction {
		let _ = file;
		ConflictAction::Unhandled
	}

	/// Asked exactly once per archive, on the first encrypted entry.
	fn request_passphrase(&self) -> Option<String> {
		None
	}

	fn on_progress(&self, completed_bytes: u64, completed_files: u64) {
		let _ = (completed_bytes, completed_files);
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorOptions {
	pub passphrase: Option<String>,
	pub delete_after_extraction: bool,
	/// Minimum microseconds between progress notifications.
	pub notify_interval_us: u64,
	/// Directory name used when the archive has no common prefix.
	pub suggested_destname: Option<String>,
}

impl Default for ExtractorOptions {
	fn default() -> Self {
		Self {
			passphrase: None,
			delete_after_extraction: false,
			notify_interval_us: 100_000,
			suggested_destname: None,
		}
	}
}

/// Single-use streaming extractor.
pub struct Extractor<C: Codec> {
	codec: Arc<C>,
	options: ExtractorOptions,
	host: Arc<dyn ExtractorHost>,
}

impl<C: Codec> Extractor<C> {
	#[must_use]
	pub fn new(codec: Arc<C>, options: ExtractorOptions) -> Self {
		Self {
			codec,
			options,
			host: Arc::new(crate::NullHost),
		}
	}

	#[must_use]
	pub fn with_host(mut self, host: Arc<dyn ExtractorHost>) -> Self {
		self.host = host;
		self
	}

	/// Extracts `archive` under `output`, returning the chosen destination.
	#[instrument(skip(self, cancel), fields(archive = %archive.display(), output = %output.display()))]
	pub async fn run(
		self,
		archive: PathBuf,
		output: PathBuf,
		cancel: CancellationToken,
	) -> Result<PathBuf, Error> {
		let Self {
			codec,
			options,
			host,
		} = self;

		tokio::task::spawn_blocking(move || {
			run_sync(codec.as_ref(), &options, host.as_ref(), &archive, &output, &cancel)
		})
		.await?
	}
}

struct ScanResult {
	/// Sanitized path (against the output dir) per entry.
	files: Vec<PathBuf>,
	total_bytes: u64,
	/// The archive only opened in raw mode.
	raw: bool,
	/// Passphrase gathered from options or the host.
	passphrase: Option<String>,
}

enum DestDecision {
	/// The common prefix matches the archive name: extract as-is.
	UseOutput,
	/// Re-root the common prefix.
	RenamePrefix { from: PathBuf, to: PathBuf },
	/// No common prefix: everything goes below this directory.
	Subdir(PathBuf),
}

fn run_sync<C: Codec>(
	codec: &C,
	options: &ExtractorOptions,
	host: &dyn ExtractorHost,
	archive: &Path,
	output: &Path,
	cancel: &CancellationToken,
) -> Result<PathBuf, Error> {
	let scan = scan_archive(codec, options, host, archive, output, cancel)?;

	host.scanned(scan.files.len() as u64);
	debug!(files = scan.files.len(), total_bytes = scan.total_bytes, "archive scanned");

	let decision = decide_destination(options, host, archive, output, &scan.files);

	let destination =
		extract_archive(codec, options, host, archive, output, &scan, &decision, cancel)?;

	if options.delete_after_extraction {
		if let Err(e) = fs::remove_file(archive) {
			warn!(archive = %archive.display(), ?e, "failed to delete source archive");
		}
	}

	Ok(destination)
}

fn open_reader<C: Codec>(
	codec: &C,
	archive: &Path,
	raw_only: bool,
	passphrase: Option<&str>,
) -> Result<Box<dyn ReadCodec>, CodecError> {
	let mut reader = codec.read_new();
	if raw_only {
		reader.support_format_raw();
		reader.support_filter_all();
	} else {
		reader.support_format_all();
	}
	if let Some(passphrase) = passphrase {
		reader.add_passphrase(passphrase);
	}
	reader.open(Box::new(FileSource::new(archive.to_path_buf())))?;
	Ok(reader)
}

/// Phase A: read every header, sanitize and accumulate totals.
fn scan_archive<C: Codec>(
	codec: &C,
	options: &ExtractorOptions,
	host: &dyn ExtractorHost,
	archive: &Path,
	output: &Path,
	cancel: &CancellationToken,
) -> Result<ScanResult, Error> {
	let (mut reader, raw) = match open_reader(codec, archive, false, options.passphrase.as_deref())
	{
		Ok(reader) => (reader, false),
		Err(e) => {
			trace!(?e, "auto-detection failed, retrying as raw");
			let reader = open_reader(codec, archive, true, options.passphrase.as_deref())
				.map_err(|_| Error::NotAnArchive)?;

			// A raw stream with no filter layers is just a copy of the input.
			if reader.filter_count() <= 1 {
				return Err(Error::NotAnArchive);
			}
			(reader, true)
		}
	};

	let mut passphrase = options.passphrase.clone();
	let mut asked = false;
	let mut files = Vec::new();
	let mut total_bytes = 0_u64;

	while let Some(entry) = reader.next_header()? {
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		if entry.encrypted && passphrase.is_none() && !asked {
			asked = true;
			passphrase = host.request_passphrase();
		}

		files.push(sanitize_entry_path(&entry.pathname, output));
		total_bytes += entry.size.unwrap_or(0);
		reader.data_skip()?;
	}

	if files.is_empty() {
		return Err(Error::EmptyArchive);
	}

	Ok(ScanResult {
		files,
		total_bytes,
		raw,
		passphrase,
	})
}

fn archive_stem(archive: &Path) -> String {
	let name = archive.file_name().map_or_else(
		|| "archive".to_string(),
		|name| name.to_string_lossy().into_owned(),
	);
	let stripped = strip_archive_extension(&name);
	if stripped == name {
		Path::new(&name)
			.file_stem()
			.map_or(name.clone(), |stem| stem.to_string_lossy().into_owned())
	} else {
		stripped.to_string()
	}
}

/// Phase B: pick the real destination from the common prefix.
fn decide_destination(
	options: &ExtractorOptions,
	host: &dyn ExtractorHost,
	archive: &Path,
	output: &Path,
	files: &[PathBuf],
) -> DestDecision {
	let stem = archive_stem(archive);

	match common_prefix(output, files) {
		Some(prefix) => {
			let base = prefix
				.file_name()
				.map(|name| name.to_string_lossy().into_owned())
				.unwrap_or_default();
			let base_stem = Path::new(&base)
				.file_stem()
				.map(|stem| stem.to_string_lossy().into_owned())
				.unwrap_or_default();

			// The archive already wraps everything in a directory named after
			// itself; avoid a redundant second wrapper.
			if base == stem || base_stem == stem {
				return DestDecision::UseOutput;
			}

			match host.decide_destination(&prefix, files) {
				Some(new_prefix) if new_prefix != prefix => DestDecision::RenamePrefix {
					from: prefix,
					to: new_prefix,
				},
				_ => DestDecision::UseOutput,
			}
		}
		None => {
			let destname = options.suggested_destname.clone().unwrap_or(stem);
			let dest = output.join(destname);
			let dest = host.decide_destination(&dest, files).unwrap_or(dest);
			DestDecision::Subdir(dest)
		}
	}
}

enum Conflict {
	/// The entry's own path exists and is not a directory.
	Entry,
	/// An ancestor exists and is not a directory (or is a symlink, which is
	/// never followed).
	Parent(PathBuf),
}

fn find_conflict(target: &Path, base: &Path) -> Option<Conflict> {
	let mut current = target.to_path_buf();

	loop {
		if current == base || !current.starts_with(base) {
			return None;
		}

		if let Ok(metadata) = fs::symlink_metadata(&current) {
			let is_entry = current == target;

			// Symlinked parents are always conflicts: following one would
			// let the archive escape the destination.
			if metadata.file_type().is_symlink() || !metadata.is_dir() {
				if is_entry {
					return Some(Conflict::Entry);
				}
				return Some(Conflict::Parent(current));
			}
		}

		match current.parent() {
			Some(parent) => current = parent.to_path_buf(),
			None => return None,
		}
	}
}

struct ExtractCtx<'a> {
	host: &'a dyn ExtractorHost,
	owners: OwnerLookup,
	/// Raw archive pathname → extracted disk path, for hardlinks.
	extracted: HashMap<String, PathBuf>,
	extracted_dirs: Vec<(PathBuf, Entry)>,
	completed_bytes: u64,
	completed_files: u64,
	total_bytes: u64,
	last_notify: Instant,
	notify_interval: Duration,
}

impl ExtractCtx<'_> {
	fn maybe_notify(&mut self) {
		if self.last_notify.elapsed() >= self.notify_interval {
			self.last_notify = Instant::now();
			self.host
				.on_progress(self.completed_bytes, self.completed_files);
		}
	}
}

/// Phase C, D and the 100% progress of phase E.
#[allow(clippy::too_many_lines, clippy::too_many_arguments)]
fn extract_archive<C: Codec>(
	codec: &C,
	options: &ExtractorOptions,
	host: &dyn ExtractorHost,
	archive: &Path,
	output: &Path,
	scan: &ScanResult,
	decision: &DestDecision,
	cancel: &CancellationToken,
) -> Result<PathBuf, Error> {
	let mut reader = open_reader(codec, archive, scan.raw, scan.passphrase.as_deref())?;

	let (destination, base) = match decision {
		DestDecision::UseOutput => (output.to_path_buf(), output.to_path_buf()),
		DestDecision::RenamePrefix { to, .. } => (to.clone(), output.to_path_buf()),
		DestDecision::Subdir(dest) => (dest.clone(), dest.clone()),
	};

	fs::create_dir_all(&base)
		.map_err(|e| FileIoError::from((&base, e, "failed to create destination")))?;

	let mut ctx = ExtractCtx {
		host,
		owners: OwnerLookup::default(),
		extracted: HashMap::new(),
		extracted_dirs: Vec::new(),
		completed_bytes: 0,
		completed_files: 0,
		total_bytes: scan.total_bytes,
		last_notify: Instant::now(),
		notify_interval: Duration::from_micros(options.notify_interval_us),
	};

	'entries: while let Some(entry) = reader.next_header()? {
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		// Re-sanitize against the possibly replaced destination.
		let mut target = match decision {
			DestDecision::UseOutput => sanitize_entry_path(&entry.pathname, output),
			DestDecision::RenamePrefix { from, to } => {
				let sanitized = sanitize_entry_path(&entry.pathname, output);
				match sanitized.strip_prefix(from) {
					Ok(rel) => to.join(rel),
					Err(_) => sanitized,
				}
			}
			DestDecision::Subdir(dest) => sanitize_entry_path(&entry.pathname, dest),
		};

		// Conflict walk from the entry up to the destination.
		loop {
			match find_conflict(&target, &base) {
				None => break,
				Some(Conflict::Parent(parent)) => {
					// Malicious or corrupt archive; never work around it.
					return Err(Error::NotADirectory(parent));
				}
				Some(Conflict::Entry) => match host.conflict(&target) {
					ConflictAction::Overwrite => {
						overwrite_delete(&target);
						break;
					}
					ConflictAction::ChangeDestination(new_target) => {
						target = new_target;
					}
					ConflictAction::Skip | ConflictAction::Unhandled => {
						ctx.total_bytes = ctx.total_bytes.saturating_sub(entry.size.unwrap_or(0));
						reader.data_skip()?;
						continue 'entries;
					}
				},
			}
		}

		write_entry(&mut ctx, reader.as_mut(), &entry, &target, cancel)?;
		ctx.completed_files += 1;
		ctx.maybe_notify();
	}

	// Phase D: directory metadata was perturbed by extracting the contents.
	for (path, entry) in std::mem::take(&mut ctx.extracted_dirs) {
		apply_metadata(&mut ctx.owners, &path, &entry, false);
	}

	// Phase E: force progress to completion.
	host.on_progress(ctx.total_bytes.max(ctx.completed_bytes), ctx.completed_files);

	Ok(destination)
}

/// Best-effort delete for overwrite conflicts; non-empty directories are left
/// in place.
fn overwrite_delete(target: &Path) {
	let result = match fs::symlink_metadata(target) {
		Ok(metadata) if metadata.is_dir() => fs::remove_dir(target),
		Ok(_) => fs::remove_file(target),
		Err(_) => return,
	};

	if let Err(e) = result {
		trace!(target = %target.display(), ?e, "overwrite delete failed");
	}
}

fn write_entry(
	ctx: &mut ExtractCtx<'_>,
	reader: &mut dyn ReadCodec,
	entry: &Entry,
	target: &Path,
	cancel: &CancellationToken,
) -> Result<(), Error> {
	if let Some(parent) = target.parent() {
		fs::create_dir_all(parent)
			.map_err(|e| FileIoError::from((parent, e, "failed to create parents")))?;
	}

	match entry.entry_type {
		EntryType::Regular => {
			if let Some(link_target) = entry.hardlink_target.as_deref() {
				if try_hardlink(ctx, link_target, target) {
					apply_metadata(&mut ctx.owners, target, entry, false);
					return Ok(());
				}
				// Fall back to an empty regular file; the content lives at
				// the link source.
				if let Err(e) = File::create(target) {
					warn!(target = %target.display(), ?e, "hardlink fallback failed");
				}
				apply_metadata(&mut ctx.owners, target, entry, false);
				return Ok(());
			}

			stream_to_file(ctx, reader, target, cancel)?;
			ctx.extracted
				.insert(entry.pathname_lossy().into_owned(), target.to_path_buf());
			apply_metadata(&mut ctx.owners, target, entry, false);
		}

		EntryType::Directory => {
			fs::create_dir_all(target)
				.map_err(|e| FileIoError::from((target, e, "failed to create directory")))?;
			// Mode stays permissive until phase D so children can be written.
			ctx.extracted_dirs.push((target.to_path_buf(), entry.clone()));
		}

		EntryType::Symlink => {
			let link_target = entry.symlink_target.clone().unwrap_or_default();
			#[cfg(unix)]
			if let Err(e) = std::os::unix::fs::symlink(&link_target, target) {
				warn!(target = %target.display(), ?e, "failed to create symlink");
			}
			apply_metadata(&mut ctx.owners, target, entry, true);
		}

		EntryType::Fifo | EntryType::Socket | EntryType::BlockDevice | EntryType::CharDevice => {
			if !make_special(entry, target) {
				// Placeholder so the tree shape survives; non-fatal.
				if let Err(e) = File::create(target) {
					warn!(target = %target.display(), ?e, "special-file placeholder failed");
				}
			}
			apply_metadata(&mut ctx.owners, target, entry, false);
		}
	}

	Ok(())
}

fn try_hardlink(ctx: &ExtractCtx<'_>, link_target: &str, target: &Path) -> bool {
	let Some(source) = ctx.extracted.get(link_target) else {
		return false;
	};

	match fs::hard_link(source, target) {
		Ok(()) => true,
		Err(e) => {
			warn!(
				source = %source.display(),
				target = %target.display(),
				?e,
				"hardlink failed"
			);
			false
		}
	}
}

fn stream_to_file(
	ctx: &mut ExtractCtx<'_>,
	reader: &mut dyn ReadCodec,
	target: &Path,
	cancel: &CancellationToken,
) -> Result<(), Error> {
	let mut file = File::create(target)
		.map_err(|e| FileIoError::from((target, e, "failed to create output file")))?;

	loop {
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let block = match reader.read_data_block() {
			Ok(Some(block)) => block,
			Ok(None) => break,
			Err(e) if e.data_failure => return Err(Error::IncorrectPassphrase),
			Err(e) => return Err(Error::Codec(e)),
		};

		match block.data {
			Some(data) => {
				file.write_all(&data)
					.map_err(|e| FileIoError::from((target, e, "failed to write contents")))?;
				ctx.completed_bytes += data.len() as u64;
			}
			None => {
				// Sparse hole: advance without writing.
				#[allow(clippy::cast_possible_wrap)]
				file.seek(SeekFrom::Current(block.size as i64))
					.map_err(|e| FileIoError::from((target, e, "failed to seek past hole")))?;
				ctx.completed_bytes += block.size;
			}
		}

		ctx.maybe_notify();
	}

	Ok(())
}

fn make_special(entry: &Entry, target: &Path) -> bool {
	#[cfg(unix)]
	{
		use std::{ffi::CString, os::unix::ffi::OsStrExt};

		let Ok(cpath) = CString::new(target.as_os_str().as_bytes()) else {
			return false;
		};

		let mode = entry.mode.unwrap_or(0o644) & 0o7777;
		let rdev = entry.rdev.unwrap_or(0);

		#[allow(clippy::cast_possible_truncation)]
		let result = match entry.entry_type {
			// SAFETY: cpath is a valid NUL-terminated path.
			EntryType::Fifo => unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) },
			EntryType::Socket => unsafe {
				libc::mknod(
					cpath.as_ptr(),
					libc::S_IFSOCK | mode as libc::mode_t,
					rdev as libc::dev_t,
				)
			},
			EntryType::BlockDevice => unsafe {
				libc::mknod(
					cpath.as_ptr(),
					libc::S_IFBLK | mode as libc::mode_t,
					rdev as libc::dev_t,
				)
			},
			EntryType::CharDevice => unsafe {
				libc::mknod(
					cpath.as_ptr(),
					libc::S_IFCHR | mode as libc::mode_t,
					rdev as libc::dev_t,
				)
			},
			_ => return false,
		};

		result == 0
	}
	#[cfg(not(unix))]
	{
		let _ = (entry, target);
		false
	}
}

struct FileSource {
	path: PathBuf,
	file: Option<File>,
}

impl FileSource {
	fn new(path: PathBuf) -> Self {
		Self { path, file: None }
	}

	fn file(&mut self) -> Result<&mut File, CodecError> {
		self.file
			.as_mut()
			.ok_or_else(|| CodecError::new(-1, "source is not open"))
	}
}

impl ByteSource for FileSource {
	fn open(&mut self) -> Result<(), CodecError> {
		let file = File::open(&self.path).map_err(|e| {
			CodecError::new(
				e.raw_os_error().unwrap_or(-1),
				format!("failed to open {}: {e}", self.path.display()),
			)
		})?;
		self.file = Some(file);
		Ok(())
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, CodecError> {
		self.file()?
			.read(buf)
			.map_err(|e| CodecError::new(e.raw_os_error().unwrap_or(-1), e.to_string()))
	}

	fn seek(&mut self, pos: SeekFrom) -> Result<u64, CodecError> {
		self.file()?
			.seek(pos)
			.map_err(|e| CodecError::new(e.raw_os_error().unwrap_or(-1), e.to_string()))
	}

	fn skip(&mut self, n: u64) -> Result<u64, CodecError> {
		#[allow(clippy::cast_possible_wrap)]
		self.seek(SeekFrom::Current(n as i64)).map(|_| n)
	}

	fn close(&mut self) -> Result<(), CodecError> {
		self.file = None;
		Ok(())
	}
}

/// Applies ownership, times and mode; failures are expected for unprivileged
/// runs and never fatal.
fn apply_metadata(owners: &mut OwnerLookup, path: &Path, entry: &Entry, is_symlink: bool) {
	#[cfg(unix)]
	{
		use std::{ffi::CString, os::unix::ffi::OsStrExt};

		// Prefer names (mapped through the local databases) over raw ids.
		let uid = entry
			.uname
			.as_deref()
			.and_then(|name| owners.uid_for_name(name))
			.or_else(|| entry.uid.and_then(|uid| u32::try_from(uid).ok()));
		let gid = entry
			.gname
			.as_deref()
			.and_then(|name| owners.gid_for_name(name))
			.or_else(|| entry.gid.and_then(|gid| u32::try_from(gid).ok()));

		if let (Some(uid), Some(gid)) = (uid, gid) {
			if let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) {
				// SAFETY: cpath is a valid NUL-terminated path; lchown never
				// follows symlinks.
				let _ = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
			}
		}
	}

	if let Some((secs, nanos)) = entry.mtime {
		let mtime = filetime::FileTime::from_unix_time(secs, nanos);
		let atime = entry
			.atime
			.map_or(mtime, |(secs, nanos)| {
				filetime::FileTime::from_unix_time(secs, nanos)
			});

		let result = if is_symlink {
			filetime::set_symlink_file_times(path, atime, mtime)
		} else {
			filetime::set_file_times(path, atime, mtime)
		};
		if let Err(e) = result {
			trace!(path = %path.display(), ?e, "failed to set times");
		}
	}

	#[cfg(unix)]
	if !is_symlink {
		if let Some(mode) = entry.mode {
			use std::os::unix::fs::PermissionsExt;

			if let Err(e) =
				fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
			{
				trace!(path = %path.display(), ?e, "failed to set mode");
			}
		}
	}
}
