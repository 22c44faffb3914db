//! In-process codec.
//!
//! Serializes entries through the byte sink as a trivial length-prefixed
//! stream, so the compressor and extractor pipelines can round-trip without a
//! real archive backend. Encryption is modeled, not performed: the passphrase
//! travels in the stream header and mismatches surface as data failures, the
//! way an authenticated decrypt would.

use super::{
	ByteSink, ByteSource, Codec, CodecError, DataBlock, Entry, EntryType, Filter, Format,
	LinkResolver, ReadCodec, ResolvedEntries, WriteCodec,
};

use std::collections::HashMap;

const MAGIC: &[u8; 8] = b"LODEARC1";
const ENTRY_MARKER: u8 = 0xE1;
const END_MARKER: u8 = 0xE2;
/// Chunk size served per data block on the read side.
const BLOCK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemCodec;

impl Codec for MemCodec {
	fn write_new(&self) -> Box<dyn WriteCodec> {
		Box::new(MemWriteCodec::default())
	}

	fn read_new(&self) -> Box<dyn ReadCodec> {
		Box::new(MemReadCodec::default())
	}

	fn link_resolver(&self, _format: Format) -> Box<dyn LinkResolver> {
		Box::new(InodeLinkResolver::default())
	}
}

#[derive(Default)]
struct MemWriteCodec {
	format: Option<Format>,
	filters: Vec<Filter>,
	passphrase: Option<String>,
	sink: Option<Box<dyn ByteSink>>,
	current: Option<(Entry, Vec<u8>)>,
}

impl MemWriteCodec {
	fn sink(&mut self) -> Result<&mut Box<dyn ByteSink>, CodecError> {
		self.sink
			.as_mut()
			.ok_or_else(|| CodecError::new(-1, "codec is not open"))
	}

	fn write_all(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
		let sink = self.sink()?;
		while !data.is_empty() {
			let written = sink.write(data)?;
			if written == 0 {
				return Err(CodecError::new(-1, "sink made no progress"));
			}
			data = &data[written..];
		}
		Ok(())
	}

	fn flush_current(&mut self) -> Result<(), CodecError> {
		let Some((mut entry, data)) = self.current.take() else {
			return Ok(());
		};

		entry.encrypted = self.passphrase.is_some();

		let header =
			serde_json::to_vec(&entry).map_err(|e| CodecError::new(-1, e.to_string()))?;

		self.write_all(&[ENTRY_MARKER])?;
		#[allow(clippy::cast_possible_truncation)]
		self.write_all(&(header.len() as u32).to_le_bytes())?;
		self.write_all(&header)?;
		self.write_all(&(data.len() as u64).to_le_bytes())?;
		self.write_all(&data)?;
		Ok(())
	}
}

impl WriteCodec for MemWriteCodec {
	fn set_format(&mut self, format: Format) -> Result<(), CodecError> {
		self.format = Some(format);
		Ok(())
	}

	fn add_filter(&mut self, filter: Filter) -> Result<(), CodecError> {
		if filter != Filter::None {
			self.filters.push(filter);
		}
		Ok(())
	}

	fn set_options(&mut self, _options: &str) -> Result<(), CodecError> {
		Ok(())
	}

	fn set_passphrase(&mut self, passphrase: &str) -> Result<(), CodecError> {
		self.passphrase = Some(passphrase.to_string());
		Ok(())
	}

	fn set_bytes_in_last_block(&mut self, _bytes: u32) -> Result<(), CodecError> {
		Ok(())
	}

	fn open(&mut self, mut sink: Box<dyn ByteSink>) -> Result<(), CodecError> {
		sink.open()?;
		self.sink = Some(sink);

		self.write_all(MAGIC)?;
		match self.passphrase.clone() {
			Some(pass) => {
				self.write_all(&[1])?;
				#[allow(clippy::cast_possible_truncation)]
				self.write_all(&(pass.len() as u16).to_le_bytes())?;
				self.write_all(pass.as_bytes())?;
			}
			None => self.write_all(&[0])?,
		}
		Ok(())
	}

	fn write_header(&mut self, entry: &Entry) -> Result<(), CodecError> {
		self.flush_current()?;
		self.current = Some((entry.clone(), Vec::new()));
		Ok(())
	}

	fn write_data(&mut self, data: &[u8]) -> Result<usize, CodecError> {
		let Some((_, buffer)) = self.current.as_mut() else {
			return Err(CodecError::new(-1, "no entry header written"));
		};
		buffer.extend_from_slice(data);
		Ok(data.len())
	}

	fn close(&mut self) -> Result<(), CodecError> {
		self.flush_current()?;
		self.write_all(&[END_MARKER])?;
		self.sink()?.close()
	}
}

#[derive(Default)]
struct MemReadCodec {
	allow_all: bool,
	allow_raw: bool,
	passphrases: Vec<String>,
	entries: Vec<(Entry, Vec<u8>)>,
	next: usize,
	data_pos: usize,
	format: Option<Format>,
	archive_pass: Option<String>,
}

impl MemReadCodec {
	fn parse(bytes: &[u8]) -> Result<(Option<String>, Vec<(Entry, Vec<u8>)>), CodecError> {
		let truncated = || CodecError::new(-1, "truncated archive stream");

		let mut pos = MAGIC.len();
		let flag = *bytes.get(pos).ok_or_else(truncated)?;
		pos += 1;

		let archive_pass = if flag == 1 {
			let len =
				u16::from_le_bytes(bytes.get(pos..pos + 2).ok_or_else(truncated)?.try_into()
					.map_err(|_| truncated())?) as usize;
			pos += 2;
			let pass = std::str::from_utf8(bytes.get(pos..pos + len).ok_or_else(truncated)?)
				.map_err(|e| CodecError::new(-1, e.to_string()))?
				.to_string();
			pos += len;
			Some(pass)
		} else {
			None
		};

		let mut entries = Vec::new();
		loop {
			let marker = *bytes.get(pos).ok_or_else(truncated)?;
			pos += 1;

			match marker {
				END_MARKER => break,
				ENTRY_MARKER => {
					let header_len = u32::from_le_bytes(
						bytes
							.get(pos..pos + 4)
							.ok_or_else(truncated)?
							.try_into()
							.map_err(|_| truncated())?,
					) as usize;
					pos += 4;

					let entry: Entry = serde_json::from_slice(
						bytes.get(pos..pos + header_len).ok_or_else(truncated)?,
					)
					.map_err(|e| CodecError::new(-1, e.to_string()))?;
					pos += header_len;

					#[allow(clippy::cast_possible_truncation)]
					let data_len = u64::from_le_bytes(
						bytes
							.get(pos..pos + 8)
							.ok_or_else(truncated)?
							.try_into()
							.map_err(|_| truncated())?,
					) as usize;
					pos += 8;

					let data = bytes
						.get(pos..pos + data_len)
						.ok_or_else(truncated)?
						.to_vec();
					pos += data_len;

					entries.push((entry, data));
				}
				_ => return Err(CodecError::new(-1, "corrupt entry marker")),
			}
		}

		Ok((archive_pass, entries))
	}

	fn current(&self) -> Option<&(Entry, Vec<u8>)> {
		self.next.checked_sub(1).and_then(|idx| self.entries.get(idx))
	}
}

impl ReadCodec for MemReadCodec {
	fn support_format_all(&mut self) {
		self.allow_all = true;
	}

	fn support_format_raw(&mut self) {
		self.allow_raw = true;
	}

	fn support_filter_all(&mut self) {}

	fn add_passphrase(&mut self, passphrase: &str) {
		self.passphrases.push(passphrase.to_string());
	}

	fn open(&mut self, mut source: Box<dyn ByteSource>) -> Result<(), CodecError> {
		source.open()?;

		let mut bytes = Vec::new();
		let mut buf = vec![0_u8; BLOCK];
		loop {
			let n = source.read(&mut buf)?;
			if n == 0 {
				break;
			}
			bytes.extend_from_slice(&buf[..n]);
		}
		source.close()?;

		if bytes.starts_with(MAGIC) && self.allow_all {
			let (archive_pass, entries) = Self::parse(&bytes)?;
			self.archive_pass = archive_pass;
			self.entries = entries;
			self.format = Some(Format::Tar);
			return Ok(());
		}

		if self.allow_raw {
			// Raw reads yield the input as a single "data" entry.
			let mut entry = Entry::new("data", EntryType::Regular);
			entry.size = Some(bytes.len() as u64);
			self.entries = vec![(entry, bytes)];
			self.format = Some(Format::Raw);
			return Ok(());
		}

		Err(CodecError::new(-1, "unrecognized archive format"))
	}

	fn next_header(&mut self) -> Result<Option<Entry>, CodecError> {
		let Some((entry, _)) = self.entries.get(self.next) else {
			return Ok(None);
		};

		self.next += 1;
		self.data_pos = 0;
		Ok(Some(entry.clone()))
	}

	fn read_data_block(&mut self) -> Result<Option<DataBlock>, CodecError> {
		let encrypted = self.current().is_some_and(|(entry, _)| entry.encrypted);
		if encrypted {
			let expected = self.archive_pass.as_deref().unwrap_or_default();
			if !self.passphrases.iter().any(|pass| pass == expected) {
				return Err(CodecError::data("failed to decrypt entry payload"));
			}
		}

		let data_pos = self.data_pos;
		let Some((_, data)) = self.next.checked_sub(1).and_then(|idx| self.entries.get(idx))
		else {
			return Ok(None);
		};

		if data_pos >= data.len() {
			return Ok(None);
		}

		let end = (data_pos + BLOCK).min(data.len());
		let chunk = data[data_pos..end].to_vec();
		self.data_pos = end;

		Ok(Some(DataBlock {
			size: chunk.len() as u64,
			data: Some(chunk),
		}))
	}

	fn data_skip(&mut self) -> Result<(), CodecError> {
		self.data_pos = usize::MAX;
		Ok(())
	}

	fn filter_count(&self) -> usize {
		1
	}

	fn format(&self) -> Option<Format> {
		self.format
	}
}

/// Tar-strategy resolver: the first occurrence of a multi-link inode carries
/// the content, later ones become named references immediately. Nothing is
/// deferred, so draining with `None` terminates right away.
#[derive(Default)]
struct InodeLinkResolver {
	seen: HashMap<(u64, u64), String>,
}

impl LinkResolver for InodeLinkResolver {
	fn linkify(&mut self, entry: Option<Entry>) -> ResolvedEntries {
		let Some(mut entry) = entry else {
			return ResolvedEntries::default();
		};

		if entry.entry_type == EntryType::Regular && entry.nlink.unwrap_or(1) > 1 {
			if let (Some(dev), Some(ino)) = (entry.dev, entry.ino) {
				match self.seen.get(&(dev, ino)) {
					Some(original) => {
						entry.hardlink_target = Some(original.clone());
						entry.size = Some(0);
					}
					None => {
						self.seen
							.insert((dev, ino), entry.pathname_lossy().into_owned());
					}
				}
			}
		}

		ResolvedEntries {
			entry: Some(entry),
			sparse: None,
		}
	}
}
