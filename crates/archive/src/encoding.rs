//! Legacy codepage decoding for archive entry names.
//!
//! ZIP archives written by old tooling carry CP437 or Windows-1252 names;
//! tarballs from Latin-1 systems carry ISO-8859-1. Decoders are tried in that
//! order for non-UTF-8 pathnames.

/// CP437 high half (0x80..=0xFF).
const CP437_HIGH: [char; 128] = [
	'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
	'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
	'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
	'░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
	'└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
	'╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
	'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
	'≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

/// Windows-1252 0x80..=0x9F block; `None` marks undefined codepoints.
const WIN1252_C1: [Option<char>; 32] = [
	Some('€'),
	None,
	Some('‚'),
	Some('ƒ'),
	Some('„'),
	Some('…'),
	Some('†'),
	Some('‡'),
	Some('ˆ'),
	Some('‰'),
	Some('Š'),
	Some('‹'),
	Some('Œ'),
	None,
	Some('Ž'),
	None,
	None,
	Some('‘'),
	Some('’'),
	Some('“'),
	Some('”'),
	Some('•'),
	Some('–'),
	Some('—'),
	Some('˜'),
	Some('™'),
	Some('š'),
	Some('›'),
	Some('œ'),
	None,
	Some('ž'),
	Some('Ÿ'),
];

pub(crate) fn decode_cp437(bytes: &[u8]) -> Option<String> {
	Some(
		bytes
			.iter()
			.map(|&b| {
				if b < 0x80 {
					char::from(b)
				} else {
					CP437_HIGH[usize::from(b - 0x80)]
				}
			})
			.collect(),
	)
}

pub(crate) fn decode_latin1(bytes: &[u8]) -> Option<String> {
	Some(bytes.iter().map(|&b| char::from(b)).collect())
}

pub(crate) fn decode_win1252(bytes: &[u8]) -> Option<String> {
	bytes
		.iter()
		.map(|&b| match b {
			0x80..=0x9F => WIN1252_C1[usize::from(b - 0x80)],
			_ => Some(char::from(b)),
		})
		.collect()
}

/// Decodes a raw entry pathname: UTF-8 first, then the legacy fallbacks.
/// Undecodable bytes degrade to a lossy UTF-8 rendering.
pub(crate) fn decode_pathname(bytes: &[u8]) -> String {
	if let Ok(utf8) = std::str::from_utf8(bytes) {
		return utf8.to_string();
	}

	decode_cp437(bytes)
		.or_else(|| decode_latin1(bytes))
		.or_else(|| decode_win1252(bytes))
		.unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
	use super::{decode_pathname, decode_win1252};

	#[test]
	fn utf8_passes_through() {
		assert_eq!(decode_pathname("dir/naïve.txt".as_bytes()), "dir/naïve.txt");
	}

	#[test]
	fn cp437_fallback_applies() {
		// 0x82 is 'é' in CP437.
		assert_eq!(decode_pathname(&[0x63, 0x61, 0x66, 0x82]), "café");
	}

	#[test]
	fn win1252_rejects_undefined_codepoints() {
		assert!(decode_win1252(&[0x81]).is_none());
		assert_eq!(decode_win1252(&[0x80]).as_deref(), Some("€"));
	}
}
