use bytes::BufMut;

/// The largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeError {
	/// A length-prefixed field was longer than 65,535 bytes.
	#[error("field of {0} bytes exceeds the 65535 byte limit")]
	PayloadTooLarge(usize),
	/// The remaining length exceeded [`MAX_REMAINING_LENGTH`].
	#[error("remaining length {0} exceeds 268435455")]
	RemainingLengthOverflow(usize),
}

#[inline]
pub fn put_u8(dst: &mut impl BufMut, val: u8) {
	dst.put_u8(val);
}

#[inline]
pub fn put_u16(dst: &mut impl BufMut, val: u16) {
	dst.put_u16(val);
}

/// Writes `slice` prefixed with its length as a big-endian `u16`.
pub fn put_slice(dst: &mut impl BufMut, slice: &[u8]) -> Result<(), EncodeError> {
	let Ok(len) = u16::try_from(slice.len()) else {
		return Err(EncodeError::PayloadTooLarge(slice.len()));
	};
	dst.put_u16(len);
	dst.put_slice(slice);
	Ok(())
}

#[inline]
pub fn put_str(dst: &mut impl BufMut, s: &str) -> Result<(), EncodeError> {
	put_slice(dst, s.as_bytes())
}

/// Writes `value` as an MQTT variable length integer.
pub fn put_var(dst: &mut impl BufMut, mut value: usize) -> Result<(), EncodeError> {
	if value > MAX_REMAINING_LENGTH {
		return Err(EncodeError::RemainingLengthOverflow(value));
	}

	loop {
		let mut encoded = value % 0x80;
		value /= 0x80;
		if value > 0 {
			encoded |= 0x80;
		}
		dst.put_u8(encoded as u8);
		if value == 0 {
			break Ok(());
		}
	}
}

/// Number of bytes `put_var` emits for `value`.
pub const fn var_len(value: usize) -> usize {
	match value {
		0..=0x7f => 1,
		0x80..=0x3fff => 2,
		0x4000..=0x1f_ffff => 3,
		_ => 4,
	}
}

#[cfg(test)]
mod tests {
	use super::{put_str, put_var, var_len, EncodeError, MAX_REMAINING_LENGTH};
	use bytes::BytesMut;

	fn encode_var(value: usize) -> Vec<u8> {
		let mut buffer = BytesMut::new();
		put_var(&mut buffer, value).unwrap();
		buffer.to_vec()
	}

	#[test]
	fn encodes_var_boundaries() {
		assert_eq!(encode_var(0), [0x00]);
		assert_eq!(encode_var(127), [0x7f]);
		assert_eq!(encode_var(128), [0x80, 0x01]);
		assert_eq!(encode_var(16_383), [0xff, 0x7f]);
		assert_eq!(encode_var(16_384), [0x80, 0x80, 0x01]);
		assert_eq!(encode_var(2_097_151), [0xff, 0xff, 0x7f]);
		assert_eq!(encode_var(2_097_152), [0x80, 0x80, 0x80, 0x01]);
		assert_eq!(encode_var(MAX_REMAINING_LENGTH), [0xff, 0xff, 0xff, 0x7f]);
	}

	#[test]
	fn var_len_matches_encoding() {
		for value in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_REMAINING_LENGTH] {
			assert_eq!(var_len(value), encode_var(value).len());
		}
	}

	#[test]
	fn rejects_var_overflow() {
		let mut buffer = BytesMut::new();
		assert_eq!(
			put_var(&mut buffer, MAX_REMAINING_LENGTH + 1),
			Err(EncodeError::RemainingLengthOverflow(268_435_456))
		);
		assert!(buffer.is_empty());
	}

	#[test]
	fn length_prefixes_strings() {
		let mut buffer = BytesMut::new();
		put_str(&mut buffer, "a/b").unwrap();
		assert_eq!(&buffer[..], b"\x00\x03a/b");

		let long = "x".repeat(u16::MAX as usize + 1);
		assert_eq!(
			put_str(&mut buffer, &long),
			Err(EncodeError::PayloadTooLarge(65_536))
		);
	}
}
