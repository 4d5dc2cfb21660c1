use crate::{packets::DecodeError, PacketId, PacketType};
use bytes::{Buf, Bytes};
use std::str::from_utf8;

type Result<T> = std::result::Result<T, DecodeError>;

/// Cursor over the complete body of a single packet.
pub struct BytesReader {
	packet_type: PacketType,
	bytes: Bytes,
}

impl BytesReader {
	pub fn new(packet_type: PacketType, bytes: Bytes) -> Self {
		Self { packet_type, bytes }
	}

	pub fn require(&self, len: usize) -> Result<()> {
		if self.bytes.remaining() >= len {
			Ok(())
		} else if self.packet_type == PacketType::Publish {
			Err(DecodeError::TruncatedPublish)
		} else {
			Err(DecodeError::Truncated(self.packet_type))
		}
	}

	#[inline]
	pub fn remaining(&self) -> usize {
		self.bytes.remaining()
	}

	pub fn take_inner(self) -> Bytes {
		self.bytes
	}

	pub fn take_u8(&mut self) -> Result<u8> {
		self.require(1)?;
		Ok(self.bytes.get_u8())
	}

	pub fn take_u16(&mut self) -> Result<u16> {
		self.require(2)?;
		Ok(self.bytes.get_u16())
	}

	pub fn take_id(&mut self) -> Result<PacketId> {
		let id = self.take_u16()?;
		PacketId::new(id).ok_or(DecodeError::ZeroPacketId)
	}

	pub fn take_bytes(&mut self, len: usize) -> Result<Bytes> {
		self.require(len)?;
		Ok(self.bytes.split_to(len))
	}

	/// Takes a length-prefixed byte sequence.
	pub fn take_prefixed(&mut self) -> Result<Bytes> {
		let len = self.take_u16()?;
		self.take_bytes(len.into())
	}

	pub fn take_str(&mut self) -> Result<String> {
		let bytes = self.take_prefixed()?;
		let s = from_utf8(&bytes)?;
		Ok(s.to_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::BytesReader;
	use crate::{packets::DecodeError, PacketType};
	use bytes::Bytes;

	#[test]
	fn reads_fields_in_order() {
		let mut reader = BytesReader::new(
			PacketType::Subscribe,
			Bytes::from_static(b"\x00\x07\x00\x03a/b\x01"),
		);
		assert_eq!(reader.take_id().unwrap().get(), 7);
		assert_eq!(reader.take_str().unwrap(), "a/b");
		assert_eq!(reader.take_u8().unwrap(), 1);
		assert_eq!(reader.remaining(), 0);
	}

	#[test]
	fn reports_truncation_for_packet_type() {
		let mut reader = BytesReader::new(PacketType::ConnAck, Bytes::from_static(b"\x00"));
		reader.take_u8().unwrap();
		assert_eq!(
			reader.take_u8(),
			Err(DecodeError::Truncated(PacketType::ConnAck))
		);

		let mut reader = BytesReader::new(PacketType::Publish, Bytes::from_static(b"\x00\x05a/"));
		assert_eq!(reader.take_str(), Err(DecodeError::TruncatedPublish));
	}

	#[test]
	fn rejects_zero_id_and_bad_utf8() {
		let mut reader = BytesReader::new(PacketType::PubAck, Bytes::from_static(b"\x00\x00"));
		assert_eq!(reader.take_id(), Err(DecodeError::ZeroPacketId));

		let mut reader = BytesReader::new(PacketType::Publish, Bytes::from_static(b"\x00\x01\xff"));
		assert!(matches!(reader.take_str(), Err(DecodeError::Utf8(_))));
	}
}
