use crate::{
	serde::{self, EncodeError, MAX_REMAINING_LENGTH},
	PacketType,
};
use bytes::{BufMut, Bytes, BytesMut};

/// The first 2 to 5 bytes of every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeader {
	pub packet_type: PacketType,
	/// Low nibble of the header byte.
	pub flags: u8,
	/// Byte count of the variable header and payload.
	pub remaining_length: usize,
}

impl FixedHeader {
	pub fn serialize_into(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		serde::put_u8(dst, self.packet_type.header(self.flags));
		serde::put_var(dst, self.remaining_length)
	}

	/// Serialized size of the whole frame.
	#[inline]
	pub fn frame_len(&self) -> usize {
		1 + serde::var_len(self.remaining_length) + self.remaining_length
	}
}

/// A single outgoing packet, split into its three sections.
///
/// Frames are built fresh for every operation and serialized once.
#[derive(Clone, Debug)]
pub struct Frame {
	packet_type: PacketType,
	flags: u8,
	variable_header: BytesMut,
	payload: Bytes,
}

impl Frame {
	pub fn new(packet_type: PacketType, flags: u8) -> Self {
		Self {
			packet_type,
			flags: flags & 0x0f,
			variable_header: BytesMut::new(),
			payload: Bytes::new(),
		}
	}

	#[inline]
	pub fn variable_header_mut(&mut self) -> &mut BytesMut {
		&mut self.variable_header
	}

	pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
		self.payload = payload.into();
		self
	}

	pub fn fixed_header(&self) -> FixedHeader {
		FixedHeader {
			packet_type: self.packet_type,
			flags: self.flags,
			remaining_length: self.variable_header.len() + self.payload.len(),
		}
	}

	pub fn variable_header(&self) -> &[u8] {
		&self.variable_header
	}

	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	/// Writes the fixed header, variable header and payload to `dst`.
	///
	/// Nothing is written if the frame is too large to encode.
	pub fn serialize_into(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
		let header = self.fixed_header();
		if header.remaining_length > MAX_REMAINING_LENGTH {
			return Err(EncodeError::RemainingLengthOverflow(header.remaining_length));
		}

		dst.reserve(header.frame_len());
		header.serialize_into(dst)?;
		dst.put_slice(&self.variable_header);
		dst.put_slice(&self.payload);
		Ok(())
	}

	pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
		let mut buffer = BytesMut::new();
		self.serialize_into(&mut buffer)?;
		Ok(buffer.freeze())
	}
}
