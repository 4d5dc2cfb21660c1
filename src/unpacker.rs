use crate::{
	packets::{DecodeError, Packet},
	PacketType,
};
use bytes::{Buf, BytesMut};

/// Largest multiplier the fourth remaining length byte may use.
const MAX_MULTIPLIER: usize = 0x80 * 0x80 * 0x80;

/// Upper bound on the buffer space reserved up front for a body.
const INITIAL_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
	#[default]
	AwaitingHeader,
	AwaitingLength,
	AwaitingBody,
}

/// Incremental decoder turning a fragmented byte stream into packets.
///
/// Bytes may be fed in chunks of any size; a packet is produced only once
/// its whole body has been buffered. Every error resets the decoder to
/// [`Status::AwaitingHeader`] with an empty buffer. No attempt is made to
/// resynchronize a corrupted stream, so one malformed packet may be followed
/// by further errors.
#[derive(Debug)]
pub struct Unpacker {
	status: Status,
	packet_type: PacketType,
	flags: u8,
	remaining_length: usize,
	length: usize,
	multiplier: usize,
	body: BytesMut,
}

impl Default for Unpacker {
	fn default() -> Self {
		Self::new()
	}
}

impl Unpacker {
	pub fn new() -> Self {
		Self {
			status: Status::AwaitingHeader,
			packet_type: PacketType::Reserved,
			flags: 0,
			remaining_length: 0,
			length: 0,
			multiplier: 1,
			body: BytesMut::new(),
		}
	}

	#[inline]
	pub fn status(&self) -> Status {
		self.status
	}

	/// The number of bytes the decoder can consume before its status changes.
	pub fn demand(&self) -> usize {
		match self.status {
			Status::AwaitingHeader | Status::AwaitingLength => 1,
			Status::AwaitingBody => self.remaining_length - self.body.len(),
		}
	}

	/// Clears all per-packet state and returns to [`Status::AwaitingHeader`].
	pub fn reset(&mut self) {
		self.status = Status::AwaitingHeader;
		self.packet_type = PacketType::Reserved;
		self.flags = 0;
		self.remaining_length = 0;
		self.length = 0;
		self.multiplier = 1;
		self.body.clear();
	}

	/// Consumes bytes from `src` until a packet completes, an error occurs or
	/// `src` is exhausted.
	///
	/// Returns `None` if more bytes are needed. Bytes following a completed
	/// packet are left in `src`.
	pub fn feed(&mut self, src: &mut impl Buf) -> Option<Result<Packet, DecodeError>> {
		while src.has_remaining() {
			match self.status {
				Status::AwaitingHeader => {
					let header = src.get_u8();
					let Some((packet_type, flags)) = PacketType::from_header(header) else {
						tracing::warn!(header, "discarding unknown packet type");
						continue;
					};

					tracing::trace!(?packet_type, flags, "read fixed header");
					self.packet_type = packet_type;
					self.flags = flags;
					self.status = Status::AwaitingLength;
				}
				Status::AwaitingLength => {
					let encoded = src.get_u8() as usize;
					self.length += (encoded & 0x7f) * self.multiplier;

					if encoded & 0x80 != 0 {
						self.multiplier *= 0x80;
						if self.multiplier > MAX_MULTIPLIER {
							self.reset();
							return Some(Err(DecodeError::MalformedRemainingLength));
						}
						continue;
					}

					self.remaining_length = self.length;
					self.length = 0;
					self.multiplier = 1;

					if self.remaining_length == 0 {
						return Some(self.complete());
					}

					self.body.clear();
					self.body.reserve(self.remaining_length.min(INITIAL_CAPACITY));
					self.status = Status::AwaitingBody;
				}
				Status::AwaitingBody => {
					let take = self.demand().min(src.remaining());
					let chunk = src.copy_to_bytes(take);
					self.body.extend_from_slice(&chunk);

					if self.body.len() == self.remaining_length {
						return Some(self.complete());
					}
				}
			}
		}

		None
	}

	/// Decodes the buffered body and resets for the next packet.
	fn complete(&mut self) -> Result<Packet, DecodeError> {
		let body = self.body.split().freeze();
		let result = Packet::decode(self.packet_type, self.flags, body);
		if let Err(error) = &result {
			tracing::debug!(packet_type = ?self.packet_type, %error, "failed to decode packet");
		}
		self.reset();
		result
	}
}
