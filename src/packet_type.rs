use core::fmt;

/// Control Packet Type, carried in the high nibble of the fixed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
	Reserved = 0,
	Connect,
	ConnAck,
	Publish,
	PubAck,
	PubRec,
	PubRel,
	PubComp,
	Subscribe,
	SubAck,
	Unsubscribe,
	UnsubAck,
	PingReq,
	PingResp,
	Disconnect,
}

impl PacketType {
	/// Splits a fixed header byte into a packet type and the flags nibble.
	///
	/// Returns `None` for the reserved nibbles `0x0` and `0xf`.
	pub fn from_header(header: u8) -> Option<(Self, u8)> {
		let packet_type = match header >> 4 {
			0x1 => Self::Connect,
			0x2 => Self::ConnAck,
			0x3 => Self::Publish,
			0x4 => Self::PubAck,
			0x5 => Self::PubRec,
			0x6 => Self::PubRel,
			0x7 => Self::PubComp,
			0x8 => Self::Subscribe,
			0x9 => Self::SubAck,
			0xa => Self::Unsubscribe,
			0xb => Self::UnsubAck,
			0xc => Self::PingReq,
			0xd => Self::PingResp,
			0xe => Self::Disconnect,
			_ => return None,
		};
		Some((packet_type, header & 0x0f))
	}

	/// The flags nibble every packet of this type must carry.
	///
	/// Returns `None` for [`Publish`](PacketType::Publish), whose flags are
	/// variable.
	pub const fn required_flags(self) -> Option<u8> {
		match self {
			Self::Publish => None,
			Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(0x02),
			_ => Some(0x00),
		}
	}

	/// Builds the fixed header byte from the type and a flags nibble.
	#[inline]
	pub const fn header(self, flags: u8) -> u8 {
		((self as u8) << 4) | (flags & 0x0f)
	}
}

impl fmt::Display for PacketType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}
