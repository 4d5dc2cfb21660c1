use crate::{
	bytes_reader::BytesReader,
	frame::Frame,
	misc::{Credentials, Will},
	serde::{self, EncodeError},
	InvalidQoS, PacketId, PacketType, QoS,
};
use bytes::{Bytes, BytesMut};
use core::fmt;
use std::str::Utf8Error;

/// The only valid protocol name in [`Connect`] packets.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// The remaining length field ran past four bytes.
	#[error("malformed remaining length")]
	MalformedRemainingLength,
	/// A Publish body was shorter than its topic length or packet identifier
	/// requires.
	#[error("publish body is shorter than its header implies")]
	TruncatedPublish,
	#[error("{0} body is truncated")]
	Truncated(PacketType),
	#[error("invalid flags {flags:#06b} for {packet_type}")]
	InvalidFlags { packet_type: PacketType, flags: u8 },
	#[error(transparent)]
	InvalidQoS(#[from] InvalidQoS),
	#[error("packet identifier is zero")]
	ZeroPacketId,
	#[error(transparent)]
	Utf8(#[from] Utf8Error),
	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),
}

//
// Packet Types
//

/// A tagged MQTT control packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
	Connect(Connect),
	ConnAck(ConnAck),
	Publish(Publish),
	PubAck { id: PacketId },
	PubRec { id: PacketId },
	PubRel { id: PacketId },
	PubComp { id: PacketId },
	Subscribe(Subscribe),
	SubAck(SubAck),
	Unsubscribe(Unsubscribe),
	UnsubAck { id: PacketId },
	PingReq,
	PingResp,
	Disconnect,
}

/// A `Connect` packet is sent by the Client to the Server to initialise a
/// session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
	pub protocol_level: u8,

	/// Client ID.
	///
	/// The Server _may_ accept an empty client ID.
	pub client_id: String,

	/// Keep-alive timeout in seconds.
	pub keep_alive: u16,

	/// Request a clean session.
	pub clean_session: bool,

	/// Last will and testament for the Client.
	pub will: Option<Will>,

	/// Login credentials.
	pub credentials: Option<Credentials>,
}

/// Sent by the Server in response to [`Connect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
	/// Indicates that the Server has existing state from a previous session for
	/// the client.
	pub session_present: bool,
	pub code: ConnectReturnCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReturnCode {
	Accepted,
	UnacceptableProtocolVersion,
	IdentifierRejected,
	ServerUnavailable,
	BadCredentials,
	NotAuthorized,
	Unrecognized(u8),
}

/// A Publish packet can be sent by either the Client or the Server.
#[derive(Clone, PartialEq, Eq)]
pub enum Publish {
	AtMostOnce {
		retain: bool,
		topic: String,
		payload: Bytes,
	},
	AtLeastOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: String,
		payload: Bytes,
	},
	ExactlyOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: String,
		payload: Bytes,
	},
}

/// Single-topic subscription request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
	pub id: PacketId,
	pub topic: String,
	pub qos: QoS,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubAck {
	pub id: PacketId,
	pub code: SubscribeReturnCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeReturnCode {
	MaxQoS0,
	MaxQoS1,
	MaxQoS2,
	Failure,
	Unrecognized(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unsubscribe {
	pub id: PacketId,
	pub topic: String,
}

/// Flags byte of a [`Connect`] packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectFlags {
	pub username: bool,
	pub password: bool,
	pub will_retain: bool,
	pub will_qos: QoS,
	pub will: bool,
	pub clean_session: bool,
}

/// Low nibble of a [`Publish`] fixed header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishFlags {
	pub duplicate: bool,
	pub qos: QoS,
	pub retain: bool,
}

impl Packet {
	pub fn packet_type(&self) -> PacketType {
		match self {
			Self::Connect(_) => PacketType::Connect,
			Self::ConnAck(_) => PacketType::ConnAck,
			Self::Publish(_) => PacketType::Publish,
			Self::PubAck { .. } => PacketType::PubAck,
			Self::PubRec { .. } => PacketType::PubRec,
			Self::PubRel { .. } => PacketType::PubRel,
			Self::PubComp { .. } => PacketType::PubComp,
			Self::Subscribe(_) => PacketType::Subscribe,
			Self::SubAck(_) => PacketType::SubAck,
			Self::Unsubscribe(_) => PacketType::Unsubscribe,
			Self::UnsubAck { .. } => PacketType::UnsubAck,
			Self::PingReq => PacketType::PingReq,
			Self::PingResp => PacketType::PingResp,
			Self::Disconnect => PacketType::Disconnect,
		}
	}

	/// Builds the [`Frame`] for this packet.
	pub fn to_frame(&self) -> Result<Frame, EncodeError> {
		match self {
			Self::Connect(connect) => connect.to_frame(),
			Self::ConnAck(connack) => Ok(connack.to_frame()),
			Self::Publish(publish) => publish.to_frame(),
			Self::PubAck { id }
			| Self::PubRec { id }
			| Self::PubRel { id }
			| Self::PubComp { id }
			| Self::UnsubAck { id } => {
				let packet_type = self.packet_type();
				let mut frame = Frame::new(packet_type, packet_type.required_flags().unwrap_or(0));
				serde::put_u16(frame.variable_header_mut(), id.get());
				Ok(frame)
			}
			Self::Subscribe(subscribe) => subscribe.to_frame(),
			Self::SubAck(suback) => Ok(suback.to_frame()),
			Self::Unsubscribe(unsubscribe) => unsubscribe.to_frame(),
			Self::PingReq | Self::PingResp | Self::Disconnect => Ok(Frame::new(self.packet_type(), 0)),
		}
	}

	/// Serializes the packet into a complete frame.
	pub fn encode(&self) -> Result<Bytes, EncodeError> {
		self.to_frame()?.to_bytes()
	}

	/// Decodes a complete packet body.
	///
	/// `flags` is the low nibble of the fixed header and `body` must be
	/// exactly remaining-length bytes long.
	pub fn decode(packet_type: PacketType, flags: u8, body: Bytes) -> Result<Self, DecodeError> {
		if let Some(required) = packet_type.required_flags() {
			if flags != required {
				return Err(DecodeError::InvalidFlags { packet_type, flags });
			}
		}

		let mut reader = BytesReader::new(packet_type, body);
		let packet = match packet_type {
			PacketType::Reserved => return Err(DecodeError::MalformedPacket("reserved packet type")),
			PacketType::Connect => Self::Connect(Connect::decode(&mut reader)?),
			PacketType::ConnAck => Self::ConnAck(ConnAck::decode(&mut reader)?),
			PacketType::Publish => Self::Publish(Publish::decode(flags, &mut reader)?),
			PacketType::PubAck => Self::PubAck {
				id: reader.take_id()?,
			},
			PacketType::PubRec => Self::PubRec {
				id: reader.take_id()?,
			},
			PacketType::PubRel => Self::PubRel {
				id: reader.take_id()?,
			},
			PacketType::PubComp => Self::PubComp {
				id: reader.take_id()?,
			},
			PacketType::Subscribe => Self::Subscribe(Subscribe::decode(&mut reader)?),
			PacketType::SubAck => Self::SubAck(SubAck::decode(&mut reader)?),
			PacketType::Unsubscribe => Self::Unsubscribe(Unsubscribe::decode(&mut reader)?),
			PacketType::UnsubAck => Self::UnsubAck {
				id: reader.take_id()?,
			},
			PacketType::PingReq => Self::PingReq,
			PacketType::PingResp => Self::PingResp,
			PacketType::Disconnect => Self::Disconnect,
		};

		if reader.remaining() > 0 {
			tracing::debug!(?packet_type, trailing = reader.remaining(), "ignoring trailing bytes");
		}

		Ok(packet)
	}
}

mod connect {
	use super::*;

	impl Default for Connect {
		fn default() -> Self {
			Self {
				protocol_level: PROTOCOL_LEVEL,
				client_id: String::new(),
				keep_alive: 0,
				clean_session: true,
				will: None,
				credentials: None,
			}
		}
	}

	impl Connect {
		pub fn flags(&self) -> ConnectFlags {
			let mut flags = ConnectFlags {
				clean_session: self.clean_session,
				..Default::default()
			};

			if let Some(will) = &self.will {
				flags.will = true;
				flags.will_qos = will.qos;
				flags.will_retain = will.retain;
			}

			if let Some(credentials) = &self.credentials {
				flags.username = true;
				flags.password = credentials.password.is_some();
			}

			flags
		}

		pub(super) fn to_frame(&self) -> Result<Frame, EncodeError> {
			let mut frame = Frame::new(PacketType::Connect, 0);

			let header = frame.variable_header_mut();
			serde::put_str(header, PROTOCOL_NAME)?;
			serde::put_u8(header, self.protocol_level);
			serde::put_u8(header, self.flags().pack());
			serde::put_u16(header, self.keep_alive);

			// Payload fields appear in a fixed order, each present only if its
			// flag is set.
			let mut payload = BytesMut::new();
			serde::put_str(&mut payload, &self.client_id)?;

			if let Some(will) = &self.will {
				serde::put_str(&mut payload, &will.topic)?;
				serde::put_slice(&mut payload, &will.payload)?;
			}

			if let Some(credentials) = &self.credentials {
				serde::put_str(&mut payload, &credentials.username)?;
				if let Some(password) = &credentials.password {
					serde::put_str(&mut payload, password)?;
				}
			}

			Ok(frame.with_payload(payload))
		}

		pub(super) fn decode(reader: &mut BytesReader) -> Result<Self, DecodeError> {
			if reader.take_str()? != PROTOCOL_NAME {
				return Err(DecodeError::MalformedPacket("invalid protocol name"));
			}

			let protocol_level = reader.take_u8()?;
			let flags = ConnectFlags::unpack(reader.take_u8()?)?;
			let keep_alive = reader.take_u16()?;
			let client_id = reader.take_str()?;

			let will = if flags.will {
				let topic = reader.take_str()?;
				let payload = reader.take_prefixed()?;
				Some(Will {
					topic,
					payload,
					qos: flags.will_qos,
					retain: flags.will_retain,
				})
			} else {
				None
			};

			let credentials = if flags.username {
				let username = reader.take_str()?;
				let password = if flags.password {
					Some(reader.take_str()?)
				} else {
					None
				};
				Some(Credentials { username, password })
			} else {
				None
			};

			Ok(Self {
				protocol_level,
				client_id,
				keep_alive,
				clean_session: flags.clean_session,
				will,
				credentials,
			})
		}
	}

	impl ConnectFlags {
		const USERNAME: u8 = 0x80;
		const PASSWORD: u8 = 0x40;
		const WILL_RETAIN: u8 = 0x20;
		const WILL_QOS: u8 = 0x18;
		const WILL: u8 = 0x04;
		const CLEAN_SESSION: u8 = 0x02;
		const RESERVED: u8 = 0x01;

		/// Packs the flags into a byte. Every bit is derived from the fields, so
		/// the result never depends on earlier values.
		pub const fn pack(self) -> u8 {
			let mut flags = (self.will_qos as u8) << 3;
			if self.username {
				flags |= Self::USERNAME;
			}
			if self.password {
				flags |= Self::PASSWORD;
			}
			if self.will_retain {
				flags |= Self::WILL_RETAIN;
			}
			if self.will {
				flags |= Self::WILL;
			}
			if self.clean_session {
				flags |= Self::CLEAN_SESSION;
			}
			flags
		}

		pub fn unpack(flags: u8) -> Result<Self, DecodeError> {
			if flags & Self::RESERVED != 0 {
				return Err(DecodeError::MalformedPacket("reserved connect flag is set"));
			}

			let unpacked = Self {
				username: flags & Self::USERNAME != 0,
				password: flags & Self::PASSWORD != 0,
				will_retain: flags & Self::WILL_RETAIN != 0,
				will_qos: QoS::try_from((flags & Self::WILL_QOS) >> 3)?,
				will: flags & Self::WILL != 0,
				clean_session: flags & Self::CLEAN_SESSION != 0,
			};

			if !unpacked.will && (unpacked.will_retain || unpacked.will_qos != QoS::AtMostOnce) {
				return Err(DecodeError::MalformedPacket("will options set without will flag"));
			}

			if unpacked.password && !unpacked.username {
				return Err(DecodeError::MalformedPacket("password flag set without username"));
			}

			Ok(unpacked)
		}
	}
}

mod connack {
	use super::*;

	impl ConnAck {
		pub(super) fn to_frame(self) -> Frame {
			let mut frame = Frame::new(PacketType::ConnAck, 0);
			let header = frame.variable_header_mut();
			serde::put_u8(header, self.session_present.into());
			serde::put_u8(header, self.code.into());
			frame
		}

		pub(super) fn decode(reader: &mut BytesReader) -> Result<Self, DecodeError> {
			let flags = reader.take_u8()?;
			let code = reader.take_u8()?;
			Ok(Self {
				session_present: flags & 0x01 == 0x01,
				code: code.into(),
			})
		}
	}

	impl ConnectReturnCode {
		#[inline]
		pub fn is_accepted(self) -> bool {
			self == Self::Accepted
		}
	}

	impl From<u8> for ConnectReturnCode {
		fn from(value: u8) -> Self {
			match value {
				0x00 => Self::Accepted,
				0x01 => Self::UnacceptableProtocolVersion,
				0x02 => Self::IdentifierRejected,
				0x03 => Self::ServerUnavailable,
				0x04 => Self::BadCredentials,
				0x05 => Self::NotAuthorized,
				code => Self::Unrecognized(code),
			}
		}
	}

	impl From<ConnectReturnCode> for u8 {
		fn from(value: ConnectReturnCode) -> Self {
			match value {
				ConnectReturnCode::Accepted => 0x00,
				ConnectReturnCode::UnacceptableProtocolVersion => 0x01,
				ConnectReturnCode::IdentifierRejected => 0x02,
				ConnectReturnCode::ServerUnavailable => 0x03,
				ConnectReturnCode::BadCredentials => 0x04,
				ConnectReturnCode::NotAuthorized => 0x05,
				ConnectReturnCode::Unrecognized(code) => code,
			}
		}
	}

	impl fmt::Display for ConnectReturnCode {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			match self {
				Self::Accepted => f.write_str("connection accepted"),
				Self::UnacceptableProtocolVersion => f.write_str("unacceptable protocol version"),
				Self::IdentifierRejected => f.write_str("client identifier rejected"),
				Self::ServerUnavailable => f.write_str("server unavailable"),
				Self::BadCredentials => f.write_str("bad username or password"),
				Self::NotAuthorized => f.write_str("not authorized"),
				Self::Unrecognized(code) => write!(f, "unrecognized return code {code:#04x}"),
			}
		}
	}
}

mod publish {
	use super::*;

	impl Publish {
		/// Builds a Publish packet, drawing a packet identifier from `next_id`
		/// only when `qos` requires one.
		pub fn build(
			topic: impl Into<String>,
			payload: impl Into<Bytes>,
			qos: QoS,
			retain: bool,
			next_id: impl FnOnce() -> PacketId,
		) -> Self {
			let topic = topic.into();
			let payload = payload.into();
			match qos {
				QoS::AtMostOnce => Self::AtMostOnce {
					retain,
					topic,
					payload,
				},
				QoS::AtLeastOnce => Self::AtLeastOnce {
					id: next_id(),
					retain,
					duplicate: false,
					topic,
					payload,
				},
				QoS::ExactlyOnce => Self::ExactlyOnce {
					id: next_id(),
					retain,
					duplicate: false,
					topic,
					payload,
				},
			}
		}

		pub fn topic(&self) -> &str {
			match self {
				Self::AtMostOnce { topic, .. }
				| Self::AtLeastOnce { topic, .. }
				| Self::ExactlyOnce { topic, .. } => topic,
			}
		}

		pub fn payload(&self) -> &Bytes {
			match self {
				Self::AtMostOnce { payload, .. }
				| Self::AtLeastOnce { payload, .. }
				| Self::ExactlyOnce { payload, .. } => payload,
			}
		}

		pub fn id(&self) -> Option<PacketId> {
			match self {
				Self::AtMostOnce { .. } => None,
				Self::AtLeastOnce { id, .. } | Self::ExactlyOnce { id, .. } => Some(*id),
			}
		}

		pub fn qos(&self) -> QoS {
			match self {
				Self::AtMostOnce { .. } => QoS::AtMostOnce,
				Self::AtLeastOnce { .. } => QoS::AtLeastOnce,
				Self::ExactlyOnce { .. } => QoS::ExactlyOnce,
			}
		}

		pub fn retain(&self) -> bool {
			match self {
				Self::AtMostOnce { retain, .. }
				| Self::AtLeastOnce { retain, .. }
				| Self::ExactlyOnce { retain, .. } => *retain,
			}
		}

		pub fn duplicate(&self) -> bool {
			match self {
				Self::AtMostOnce { .. } => false,
				Self::AtLeastOnce { duplicate, .. } | Self::ExactlyOnce { duplicate, .. } => {
					*duplicate
				}
			}
		}

		pub fn flags(&self) -> PublishFlags {
			PublishFlags {
				duplicate: self.duplicate(),
				qos: self.qos(),
				retain: self.retain(),
			}
		}

		pub(super) fn to_frame(&self) -> Result<Frame, EncodeError> {
			let mut frame = Frame::new(PacketType::Publish, self.flags().pack());
			let header = frame.variable_header_mut();
			serde::put_str(header, self.topic())?;
			if let Some(id) = self.id() {
				serde::put_u16(header, id.get());
			}
			Ok(frame.with_payload(self.payload().clone()))
		}

		pub(super) fn decode(flags: u8, reader: &mut BytesReader) -> Result<Self, DecodeError> {
			let PublishFlags {
				duplicate,
				qos,
				retain,
			} = PublishFlags::unpack(flags)?;

			let topic = reader.take_str()?;
			let publish = match qos {
				QoS::AtMostOnce => {
					if duplicate {
						return Err(DecodeError::InvalidFlags {
							packet_type: PacketType::Publish,
							flags,
						});
					}
					let payload = reader.take_bytes(reader.remaining())?;
					Self::AtMostOnce {
						retain,
						topic,
						payload,
					}
				}
				QoS::AtLeastOnce => {
					let id = reader.take_id()?;
					let payload = reader.take_bytes(reader.remaining())?;
					Self::AtLeastOnce {
						id,
						retain,
						duplicate,
						topic,
						payload,
					}
				}
				QoS::ExactlyOnce => {
					let id = reader.take_id()?;
					let payload = reader.take_bytes(reader.remaining())?;
					Self::ExactlyOnce {
						id,
						retain,
						duplicate,
						topic,
						payload,
					}
				}
			};

			Ok(publish)
		}
	}

	impl fmt::Debug for Publish {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.debug_struct("Publish")
				.field("topic", &self.topic())
				.field("qos", &self.qos())
				.field("id", &self.id())
				.field("retain", &self.retain())
				.field("duplicate", &self.duplicate())
				.field("payload_len", &self.payload().len())
				.finish()
		}
	}

	impl PublishFlags {
		const DUPLICATE: u8 = 0x08;
		const QOS: u8 = 0x06;
		const RETAIN: u8 = 0x01;

		pub const fn pack(self) -> u8 {
			let mut flags = (self.qos as u8) << 1;
			if self.duplicate {
				flags |= Self::DUPLICATE;
			}
			if self.retain {
				flags |= Self::RETAIN;
			}
			flags
		}

		pub fn unpack(flags: u8) -> Result<Self, DecodeError> {
			Ok(Self {
				duplicate: flags & Self::DUPLICATE != 0,
				qos: QoS::try_from((flags & Self::QOS) >> 1)?,
				retain: flags & Self::RETAIN != 0,
			})
		}
	}
}

mod subscribe {
	use super::*;

	impl Subscribe {
		pub(super) fn to_frame(&self) -> Result<Frame, EncodeError> {
			let mut frame = Frame::new(PacketType::Subscribe, 0x02);
			serde::put_u16(frame.variable_header_mut(), self.id.get());

			let mut payload = BytesMut::with_capacity(3 + self.topic.len());
			serde::put_str(&mut payload, &self.topic)?;
			serde::put_u8(&mut payload, self.qos as u8);
			Ok(frame.with_payload(payload))
		}

		pub(super) fn decode(reader: &mut BytesReader) -> Result<Self, DecodeError> {
			let id = reader.take_id()?;
			let topic = reader.take_str()?;
			let qos = QoS::try_from(reader.take_u8()?)?;
			Ok(Self { id, topic, qos })
		}
	}

	impl SubAck {
		pub(super) fn to_frame(self) -> Frame {
			let mut frame = Frame::new(PacketType::SubAck, 0);
			let header = frame.variable_header_mut();
			serde::put_u16(header, self.id.get());
			serde::put_u8(header, self.code.into());
			frame
		}

		/// Only the first return code is read; one topic is subscribed per
		/// request.
		pub(super) fn decode(reader: &mut BytesReader) -> Result<Self, DecodeError> {
			let id = reader.take_id()?;
			let code = reader.take_u8()?.into();
			Ok(Self { id, code })
		}
	}

	impl SubscribeReturnCode {
		/// The maximum QoS granted by the Server, or `None` if the subscription
		/// failed.
		pub fn granted(self) -> Option<QoS> {
			match self {
				Self::MaxQoS0 => Some(QoS::AtMostOnce),
				Self::MaxQoS1 => Some(QoS::AtLeastOnce),
				Self::MaxQoS2 => Some(QoS::ExactlyOnce),
				Self::Failure | Self::Unrecognized(_) => None,
			}
		}
	}

	impl From<u8> for SubscribeReturnCode {
		fn from(value: u8) -> Self {
			match value {
				0x00 => Self::MaxQoS0,
				0x01 => Self::MaxQoS1,
				0x02 => Self::MaxQoS2,
				0x80 => Self::Failure,
				code => Self::Unrecognized(code),
			}
		}
	}

	impl From<SubscribeReturnCode> for u8 {
		fn from(value: SubscribeReturnCode) -> Self {
			match value {
				SubscribeReturnCode::MaxQoS0 => 0x00,
				SubscribeReturnCode::MaxQoS1 => 0x01,
				SubscribeReturnCode::MaxQoS2 => 0x02,
				SubscribeReturnCode::Failure => 0x80,
				SubscribeReturnCode::Unrecognized(code) => code,
			}
		}
	}

	impl Unsubscribe {
		pub(super) fn to_frame(&self) -> Result<Frame, EncodeError> {
			let mut frame = Frame::new(PacketType::Unsubscribe, 0x02);
			serde::put_u16(frame.variable_header_mut(), self.id.get());

			let mut payload = BytesMut::with_capacity(2 + self.topic.len());
			serde::put_str(&mut payload, &self.topic)?;
			Ok(frame.with_payload(payload))
		}

		pub(super) fn decode(reader: &mut BytesReader) -> Result<Self, DecodeError> {
			let id = reader.take_id()?;
			let topic = reader.take_str()?;
			Ok(Self { id, topic })
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Buf;

	fn id(value: u16) -> PacketId {
		PacketId::new(value).unwrap()
	}

	/// Splits an encoded frame into its header parts and body.
	fn split(mut bytes: Bytes) -> (PacketType, u8, Bytes) {
		let (packet_type, flags) = PacketType::from_header(bytes.get_u8()).unwrap();
		let mut length = 0;
		let mut multiplier = 1;
		loop {
			let byte = bytes.get_u8() as usize;
			length += (byte & 0x7f) * multiplier;
			multiplier *= 0x80;
			if byte & 0x80 == 0 {
				break;
			}
		}
		assert_eq!(length, bytes.len());
		(packet_type, flags, bytes)
	}

	#[test]
	fn encodes_subscribe() {
		let packet = Packet::Subscribe(Subscribe {
			id: id(10),
			topic: "a/b".into(),
			qos: QoS::AtLeastOnce,
		});
		let bytes = packet.encode().unwrap();
		assert_eq!(
			&bytes[..],
			&[0x82, 0x08, 0x00, 0x0a, 0x00, 0x03, b'a', b'/', b'b', 0x01]
		);

		let (packet_type, flags, body) = split(bytes);
		assert_eq!(Packet::decode(packet_type, flags, body).unwrap(), packet);
	}

	#[test]
	fn encodes_connect() {
		let connect = Connect {
			client_id: "id".into(),
			keep_alive: 170,
			..Default::default()
		};
		let bytes = Packet::Connect(connect).encode().unwrap();
		assert_eq!(
			&bytes[..],
			b"\x10\x0e\x00\x04MQTT\x04\x02\x00\xaa\x00\x02id"
		);
	}

	#[test]
	fn decodes_connect_with_will_and_credentials() {
		let connect = Connect {
			client_id: "client".into(),
			keep_alive: 60,
			clean_session: false,
			will: Some(Will::new("a/b", &b"Disconnect"[..], QoS::AtLeastOnce, true)),
			credentials: Some(Credentials::new_with("user", "pass")),
			..Default::default()
		};
		assert_eq!(connect.flags().pack(), 0b1110_1100);

		let packet = Packet::Connect(connect);
		let (packet_type, flags, body) = split(packet.encode().unwrap());
		assert_eq!(Packet::decode(packet_type, flags, body).unwrap(), packet);
	}

	#[test]
	fn connect_flags_pack_idempotently() {
		let mut flags = ConnectFlags {
			username: true,
			password: true,
			will: true,
			will_qos: QoS::ExactlyOnce,
			will_retain: true,
			clean_session: true,
		};
		assert_eq!(flags.pack(), 0xf6);

		flags.username = false;
		flags.password = false;
		flags.will_qos = QoS::AtMostOnce;
		flags.clean_session = false;
		assert_eq!(flags.pack(), 0x24);

		// Setting a flag twice leaves the byte unchanged.
		flags.will_retain = true;
		assert_eq!(flags.pack(), 0x24);
		assert_eq!(ConnectFlags::unpack(0x24).unwrap(), flags);
	}

	#[test]
	fn rejects_invalid_connect_flags() {
		assert!(ConnectFlags::unpack(0x03).is_err());
		assert!(ConnectFlags::unpack(0x40).is_err());
		assert!(ConnectFlags::unpack(0x20).is_err());
		assert_eq!(
			ConnectFlags::unpack(0x1c),
			Err(DecodeError::InvalidQoS(InvalidQoS))
		);
	}

	#[test]
	fn maps_connack_codes() {
		for (code, expected) in [
			(0x00, ConnectReturnCode::Accepted),
			(0x01, ConnectReturnCode::UnacceptableProtocolVersion),
			(0x04, ConnectReturnCode::BadCredentials),
			(0x05, ConnectReturnCode::NotAuthorized),
			(0x7f, ConnectReturnCode::Unrecognized(0x7f)),
		] {
			let body = Bytes::copy_from_slice(&[0x01, code]);
			let packet = Packet::decode(PacketType::ConnAck, 0, body).unwrap();
			assert_eq!(
				packet,
				Packet::ConnAck(ConnAck {
					session_present: true,
					code: expected
				})
			);
		}
	}

	#[test]
	fn maps_suback_codes() {
		for (code, expected) in [
			(0x00, SubscribeReturnCode::MaxQoS0),
			(0x01, SubscribeReturnCode::MaxQoS1),
			(0x02, SubscribeReturnCode::MaxQoS2),
			(0x80, SubscribeReturnCode::Failure),
			(0x03, SubscribeReturnCode::Unrecognized(0x03)),
		] {
			let body = Bytes::copy_from_slice(&[0x00, 0x2a, code]);
			let Packet::SubAck(suback) = Packet::decode(PacketType::SubAck, 0, body).unwrap() else {
				panic!("expected SubAck");
			};
			assert_eq!(suback.id, id(42));
			assert_eq!(suback.code, expected);
		}

		assert_eq!(SubscribeReturnCode::MaxQoS1.granted(), Some(QoS::AtLeastOnce));
		assert_eq!(SubscribeReturnCode::Failure.granted(), None);
	}

	#[test]
	fn encodes_publish() {
		let publish = Publish::build("t", &b"hi"[..], QoS::AtLeastOnce, true, || id(5));
		let bytes = Packet::Publish(publish.clone()).encode().unwrap();
		assert_eq!(&bytes[..], b"\x33\x07\x00\x01t\x00\x05hi");

		let (packet_type, flags, body) = split(bytes);
		assert_eq!(
			Packet::decode(packet_type, flags, body).unwrap(),
			Packet::Publish(publish)
		);
	}

	#[test]
	fn qos0_publish_draws_no_id() {
		let publish = Publish::build("t", Bytes::new(), QoS::AtMostOnce, false, || {
			panic!("no identifier needed")
		});
		assert_eq!(publish.id(), None);
		assert_eq!(&Packet::Publish(publish).encode().unwrap()[..], b"\x30\x03\x00\x01t");
	}

	#[test]
	fn decodes_publish_flags() {
		let body = Bytes::from_static(b"\x00\x03a/b\x12\x34payload");
		let Packet::Publish(publish) = Packet::decode(PacketType::Publish, 0x0d, body).unwrap() else {
			panic!("expected Publish");
		};
		assert_eq!(publish.topic(), "a/b");
		assert_eq!(publish.qos(), QoS::ExactlyOnce);
		assert_eq!(publish.id(), Some(id(0x1234)));
		assert!(publish.duplicate());
		assert!(publish.retain());
		assert_eq!(&publish.payload()[..], b"payload");
	}

	#[test]
	fn rejects_truncated_publish() {
		let body = Bytes::from_static(b"\x00\x0aa/b");
		assert_eq!(
			Packet::decode(PacketType::Publish, 0, body),
			Err(DecodeError::TruncatedPublish)
		);

		// QoS 1 with no room for the packet identifier.
		let body = Bytes::from_static(b"\x00\x01t\x00");
		assert_eq!(
			Packet::decode(PacketType::Publish, 0x02, body),
			Err(DecodeError::TruncatedPublish)
		);
	}

	#[test]
	fn rejects_invalid_header_flags() {
		let body = Bytes::from_static(b"\x00\x01t");
		assert_eq!(
			Packet::decode(PacketType::Publish, 0x08, body.clone()),
			Err(DecodeError::InvalidFlags {
				packet_type: PacketType::Publish,
				flags: 0x08
			})
		);
		assert_eq!(
			Packet::decode(PacketType::Publish, 0x06, body),
			Err(DecodeError::InvalidQoS(InvalidQoS))
		);
		assert_eq!(
			Packet::decode(PacketType::Subscribe, 0x00, Bytes::new()),
			Err(DecodeError::InvalidFlags {
				packet_type: PacketType::Subscribe,
				flags: 0x00
			})
		);
	}

	#[test]
	fn encodes_acknowledgements() {
		assert_eq!(&Packet::PubAck { id: id(7) }.encode().unwrap()[..], b"\x40\x02\x00\x07");
		assert_eq!(&Packet::PubRec { id: id(7) }.encode().unwrap()[..], b"\x50\x02\x00\x07");
		assert_eq!(&Packet::PubRel { id: id(7) }.encode().unwrap()[..], b"\x62\x02\x00\x07");
		assert_eq!(&Packet::PingReq.encode().unwrap()[..], b"\xc0\x00");
		assert_eq!(&Packet::Disconnect.encode().unwrap()[..], b"\xe0\x00");
	}

	#[test]
	fn unsubscribe_round_trips() {
		let packet = Packet::Unsubscribe(Unsubscribe {
			id: id(3),
			topic: "sensors/#".into(),
		});
		let bytes = packet.encode().unwrap();
		assert_eq!(bytes[0], 0xa2);

		let (packet_type, flags, body) = split(bytes);
		assert_eq!(Packet::decode(packet_type, flags, body).unwrap(), packet);
	}

	#[test]
	fn rejects_oversized_topic() {
		let packet = Packet::Subscribe(Subscribe {
			id: id(1),
			topic: "x".repeat(70_000),
			qos: QoS::AtMostOnce,
		});
		assert_eq!(packet.encode(), Err(EncodeError::PayloadTooLarge(70_000)));
	}
}
