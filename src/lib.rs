//! # umqtt
//!
//! An event-driven MQTT 3.1.1 client core.
//!
//! Outgoing operations on a [`Session`] are encoded into complete frames and
//! written to an abstract [`Transport`]. Incoming bytes are reassembled by the
//! [`Unpacker`] and reported to a [`Delegate`] as [`Event`]s.
//!
//! [`Transport`]: transport::Transport
//! [`Unpacker`]: unpacker::Unpacker
mod bytes_reader;
pub mod clients;
mod frame;
mod misc;
mod packet_id;
mod packet_type;
pub mod packets;
mod qos;
pub mod serde;
pub mod transport;
pub mod unpacker;

pub use self::{
	clients::{ClientError, ConnectionState, Delegate, Event, Message, Options, Session},
	frame::{FixedHeader, Frame},
	misc::{Credentials, Will},
	packet_id::PacketIds,
	packet_type::PacketType,
	packets::{DecodeError, Packet},
	qos::{InvalidQoS, QoS},
	serde::EncodeError,
};

pub type PacketId = std::num::NonZeroU16;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
