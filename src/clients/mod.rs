mod keep_alive;
mod session;
#[cfg(feature = "tokio-client")]
pub mod tokio;

use crate::{
	packets::{ConnectReturnCode, DecodeError, Publish, SubscribeReturnCode},
	serde::EncodeError,
	transport::{Side, TransportError},
	PacketId, PacketType, QoS, Will,
};
use bytes::Bytes;
use std::time::Duration;

pub use self::session::{ConnectionState, Session};

pub const DEFAULT_KEEP_ALIVE: u16 = 170;

/// Session configuration which is independent from the transport.
#[derive(Clone, Debug)]
pub struct Options {
	/// Keep alive timeout in seconds. A PingReq is sent every half period.
	///
	/// Defaults to 170 seconds. Zero disables the keep-alive timer.
	pub keep_alive: u16,
	pub clean_session: bool,
	pub will: Option<Will>,

	/// Requested QoS for [`Session::subscribe`].
	pub subscribe_qos: QoS,

	/// Controls whether a failed write triggers a single attempt to reopen the
	/// transport.
	pub reconnect: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			keep_alive: DEFAULT_KEEP_ALIVE,
			clean_session: true,
			will: None,
			subscribe_qos: QoS::AtLeastOnce,
			reconnect: true,
		}
	}
}

impl Options {
	/// Interval between keep-alive pings, or `None` if disabled.
	pub fn ping_interval(&self) -> Option<Duration> {
		(self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive.into()) / 2)
	}
}

/// A published message received from the Server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
	pub topic: String,
	pub payload: Bytes,
	pub qos: QoS,
	/// Set if the Server may have delivered this message before.
	pub duplicate: bool,
	/// Indicates whether the sender of the message set the retain flag.
	pub retain: bool,
}

impl From<Publish> for Message {
	fn from(publish: Publish) -> Self {
		let qos = publish.qos();
		let duplicate = publish.duplicate();
		match publish {
			Publish::AtMostOnce {
				retain,
				topic,
				payload,
			}
			| Publish::AtLeastOnce {
				retain,
				topic,
				payload,
				..
			}
			| Publish::ExactlyOnce {
				retain,
				topic,
				payload,
				..
			} => Self {
				topic,
				payload,
				qos,
				duplicate,
				retain,
			},
		}
	}
}

/// Everything a [`Session`] reports to its [`Delegate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	/// The Server accepted the connection.
	Connected { session_present: bool },
	/// The Server refused the connection. The session will not reconnect.
	ConnectionRefused(ConnectReturnCode),
	Message(Message),
	/// A QoS 1 Publish was acknowledged.
	Published(PacketId),
	Subscribed {
		id: PacketId,
		code: SubscribeReturnCode,
	},
	Unsubscribed(PacketId),
	/// The transport failed.
	ConnectionError { side: Side, reason: String },
	/// An incoming packet could not be decoded and was dropped.
	DecodeFailed(DecodeError),
	/// Received part of the QoS 2 exchange, which is not implemented.
	Unsupported(PacketType),
	/// Received a packet only a Client should send.
	Unexpected(PacketType),
}

/// Receives [`Event`]s from a [`Session`], one at a time and in order.
///
/// Events are delivered on whichever thread drives the session. A delegate
/// may call back into the session, except for
/// [`handle_event`](Session::handle_event).
pub trait Delegate: Send + Sync {
	fn on_event(&self, event: Event);
}

impl<F> Delegate for F
where
	F: Fn(Event) + Send + Sync,
{
	fn on_event(&self, event: Event) {
		self(event)
	}
}

impl Delegate for std::sync::mpsc::Sender<Event> {
	fn on_event(&self, event: Event) {
		if self.send(event).is_err() {
			tracing::trace!("event receiver dropped");
		}
	}
}

#[cfg(feature = "tokio-client")]
impl Delegate for ::tokio::sync::mpsc::UnboundedSender<Event> {
	fn on_event(&self, event: Event) {
		if self.send(event).is_err() {
			tracing::trace!("event receiver dropped");
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error(transparent)]
	Encode(#[from] EncodeError),
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),
	#[error("connection refused: {0}")]
	Refused(ConnectReturnCode),
	#[error("session is disconnected")]
	Disconnected,
	#[error("session is already connected")]
	AlreadyConnected,
	#[error("publishing with QoS 2 is not supported")]
	QoS2Unsupported,
}
