//! Collaborators the session is driven by.
//!
//! The session never touches sockets or timers directly. It is handed a
//! [`Transport`] to move bytes, a [`Scheduler`] for the keep-alive timer and
//! a [`ClientIdProvider`] for the Client ID sent in Connect packets.
use core::fmt;
use std::{io, time::Duration};

pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Which half of the transport an event concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
	Read,
	Write,
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Read => f.write_str("read"),
			Self::Write => f.write_str("write"),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("transport is not open")]
	NotOpen,
	#[error("connection closed by peer")]
	Closed,
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// Notifications delivered by a transport to [`Session::handle_event`].
///
/// [`Session::handle_event`]: crate::clients::Session::handle_event
#[derive(Debug)]
pub enum TransportEvent {
	Opened(Side),
	BytesAvailable,
	SpaceAvailable,
	Error(Side, TransportError),
}

/// A byte-oriented, non-blocking duplex stream.
pub trait Transport: Send {
	/// Opens a fresh read and write pair, replacing any previous one.
	fn open(&mut self) -> Result<(), TransportError>;

	/// Closes both halves. Closing a closed transport does nothing.
	fn close(&mut self);

	fn is_open(&self) -> bool;

	/// Writes as many bytes from `buf` as the transport accepts without
	/// blocking. `Ok(0)` means no space is available right now.
	fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

	/// Reads whatever is currently available, up to `buf.len()` bytes.
	/// `Ok(0)` means nothing is available right now.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Handle to a scheduled repeating callback.
pub trait Cancel: Send {
	/// Stops the callback. Calling this more than once is harmless.
	fn cancel(&mut self);
}

pub trait Scheduler: Send + Sync {
	/// Calls `callback` every `interval`, starting one interval from now,
	/// until the returned handle is cancelled.
	fn schedule_repeating(
		&self,
		interval: Duration,
		callback: Box<dyn FnMut() + Send>,
	) -> Box<dyn Cancel>;
}

/// Supplies the Client ID sent with every Connect packet.
pub trait ClientIdProvider: Send + Sync {
	fn current_client_id(&self) -> String;
}

impl ClientIdProvider for String {
	fn current_client_id(&self) -> String {
		self.clone()
	}
}

impl ClientIdProvider for &'static str {
	fn current_client_id(&self) -> String {
		String::from(*self)
	}
}

impl<F> ClientIdProvider for F
where
	F: Fn() -> String + Send + Sync,
{
	fn current_client_id(&self) -> String {
		self()
	}
}
