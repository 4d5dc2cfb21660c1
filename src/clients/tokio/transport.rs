use crate::transport::{Transport, TransportError, DEFAULT_MQTT_HOST, DEFAULT_MQTT_PORT};
use std::{
	io,
	net::{Shutdown, ToSocketAddrs},
	sync::Arc,
	time::Duration,
};
use tokio::{net::TcpStream, runtime::Handle, sync::Notify};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for connecting to a Server over TCP.
#[derive(Clone, Debug)]
pub struct TcpConfiguration {
	/// Hostname or IP address of the MQTT Server.
	pub host: String,
	pub port: u16,
	pub nodelay: bool,

	/// Upper bound on each connection attempt. Opening the transport blocks
	/// the calling thread for at most this long per resolved address.
	pub connect_timeout: Duration,
}

impl Default for TcpConfiguration {
	fn default() -> Self {
		Self {
			host: DEFAULT_MQTT_HOST.into(),
			port: DEFAULT_MQTT_PORT,
			nodelay: true,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}
}

/// Non-blocking TCP transport registered with a tokio runtime.
///
/// Readiness is not tracked here; [`run`](super::run) awaits it on
/// [`stream`](Self::stream) and forwards it to the session.
#[derive(Debug)]
pub struct TcpTransport {
	configuration: TcpConfiguration,
	runtime: Handle,
	stream: Option<Arc<TcpStream>>,

	// Duplicate handle used to shut the socket down while the driver may still
	// hold a reference to `stream`.
	control: Option<std::net::TcpStream>,

	// Signalled when a write could not be completed, so the driver starts
	// waiting for write readiness.
	blocked: Arc<Notify>,
}

impl TcpTransport {
	pub fn new(configuration: TcpConfiguration, runtime: Handle) -> Self {
		Self {
			configuration,
			runtime,
			stream: None,
			control: None,
			blocked: Arc::new(Notify::new()),
		}
	}

	/// The current stream, or `None` while closed.
	pub fn stream(&self) -> Option<Arc<TcpStream>> {
		self.stream.clone()
	}

	/// Notified whenever a write accepted fewer bytes than it was given.
	pub fn write_blocked(&self) -> Arc<Notify> {
		Arc::clone(&self.blocked)
	}

	fn stream_ref(&self) -> Result<&TcpStream, TransportError> {
		self.stream.as_deref().ok_or(TransportError::NotOpen)
	}
}

impl Transport for TcpTransport {
	fn open(&mut self) -> Result<(), TransportError> {
		self.close();

		let TcpConfiguration {
			host,
			port,
			nodelay,
			connect_timeout,
		} = &self.configuration;
		tracing::debug!(%host, port, ?connect_timeout, "opening TCP connection");

		let stream = connect_with_timeout(host, *port, *connect_timeout)?;
		stream.set_nonblocking(true)?;
		stream.set_nodelay(*nodelay)?;
		let control = stream.try_clone()?;

		// Registering with the reactor requires a runtime context.
		let _guard = self.runtime.enter();
		self.stream = Some(Arc::new(TcpStream::from_std(stream)?));
		self.control = Some(control);
		Ok(())
	}

	fn close(&mut self) {
		if let Some(control) = self.control.take() {
			if let Err(error) = control.shutdown(Shutdown::Both) {
				tracing::debug!(%error, "failed to shut down TCP connection");
			}
		}
		if self.stream.take().is_some() {
			tracing::debug!("closed TCP connection");
		}
	}

	fn is_open(&self) -> bool {
		self.stream.is_some()
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
		let written = match self.stream_ref()?.try_write(buf) {
			Ok(len) => len,
			Err(error) if error.kind() == io::ErrorKind::WouldBlock => 0,
			Err(error) => return Err(error.into()),
		};
		if written < buf.len() {
			self.blocked.notify_one();
		}
		Ok(written)
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
		match self.stream_ref()?.try_read(buf) {
			Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
			Ok(len) => Ok(len),
			Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(0),
			Err(error) => Err(error.into()),
		}
	}
}

/// Tries every address `host` resolves to, giving each `timeout`.
fn connect_with_timeout(
	host: &str,
	port: u16,
	timeout: Duration,
) -> io::Result<std::net::TcpStream> {
	let mut last_error = None;
	for address in (host, port).to_socket_addrs()? {
		match std::net::TcpStream::connect_timeout(&address, timeout) {
			Ok(stream) => return Ok(stream),
			Err(error) => {
				tracing::debug!(%address, %error, "connection attempt failed");
				last_error = Some(error);
			}
		}
	}
	Err(last_error.unwrap_or_else(|| {
		io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
	}))
}
