use super::{keep_alive::KeepAlive, ClientError, Delegate, Event, Options};
use crate::{
	packets::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, SubAck, Subscribe, Unsubscribe},
	transport::{ClientIdProvider, Scheduler, Side, Transport, TransportError, TransportEvent},
	unpacker::Unpacker,
	Credentials, PacketId, PacketIds, QoS,
};
use bytes::{Buf, Bytes, BytesMut};
use std::{
	ops::ControlFlow,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, MutexGuard, PoisonError, Weak,
	},
};

/// Largest single read handed to the transport.
const READ_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	/// The transport is closed. Only [`Session::connect`] reopens it.
	Closed,
	/// The transport is open but no Connect packet has been sent.
	Open,
	/// Waiting for ConnAck.
	Connecting,
	Connected,
	/// The Server refused the last Connect packet.
	Refused(ConnectReturnCode),
}

impl ConnectionState {
	fn may_reconnect(self) -> bool {
		matches!(self, Self::Open | Self::Connecting | Self::Connected)
	}
}

/// An MQTT session over a single [`Transport`].
///
/// Operations encode one packet each and write it immediately. Incoming bytes
/// are processed when the transport reports them through
/// [`handle_event`](Self::handle_event), and the results are reported to the
/// [`Delegate`].
///
/// Cloning a `Session` yields another handle to the same session. The
/// keep-alive timer is cancelled by [`disconnect`](Self::disconnect) or when
/// the last handle is dropped.
pub struct Session<T: Transport + 'static> {
	inner: Arc<Inner<T>>,
}

struct Inner<T> {
	options: Options,
	client_id: Box<dyn ClientIdProvider>,
	scheduler: Box<dyn Scheduler>,
	delegate: Box<dyn Delegate>,
	packet_ids: PacketIds,

	// Lock order is `unpacker` before `link`. `keep_alive` is never held while
	// acquiring another lock.
	unpacker: Mutex<Unpacker>,
	link: Mutex<Link<T>>,
	keep_alive: Mutex<Option<KeepAlive>>,

	/// Set when the transport has been reopened and any partially unpacked
	/// packet belongs to the old stream.
	stale_stream: AtomicBool,
}

struct Link<T> {
	transport: T,
	state: ConnectionState,
	outgoing: BytesMut,

	// Serialized Connect packet. We store a copy so we can re-send it on
	// reconnections.
	connect: Option<Bytes>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport + 'static> Clone for Session<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T: Transport + 'static> Session<T> {
	/// Opens `transport` and starts the keep-alive timer.
	pub fn new(
		mut transport: T,
		options: Options,
		client_id: impl ClientIdProvider + 'static,
		scheduler: impl Scheduler + 'static,
		delegate: impl Delegate + 'static,
	) -> Result<Self, ClientError> {
		transport.open()?;
		tracing::info!("transport opened");

		let inner = Arc::new(Inner {
			options,
			client_id: Box::new(client_id),
			scheduler: Box::new(scheduler),
			delegate: Box::new(delegate),
			packet_ids: PacketIds::new(),
			unpacker: Mutex::new(Unpacker::new()),
			link: Mutex::new(Link {
				transport,
				state: ConnectionState::Open,
				outgoing: BytesMut::new(),
				connect: None,
			}),
			keep_alive: Mutex::new(None),
			stale_stream: AtomicBool::new(false),
		});

		Inner::start_keep_alive(&inner);
		Ok(Self { inner })
	}

	/// Sends a Connect packet, reopening the transport if the session was
	/// disconnected.
	///
	/// Returns [`ClientError::AlreadyConnected`] while a Connect is awaiting
	/// its ConnAck or has been accepted on the open transport.
	pub fn connect(&self, credentials: Option<Credentials>) -> Result<(), ClientError> {
		let inner = &self.inner;
		let connect = Connect {
			client_id: inner.client_id.current_client_id(),
			keep_alive: inner.options.keep_alive,
			clean_session: inner.options.clean_session,
			will: inner.options.will.clone(),
			credentials,
			..Default::default()
		};
		tracing::debug!(client_id = %connect.client_id, "connecting");
		let frame = Packet::Connect(connect).encode()?;

		let reopened = {
			let mut link = lock(&inner.link);
			let reopened = !link.transport.is_open();
			let established = matches!(
				link.state,
				ConnectionState::Connecting | ConnectionState::Connected
			);
			if !reopened && established {
				tracing::warn!(state = ?link.state, "ignoring Connect on an established session");
				return Err(ClientError::AlreadyConnected);
			}
			if reopened {
				link.transport.open()?;
				link.outgoing.clear();
				tracing::info!("transport reopened");
			}
			link.state = ConnectionState::Connecting;
			link.connect = Some(frame.clone());
			reopened
		};

		if reopened {
			inner.stale_stream.store(true, Ordering::Release);
		}

		let stopped = lock(&inner.keep_alive).is_none();
		if stopped {
			Inner::start_keep_alive(inner);
		}

		inner.write_or_report(frame)
	}

	/// Sends a Disconnect packet, stops the keep-alive timer and closes the
	/// transport.
	pub fn disconnect(&self) -> Result<(), ClientError> {
		let inner = &self.inner;
		inner.stop_keep_alive();

		let result = {
			let mut link = lock(&inner.link);
			let result = if link.transport.is_open() {
				tracing::debug!("sending Disconnect");
				let frame = Packet::Disconnect.encode()?;
				link.outgoing.extend_from_slice(&frame);
				link.flush()
			} else {
				Ok(())
			};

			link.transport.close();
			link.outgoing.clear();
			link.connect = None;
			link.state = ConnectionState::Closed;
			result
		};

		lock(&inner.unpacker).reset();
		tracing::info!("disconnected");
		Ok(result?)
	}

	/// Subscribes to `topic` with the QoS from [`Options::subscribe_qos`].
	pub fn subscribe(&self, topic: impl Into<String>) -> Result<PacketId, ClientError> {
		self.subscribe_with(topic, self.inner.options.subscribe_qos)
	}

	pub fn subscribe_with(&self, topic: impl Into<String>, qos: QoS) -> Result<PacketId, ClientError> {
		let id = self.inner.packet_ids.next();
		self.inner.send(Packet::Subscribe(Subscribe {
			id,
			topic: topic.into(),
			qos,
		}))?;
		Ok(id)
	}

	pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<PacketId, ClientError> {
		let id = self.inner.packet_ids.next();
		self.inner.send(Packet::Unsubscribe(Unsubscribe {
			id,
			topic: topic.into(),
		}))?;
		Ok(id)
	}

	/// Publishes a message. Returns the packet identifier for QoS 1, which is
	/// reported again in [`Event::Published`] once acknowledged.
	pub fn publish(
		&self,
		topic: impl Into<String>,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<Option<PacketId>, ClientError> {
		if qos == QoS::ExactlyOnce {
			return Err(ClientError::QoS2Unsupported);
		}

		let publish = Publish::build(topic, payload, qos, retain, || self.inner.packet_ids.next());
		let id = publish.id();
		self.inner.send(Packet::Publish(publish))?;
		Ok(id)
	}

	pub fn ping(&self) -> Result<(), ClientError> {
		self.inner.ping()
	}

	/// Processes a notification from the transport.
	///
	/// Returns [`ControlFlow::Break`] once the transport is no longer usable
	/// and should stop being polled.
	pub fn handle_event(&self, event: TransportEvent) -> ControlFlow<()> {
		let inner = &self.inner;
		match event {
			TransportEvent::Opened(side) => {
				tracing::trace!(%side, "transport side opened");
				ControlFlow::Continue(())
			}
			TransportEvent::BytesAvailable => inner.read_available(),
			TransportEvent::SpaceAvailable => {
				let result = {
					let mut link = lock(&inner.link);
					match link.flush() {
						Ok(()) => Ok(()),
						Err(error) => inner.recover(&mut link, error, None),
					}
				};
				inner.continue_unless_failed(result)
			}
			TransportEvent::Error(Side::Read, error) => {
				tracing::error!(%error, "read failed");
				inner.emit(Event::ConnectionError {
					side: Side::Read,
					reason: error.to_string(),
				});
				ControlFlow::Break(())
			}
			TransportEvent::Error(Side::Write, error) => {
				let result = {
					let mut link = lock(&inner.link);
					inner.recover(&mut link, error, None)
				};
				inner.continue_unless_failed(result)
			}
		}
	}

	pub fn state(&self) -> ConnectionState {
		lock(&self.inner.link).state
	}

	/// Returns `true` if bytes are waiting for space in the transport.
	pub fn has_pending_writes(&self) -> bool {
		!lock(&self.inner.link).outgoing.is_empty()
	}

	/// Runs `f` with exclusive access to the transport.
	pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
		f(&mut lock(&self.inner.link).transport)
	}
}

impl<T: Transport + 'static> Inner<T> {
	fn start_keep_alive(this: &Arc<Self>) {
		let Some(interval) = this.options.ping_interval() else {
			return;
		};

		let session: Weak<Self> = Arc::downgrade(this);
		let keep_alive = KeepAlive::start(
			this.scheduler.as_ref(),
			interval,
			Box::new(move || {
				let Some(session) = session.upgrade() else {
					return;
				};
				if let Err(error) = session.ping() {
					tracing::warn!(%error, "keep-alive ping failed");
				}
			}),
		);

		// Replacing a running timer cancels it once the guard is dropped.
		let previous = lock(&this.keep_alive).replace(keep_alive);
		drop(previous);
	}

	fn stop_keep_alive(&self) {
		let keep_alive = lock(&self.keep_alive).take();
		drop(keep_alive);
	}

	fn ping(&self) -> Result<(), ClientError> {
		self.send(Packet::PingReq)
	}

	fn emit(&self, event: Event) {
		tracing::trace!(?event, "emitting event");
		self.delegate.on_event(event);
	}

	fn ensure_usable(&self) -> Result<(), ClientError> {
		match lock(&self.link).state {
			ConnectionState::Closed => Err(ClientError::Disconnected),
			ConnectionState::Refused(code) => Err(ClientError::Refused(code)),
			_ => Ok(()),
		}
	}

	/// Encodes and writes a packet on behalf of a caller.
	fn send(&self, packet: Packet) -> Result<(), ClientError> {
		self.ensure_usable()?;
		let frame = packet.encode()?;
		tracing::debug!(?packet, "sending packet");
		self.write_or_report(frame)
	}

	/// Writes `frame`, reporting a connection error to the delegate if the
	/// write fails even after reconnecting.
	fn write_or_report(&self, frame: Bytes) -> Result<(), ClientError> {
		self.write_frame(frame).map_err(|error| {
			self.emit(Event::ConnectionError {
				side: Side::Write,
				reason: error.to_string(),
			});
			ClientError::from(error)
		})
	}

	fn write_frame(&self, frame: Bytes) -> Result<(), TransportError> {
		let mut link = lock(&self.link);
		link.outgoing.extend_from_slice(&frame);
		match link.flush() {
			Ok(()) => Ok(()),
			Err(error) => self.recover(&mut link, error, Some(&frame[..])),
		}
	}

	/// Handles a write-side failure with a single attempt to reopen the
	/// transport. `pending` is the frame being written when the error occurred.
	fn recover(
		&self,
		link: &mut Link<T>,
		error: TransportError,
		pending: Option<&[u8]>,
	) -> Result<(), TransportError> {
		link.outgoing.clear();
		if !self.options.reconnect || !link.state.may_reconnect() {
			tracing::error!(%error, "write failed");
			return Err(error);
		}

		tracing::warn!(%error, "write failed, reopening transport");
		link.transport.close();
		if let Err(error) = link.transport.open() {
			tracing::error!(%error, "failed to reopen transport");
			return Err(error);
		}
		self.stale_stream.store(true, Ordering::Release);

		// The new stream needs a new MQTT session before anything else.
		if let Some(connect) = link.connect.clone() {
			link.outgoing.extend_from_slice(&connect);
			link.state = ConnectionState::Connecting;
		} else {
			link.state = ConnectionState::Open;
		}

		if let Some(pending) = pending {
			if link.connect.as_deref() != Some(pending) {
				link.outgoing.extend_from_slice(pending);
			}
		}

		link.flush().map_err(|error| {
			tracing::error!(%error, "write failed after reopening transport");
			link.outgoing.clear();
			error
		})
	}

	fn continue_unless_failed(&self, result: Result<(), TransportError>) -> ControlFlow<()> {
		match result {
			Ok(()) => ControlFlow::Continue(()),
			Err(error) => {
				self.emit(Event::ConnectionError {
					side: Side::Write,
					reason: error.to_string(),
				});
				ControlFlow::Break(())
			}
		}
	}

	/// Reads and unpacks everything the transport currently has available.
	fn read_available(&self) -> ControlFlow<()> {
		let mut events = Vec::new();
		let flow = {
			let mut unpacker = lock(&self.unpacker);
			let mut buffer = [0u8; READ_CHUNK];
			loop {
				if self.stale_stream.swap(false, Ordering::AcqRel) {
					tracing::debug!("discarding partial packet from previous stream");
					unpacker.reset();
				}

				let read = {
					let mut link = lock(&self.link);
					if link.state == ConnectionState::Closed {
						break ControlFlow::Break(());
					}
					let demand = unpacker.demand().min(READ_CHUNK);
					link.transport.read(&mut buffer[..demand])
				};

				match read {
					Ok(0) => break ControlFlow::Continue(()),
					Ok(len) => {
						tracing::trace!(len, "read from transport");
						let mut chunk = &buffer[..len];
						while chunk.has_remaining() {
							match unpacker.feed(&mut chunk) {
								Some(Ok(packet)) => self.dispatch(packet, &mut events),
								Some(Err(error)) => {
									tracing::warn!(%error, "dropping malformed packet");
									events.push(Event::DecodeFailed(error));
								}
								None => break,
							}
						}
					}
					Err(error) => {
						tracing::error!(%error, "read failed");
						events.push(Event::ConnectionError {
							side: Side::Read,
							reason: error.to_string(),
						});
						break ControlFlow::Break(());
					}
				}
			}
		};

		for event in events {
			self.emit(event);
		}
		flow
	}

	/// Acts on a decoded packet. Events are collected rather than emitted so
	/// the delegate never runs while the unpacker is locked.
	fn dispatch(&self, packet: Packet, events: &mut Vec<Event>) {
		tracing::debug!(?packet, "received packet");
		match packet {
			Packet::ConnAck(ConnAck {
				session_present,
				code,
			}) => {
				if code.is_accepted() {
					lock(&self.link).state = ConnectionState::Connected;
					tracing::info!(session_present, "connected");
					events.push(Event::Connected { session_present });
				} else {
					lock(&self.link).state = ConnectionState::Refused(code);
					self.stop_keep_alive();
					tracing::error!(%code, "connection refused");
					events.push(Event::ConnectionRefused(code));
				}
			}
			Packet::Publish(publish) => {
				let response = match publish {
					Publish::AtMostOnce { .. } => None,
					Publish::AtLeastOnce { id, .. } => Some(Packet::PubAck { id }),
					Publish::ExactlyOnce { id, .. } => {
						tracing::warn!(%id, "QoS 2 delivery will not be completed");
						Some(Packet::PubRec { id })
					}
				};

				if let Some(response) = response {
					if let Err(error) = self.write_response(&response) {
						events.push(Event::ConnectionError {
							side: Side::Write,
							reason: error.to_string(),
						});
					}
				}

				events.push(Event::Message(publish.into()));
			}
			Packet::PubAck { id } => events.push(Event::Published(id)),
			Packet::SubAck(SubAck { id, code }) => events.push(Event::Subscribed { id, code }),
			Packet::UnsubAck { id } => events.push(Event::Unsubscribed(id)),
			Packet::PingResp => tracing::trace!("received PingResp"),
			packet @ (Packet::PubRec { .. } | Packet::PubRel { .. } | Packet::PubComp { .. }) => {
				let packet_type = packet.packet_type();
				tracing::error!(%packet_type, "QoS 2 flow is not supported");
				events.push(Event::Unsupported(packet_type));
			}
			packet @ (Packet::Connect(_)
			| Packet::Subscribe(_)
			| Packet::Unsubscribe(_)
			| Packet::PingReq
			| Packet::Disconnect) => {
				let packet_type = packet.packet_type();
				tracing::warn!(%packet_type, "Server sent a Client-only packet");
				events.push(Event::Unexpected(packet_type));
			}
		}
	}

	fn write_response(&self, packet: &Packet) -> Result<(), ClientError> {
		let frame = packet.encode()?;
		tracing::debug!(?packet, "sending packet");
		Ok(self.write_frame(frame)?)
	}
}

impl<T: Transport> Link<T> {
	/// Writes buffered bytes until the buffer is empty or the transport has no
	/// more space.
	fn flush(&mut self) -> Result<(), TransportError> {
		while !self.outgoing.is_empty() {
			let written = self.transport.write(&self.outgoing)?;
			if written == 0 {
				tracing::trace!(pending = self.outgoing.len(), "transport is full");
				break;
			}
			self.outgoing.advance(written);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{ConnectionState, Session};
	use crate::{
		clients::{ClientError, Event, Message, Options},
		packets::{ConnectReturnCode, Packet, Publish, Subscribe, SubscribeReturnCode},
		transport::{Cancel, Scheduler, Side, Transport, TransportError, TransportEvent},
		Credentials, PacketId, QoS,
	};
	use std::{
		collections::VecDeque,
		io,
		ops::ControlFlow,
		sync::{
			atomic::{AtomicBool, Ordering},
			mpsc, Arc, Mutex,
		},
		time::Duration,
	};

	#[derive(Debug, Default)]
	struct Wire {
		open: bool,
		opens: usize,
		closes: usize,
		written: Vec<u8>,
		inbound: VecDeque<u8>,
		failing_writes: usize,
		failing_reads: usize,
		write_space: Option<usize>,
	}

	#[derive(Clone, Debug, Default)]
	struct MockTransport(Arc<Mutex<Wire>>);

	impl MockTransport {
		fn wire(&self) -> std::sync::MutexGuard<'_, Wire> {
			self.0.lock().unwrap()
		}

		fn take_written(&self) -> Vec<u8> {
			std::mem::take(&mut self.wire().written)
		}

		fn push_inbound(&self, bytes: &[u8]) {
			self.wire().inbound.extend(bytes);
		}
	}

	impl Transport for MockTransport {
		fn open(&mut self) -> Result<(), TransportError> {
			let mut wire = self.wire();
			wire.open = true;
			wire.opens += 1;
			Ok(())
		}

		fn close(&mut self) {
			let mut wire = self.wire();
			wire.open = false;
			wire.closes += 1;
		}

		fn is_open(&self) -> bool {
			self.0.lock().unwrap().open
		}

		fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
			let mut wire = self.wire();
			if !wire.open {
				return Err(TransportError::NotOpen);
			}
			if wire.failing_writes > 0 {
				wire.failing_writes -= 1;
				return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
			}
			let len = match &mut wire.write_space {
				Some(space) => {
					let len = buf.len().min(*space);
					*space -= len;
					len
				}
				None => buf.len(),
			};
			wire.written.extend_from_slice(&buf[..len]);
			Ok(len)
		}

		fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
			let mut wire = self.wire();
			if !wire.open {
				return Err(TransportError::NotOpen);
			}
			if wire.failing_reads > 0 {
				wire.failing_reads -= 1;
				return Err(TransportError::Closed);
			}
			let len = buf.len().min(wire.inbound.len());
			for (slot, byte) in buf.iter_mut().zip(wire.inbound.drain(..len)) {
				*slot = byte;
			}
			Ok(len)
		}
	}

	struct Timer {
		interval: Duration,
		callback: Box<dyn FnMut() + Send>,
		cancelled: Arc<AtomicBool>,
	}

	#[derive(Clone, Default)]
	struct ManualScheduler(Arc<Mutex<Vec<Timer>>>);

	struct ManualHandle(Arc<AtomicBool>);

	impl Cancel for ManualHandle {
		fn cancel(&mut self) {
			self.0.store(true, Ordering::SeqCst);
		}
	}

	impl Scheduler for ManualScheduler {
		fn schedule_repeating(
			&self,
			interval: Duration,
			callback: Box<dyn FnMut() + Send>,
		) -> Box<dyn Cancel> {
			let cancelled = Arc::new(AtomicBool::new(false));
			self.0.lock().unwrap().push(Timer {
				interval,
				callback,
				cancelled: Arc::clone(&cancelled),
			});
			Box::new(ManualHandle(cancelled))
		}
	}

	impl ManualScheduler {
		/// Fires every live timer once. Callbacks are taken out of the list while
		/// they run so they may schedule new timers.
		fn tick(&self) {
			let mut timers = std::mem::take(&mut *self.0.lock().unwrap());
			for timer in timers.iter_mut() {
				if !timer.cancelled.load(Ordering::SeqCst) {
					(timer.callback)();
				}
			}
			let mut current = self.0.lock().unwrap();
			timers.append(&mut current);
			*current = timers;
		}

		fn live(&self) -> Vec<Duration> {
			self.0
				.lock()
				.unwrap()
				.iter()
				.filter(|timer| !timer.cancelled.load(Ordering::SeqCst))
				.map(|timer| timer.interval)
				.collect()
		}
	}

	struct Harness {
		session: Session<MockTransport>,
		transport: MockTransport,
		scheduler: ManualScheduler,
		events: mpsc::Receiver<Event>,
	}

	impl Harness {
		fn new(options: Options) -> Self {
			let transport = MockTransport::default();
			let scheduler = ManualScheduler::default();
			let (tx, events) = mpsc::channel();
			let session = Session::new(transport.clone(), options, "umqtt-test", scheduler.clone(), tx)
				.unwrap();
			Self {
				session,
				transport,
				scheduler,
				events,
			}
		}

		/// Creates a session which has completed the Connect exchange.
		fn connected() -> Self {
			let harness = Self::new(Options::default());
			harness.session.connect(None).unwrap();
			harness.receive(b"\x20\x02\x00\x00");
			assert_eq!(
				harness.events(),
				vec![Event::Connected {
					session_present: false
				}]
			);
			harness.transport.take_written();
			harness
		}

		fn receive(&self, bytes: &[u8]) -> ControlFlow<()> {
			self.transport.push_inbound(bytes);
			self.session.handle_event(TransportEvent::BytesAvailable)
		}

		fn events(&self) -> Vec<Event> {
			self.events.try_iter().collect()
		}
	}

	fn id(value: u16) -> PacketId {
		PacketId::new(value).unwrap()
	}

	#[test]
	fn opens_transport_and_schedules_keep_alive() {
		let harness = Harness::new(Options::default());
		assert_eq!(harness.transport.wire().opens, 1);
		assert_eq!(harness.session.state(), ConnectionState::Open);
		assert_eq!(harness.scheduler.live(), vec![Duration::from_secs(85)]);
	}

	#[test]
	fn connect_writes_connect_packet() {
		let harness = Harness::new(Options::default());
		harness
			.session
			.connect(Some(Credentials::new_with("user", "pass")))
			.unwrap();

		let written = harness.transport.take_written();
		assert_eq!(written[0], 0x10);
		assert_eq!(&written[2..12], b"\x00\x04MQTT\x04\xc2\x00\xaa");
		assert_eq!(&written[12..24], b"\x00\x0aumqtt-test");
		assert_eq!(harness.session.state(), ConnectionState::Connecting);
	}

	#[test]
	fn reports_accepted_connection() {
		let harness = Harness::connected();
		assert_eq!(harness.session.state(), ConnectionState::Connected);
	}

	#[test]
	fn rejects_second_connect() {
		let harness = Harness::new(Options::default());
		harness.session.connect(None).unwrap();
		harness.transport.take_written();

		assert!(matches!(
			harness.session.connect(None),
			Err(ClientError::AlreadyConnected)
		));
		assert!(harness.transport.take_written().is_empty());
		assert_eq!(harness.session.state(), ConnectionState::Connecting);

		harness.receive(b"\x20\x02\x00\x00");
		assert!(matches!(
			harness.session.connect(None),
			Err(ClientError::AlreadyConnected)
		));
		assert!(harness.transport.take_written().is_empty());
		assert_eq!(harness.transport.wire().opens, 1);
		assert_eq!(harness.session.state(), ConnectionState::Connected);
	}

	#[test]
	fn refused_connection_is_terminal() {
		let harness = Harness::new(Options::default());
		harness.session.connect(None).unwrap();
		harness.receive(b"\x20\x02\x00\x05");

		assert_eq!(
			harness.events(),
			vec![Event::ConnectionRefused(ConnectReturnCode::NotAuthorized)]
		);
		assert_eq!(
			harness.session.state(),
			ConnectionState::Refused(ConnectReturnCode::NotAuthorized)
		);
		assert!(harness.scheduler.live().is_empty());
		assert!(matches!(
			harness.session.publish("a/b", "x", QoS::AtMostOnce, false),
			Err(ClientError::Refused(ConnectReturnCode::NotAuthorized))
		));
	}

	#[test]
	fn unrecognized_connack_code_is_reported() {
		let harness = Harness::new(Options::default());
		harness.session.connect(None).unwrap();
		harness.receive(b"\x20\x02\x00\x7f");
		assert_eq!(
			harness.events(),
			vec![Event::ConnectionRefused(ConnectReturnCode::Unrecognized(0x7f))]
		);
	}

	#[test]
	fn acknowledges_qos1_publish_once() {
		let harness = Harness::connected();
		let publish = Packet::Publish(Publish::build(
			"a/b",
			"hello",
			QoS::AtLeastOnce,
			false,
			|| id(0x1234),
		));
		harness.receive(&publish.encode().unwrap());

		assert_eq!(harness.transport.take_written(), b"\x40\x02\x12\x34");
		assert_eq!(
			harness.events(),
			vec![Event::Message(Message {
				topic: "a/b".into(),
				payload: "hello".into(),
				qos: QoS::AtLeastOnce,
				duplicate: false,
				retain: false,
			})]
		);
	}

	#[test]
	fn does_not_acknowledge_qos0_publish() {
		let harness = Harness::connected();
		harness.receive(b"\x31\x05\x00\x01tok");
		assert!(harness.transport.take_written().is_empty());

		let events = harness.events();
		assert_eq!(events.len(), 1);
		let Event::Message(message) = &events[0] else {
			panic!("expected Message, got {events:?}");
		};
		assert!(message.retain);
		assert_eq!(&message.payload[..], b"ok");
	}

	#[test]
	fn answers_qos2_publish_with_pubrec_only() {
		let harness = Harness::connected();
		harness.receive(b"\x34\x05\x00\x01t\x00\x09");
		assert_eq!(harness.transport.take_written(), b"\x50\x02\x00\x09");
		assert!(matches!(harness.events()[..], [Event::Message(_)]));

		harness.receive(b"\x62\x02\x00\x09");
		assert!(harness.transport.take_written().is_empty());
		assert_eq!(
			harness.events(),
			vec![Event::Unsupported(crate::PacketType::PubRel)]
		);
	}

	#[test]
	fn rejects_qos2_publish() {
		let harness = Harness::connected();
		assert!(matches!(
			harness.session.publish("a/b", "x", QoS::ExactlyOnce, false),
			Err(ClientError::QoS2Unsupported)
		));
		assert!(harness.transport.take_written().is_empty());
	}

	#[test]
	fn subscribe_writes_expected_bytes() {
		let harness = Harness::connected();
		let id = harness.session.subscribe("a/b").unwrap();
		assert_eq!(id.get(), 1);
		assert_eq!(
			harness.transport.take_written(),
			[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x01]
		);

		harness.receive(b"\x90\x03\x00\x01\x01");
		assert_eq!(
			harness.events(),
			vec![Event::Subscribed {
				id,
				code: SubscribeReturnCode::MaxQoS1
			}]
		);
	}

	#[test]
	fn operations_draw_distinct_ids() {
		let harness = Harness::connected();
		let subscribe = harness.session.subscribe_with("a", QoS::AtMostOnce).unwrap();
		let publish = harness
			.session
			.publish("a", "x", QoS::AtLeastOnce, false)
			.unwrap();
		let unsubscribe = harness.session.unsubscribe("a").unwrap();
		assert_eq!(
			[subscribe.get(), publish.map(|id| id.get()).unwrap_or(0), unsubscribe.get()],
			[1, 2, 3]
		);
		assert_eq!(
			harness.session.publish("a", "x", QoS::AtMostOnce, false).unwrap(),
			None
		);

		harness.receive(b"\x40\x02\x00\x02\xb0\x02\x00\x03");
		assert_eq!(
			harness.events(),
			vec![Event::Published(id(2)), Event::Unsubscribed(id(3))]
		);
	}

	#[test]
	fn reassembles_packets_split_across_notifications() {
		let harness = Harness::connected();
		let bytes = Packet::Publish(Publish::build("a/b", vec![7u8; 200], QoS::AtMostOnce, false, || {
			id(1)
		}))
		.encode()
		.unwrap();

		for split in [1, 2, 3, 100] {
			assert_eq!(harness.receive(&bytes[..split]), ControlFlow::Continue(()));
			assert!(harness.events().is_empty());
			harness.receive(&bytes[split..]);
			assert!(matches!(harness.events()[..], [Event::Message(_)]));
		}
	}

	#[test]
	fn reports_decode_errors_and_recovers() {
		let harness = Harness::connected();
		harness.receive(b"\x30\x03\x00\x0aa\xd0\x00\x90\x03\x00\x01\x80");
		assert_eq!(
			harness.events(),
			vec![
				Event::DecodeFailed(crate::packets::DecodeError::TruncatedPublish),
				Event::Subscribed {
					id: id(1),
					code: SubscribeReturnCode::Failure
				}
			]
		);
	}

	#[test]
	fn keep_alive_sends_pingreq() {
		let harness = Harness::connected();
		harness.scheduler.tick();
		assert_eq!(harness.transport.take_written(), b"\xc0\x00");

		harness.receive(b"\xd0\x00");
		assert!(harness.events().is_empty());
	}

	#[test]
	fn disconnect_cancels_keep_alive_and_closes() {
		let harness = Harness::connected();
		harness.session.disconnect().unwrap();

		assert_eq!(harness.transport.take_written(), b"\xe0\x00");
		assert!(harness.scheduler.live().is_empty());
		assert!(!harness.transport.is_open());
		assert_eq!(harness.session.state(), ConnectionState::Closed);

		harness.scheduler.tick();
		assert!(harness.transport.take_written().is_empty());
		assert!(matches!(
			harness.session.ping(),
			Err(ClientError::Disconnected)
		));
		assert_eq!(
			harness.session.handle_event(TransportEvent::BytesAvailable),
			ControlFlow::Break(())
		);
	}

	#[test]
	fn connect_after_disconnect_starts_fresh() {
		let harness = Harness::connected();
		// Leave a partial packet in the unpacker.
		harness.receive(b"\x30\x10\x00");
		harness.session.disconnect().unwrap();
		harness.transport.take_written();

		harness.session.connect(None).unwrap();
		assert_eq!(harness.transport.wire().opens, 2);
		assert_eq!(harness.scheduler.live(), vec![Duration::from_secs(85)]);
		assert_eq!(harness.transport.take_written()[0], 0x10);

		harness.receive(b"\x20\x02\x01\x00");
		assert_eq!(
			harness.events(),
			vec![Event::Connected {
				session_present: true
			}]
		);
	}

	#[test]
	fn dropping_session_cancels_keep_alive() {
		let harness = Harness::connected();
		let Harness {
			session, scheduler, ..
		} = harness;
		assert_eq!(scheduler.live().len(), 1);
		drop(session);
		assert!(scheduler.live().is_empty());
	}

	#[test]
	fn reconnects_once_after_write_error() {
		let harness = Harness::connected();
		let connect = {
			harness.session.disconnect().unwrap();
			harness.transport.take_written();
			harness.session.connect(None).unwrap();
			harness.receive(b"\x20\x02\x00\x00");
			harness.events();
			harness.transport.take_written()
		};
		let opens = harness.transport.wire().opens;

		harness.transport.wire().failing_writes = 1;
		let id = harness
			.session
			.publish("a/b", "x", QoS::AtLeastOnce, false)
			.unwrap();

		assert_eq!(harness.transport.wire().opens, opens + 1);
		assert_eq!(harness.session.state(), ConnectionState::Connecting);

		let publish = Packet::Publish(Publish::build("a/b", "x", QoS::AtLeastOnce, false, || {
			id.unwrap()
		}))
		.encode()
		.unwrap();
		let mut expected = connect;
		expected.extend_from_slice(&publish);
		assert_eq!(harness.transport.take_written(), expected);
		assert!(harness.events().is_empty());
	}

	#[test]
	fn reports_write_error_when_reconnect_fails() {
		let harness = Harness::connected();
		let opens = harness.transport.wire().opens;

		harness.transport.wire().failing_writes = 2;
		let result = harness.session.publish("a/b", "x", QoS::AtMostOnce, false);
		assert!(matches!(result, Err(ClientError::Transport(_))));

		// Exactly one reconnect attempt.
		assert_eq!(harness.transport.wire().opens, opens + 1);
		assert!(matches!(
			harness.events()[..],
			[Event::ConnectionError {
				side: Side::Write,
				..
			}]
		));
	}

	#[test]
	fn write_error_event_triggers_reconnect() {
		let harness = Harness::connected();
		let error = io::Error::from(io::ErrorKind::ConnectionReset).into();
		assert_eq!(
			harness
				.session
				.handle_event(TransportEvent::Error(Side::Write, error)),
			ControlFlow::Continue(())
		);
		assert_eq!(harness.transport.wire().opens, 2);
		assert_eq!(harness.transport.take_written()[0], 0x10);
	}

	#[test]
	fn no_reconnect_when_disabled() {
		let harness = Harness::new(Options {
			reconnect: false,
			..Default::default()
		});
		harness.transport.wire().failing_writes = 1;
		assert!(harness.session.connect(None).is_err());
		assert_eq!(harness.transport.wire().opens, 1);
	}

	#[test]
	fn read_error_is_reported_without_reconnect() {
		let harness = Harness::connected();
		harness.transport.wire().failing_reads = 1;
		assert_eq!(
			harness.session.handle_event(TransportEvent::BytesAvailable),
			ControlFlow::Break(())
		);
		assert_eq!(harness.transport.wire().opens, 1);
		assert!(matches!(
			harness.events()[..],
			[Event::ConnectionError {
				side: Side::Read,
				..
			}]
		));
	}

	#[test]
	fn resumes_partial_writes_on_space_available() {
		let harness = Harness::connected();
		harness.transport.wire().write_space = Some(3);
		harness
			.session
			.publish("a/b", "hello", QoS::AtMostOnce, false)
			.unwrap();
		assert!(harness.session.has_pending_writes());
		assert_eq!(harness.transport.take_written(), b"\x30\x0a\x00");

		harness.transport.wire().write_space = None;
		harness.session.handle_event(TransportEvent::SpaceAvailable);
		assert!(!harness.session.has_pending_writes());
		assert_eq!(harness.transport.take_written(), b"\x03a/bhello");
	}

	#[test]
	fn frames_are_not_interleaved_across_threads() {
		let harness = Harness::connected();
		let handles: Vec<_> = (0..4)
			.map(|n| {
				let session = harness.session.clone();
				std::thread::spawn(move || {
					for _ in 0..50 {
						session
							.subscribe_with(format!("topic/{n}"), QoS::AtMostOnce)
							.unwrap();
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}

		let written = harness.transport.take_written();
		let mut unpacker = crate::unpacker::Unpacker::new();
		let mut src = &written[..];
		let mut count = 0;
		while let Some(result) = unpacker.feed(&mut src) {
			let Ok(Packet::Subscribe(Subscribe { topic, .. })) = result else {
				panic!("expected Subscribe");
			};
			assert!(topic.starts_with("topic/"));
			count += 1;
		}
		assert_eq!(count, 200);
	}
}
