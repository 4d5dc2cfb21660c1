mod scheduler;
mod transport;

use super::Session;
use crate::transport::{Side, TransportEvent};

pub use self::{
	scheduler::TokioScheduler,
	transport::{TcpConfiguration, TcpTransport},
};

/// Drives `session` by forwarding socket readiness as [`TransportEvent`]s.
///
/// Returns once the session has been disconnected or its transport has
/// failed.
///
/// # Example
///
/// ```no_run
/// # tokio_test::block_on(async {
/// use tokio::{runtime::Handle, sync::mpsc};
/// use umqtt::{
/// 	clients::tokio::{run, TcpConfiguration, TcpTransport, TokioScheduler},
/// 	Event, Options, Session,
/// };
///
/// let (tx, mut events) = mpsc::unbounded_channel();
/// let session = Session::new(
/// 	TcpTransport::new(TcpConfiguration::default(), Handle::current()),
/// 	Options::default(),
/// 	"example",
/// 	TokioScheduler::current(),
/// 	tx,
/// )
/// .unwrap();
///
/// tokio::spawn({
/// 	let session = session.clone();
/// 	async move { run(&session).await }
/// });
///
/// session.connect(None).unwrap();
/// while let Some(event) = events.recv().await {
/// 	if let Event::Connected { .. } = event {
/// 		session.subscribe("a/b").unwrap();
/// 	}
/// }
/// # })
/// ```
pub async fn run(session: &Session<TcpTransport>) {
	let blocked = session.with_transport(|transport| transport.write_blocked());
	loop {
		let Some(stream) = session.with_transport(|transport| transport.stream()) else {
			tracing::debug!("transport closed, stopping");
			break;
		};

		// Writes issued by other tasks only show up here once they block.
		let pending_writes = session.has_pending_writes();

		#[rustfmt::skip]
		let event = tokio::select! {
			ready = stream.readable() => match ready {
				Ok(()) => TransportEvent::BytesAvailable,
				Err(error) => TransportEvent::Error(Side::Read, error.into()),
			},
			ready = stream.writable(), if pending_writes => match ready {
				Ok(()) => TransportEvent::SpaceAvailable,
				Err(error) => TransportEvent::Error(Side::Write, error.into()),
			},
			_ = blocked.notified(), if !pending_writes => continue,
		};

		if session.handle_event(event).is_break() {
			break;
		}
	}
}
