use clap::{Parser, Subcommand, ValueEnum};
use std::{io::stdin, process, str::from_utf8, time::Duration};
use tokio::{runtime::Handle, signal, sync::mpsc, time};
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use umqtt::{
	clients::tokio::{run, TcpConfiguration, TcpTransport, TokioScheduler},
	Credentials, Event, Options, QoS, Session,
};

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

type Events = mpsc::UnboundedReceiver<Event>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> umqtt::Result<()> {
	setup_tracing()?;

	let arguments = Arguments::parse();
	let options: Options = (&arguments).into();
	let configuration: TcpConfiguration = (&arguments).into();
	let client_id = arguments
		.id
		.clone()
		.unwrap_or_else(|| build_client_id(!arguments.disable_clean_session));
	let credentials = arguments.username.clone().map(|username| Credentials {
		username,
		password: arguments.password.clone(),
	});
	let Arguments { command, qos, .. } = arguments;
	let qos: QoS = qos.into();

	let (tx, mut events) = mpsc::unbounded_channel();
	let session = Session::new(
		TcpTransport::new(configuration, Handle::current()),
		options,
		client_id,
		TokioScheduler::current(),
		tx,
	)?;

	let driver = tokio::spawn({
		let session = session.clone();
		async move { run(&session).await }
	});

	session.connect(credentials)?;
	wait_for_connack(&mut events).await?;

	let outcome = match command {
		Commands::Sub { topics } => print_messages(&session, topics, qos, &mut events).await,
		Commands::Pub {
			count,
			topic,
			payload,
		} => publish_messages(&session, &topic, payload, count, qos, &mut events).await,
	};

	session.disconnect()?;
	driver.await?;
	outcome
}

/// Subscribes to `topics` and prints every message until interrupted.
async fn print_messages(
	session: &Session<TcpTransport>,
	topics: Vec<String>,
	qos: QoS,
	events: &mut Events,
) -> umqtt::Result<()> {
	for topic in topics {
		session.subscribe_with(topic, qos)?;
	}

	loop {
		let event = tokio::select! {
			_ = signal::ctrl_c() => return Ok(()),
			event = events.recv() => event,
		};
		match event {
			Some(Event::Message(message)) => {
				let payload = from_utf8(&message.payload).unwrap_or_default();
				println!("{}: {payload}", message.topic);
			}
			Some(Event::Subscribed { id, code }) if code.granted().is_none() => {
				return Err(format!("subscription {id} rejected: {code:?}").into());
			}
			Some(Event::ConnectionError { side, reason }) => {
				return Err(format!("{side} error: {reason}").into());
			}
			Some(event) => tracing::debug!(?event),
			None => return Ok(()),
		}
	}
}

/// Publishes `payload`, or one message per line of stdin when no payload is
/// given, then waits for QoS 1 acknowledgements.
async fn publish_messages(
	session: &Session<TcpTransport>,
	topic: &str,
	payload: Option<String>,
	count: Option<usize>,
	qos: QoS,
	events: &mut Events,
) -> umqtt::Result<()> {
	let limit = count.unwrap_or(usize::MAX);
	let mut unacknowledged = Vec::new();

	if let Some(payload) = payload {
		for _ in 0..count.unwrap_or(1) {
			unacknowledged.extend(session.publish(topic, payload.clone(), qos, false)?);
		}
	} else {
		for line in stdin().lines().take(limit) {
			unacknowledged.extend(session.publish(topic, line?, qos, false)?);
		}
	}

	let waited = time::timeout(EXIT_TIMEOUT, async {
		while !unacknowledged.is_empty() {
			match events.recv().await {
				Some(Event::Published(id)) => unacknowledged.retain(|pending| *pending != id),
				Some(event) => tracing::debug!(?event),
				None => break,
			}
		}
	})
	.await;

	if waited.is_err() {
		tracing::warn!(
			remaining = unacknowledged.len(),
			"timed out waiting for acknowledgements"
		);
	}
	Ok(())
}

async fn wait_for_connack(events: &mut Events) -> umqtt::Result<()> {
	let event = time::timeout(EXIT_TIMEOUT, events.recv())
		.await
		.map_err(|_| "timed out waiting for ConnAck")?;

	match event {
		Some(Event::Connected { session_present }) => {
			tracing::info!(session_present, "connected");
			Ok(())
		}
		Some(Event::ConnectionRefused(code)) => Err(format!("connection refused: {code}").into()),
		Some(event) => Err(format!("unexpected event before ConnAck: {event:?}").into()),
		None => Err("session closed before ConnAck".into()),
	}
}

fn setup_tracing() -> Result<(), SetGlobalDefaultError> {
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::ERROR.into())
		.with_env_var("MQTT_LOG")
		.try_from_env();

	let subscriber = tracing_subscriber::fmt()
		.with_target(false)
		.with_env_filter(filter.unwrap_or_default())
		.finish();

	tracing::subscriber::set_global_default(subscriber)
}

impl From<&Arguments> for Options {
	fn from(value: &Arguments) -> Self {
		Options {
			keep_alive: value.keep_alive,
			clean_session: !value.disable_clean_session,
			subscribe_qos: value.qos.into(),
			..Default::default()
		}
	}
}

impl From<&Arguments> for TcpConfiguration {
	fn from(value: &Arguments) -> Self {
		TcpConfiguration {
			host: value.host.clone(),
			port: value.port,
			..Default::default()
		}
	}
}

/// Persistent sessions need a stable Client ID, so the process id is only
/// appended for clean sessions.
fn build_client_id(clean_session: bool) -> String {
	let name = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));
	match clean_session {
		true => format!("{name}-{}", process::id()),
		false => name.to_owned(),
	}
}

#[derive(Debug, Parser)]
struct Arguments {
	#[command(subcommand)]
	command: Commands,

	/// Broker hostname or address.
	#[arg(
		long,
		short = 'H',
		global = true,
		default_value = "localhost",
		env = "MQTT_HOST"
	)]
	host: String,

	#[arg(long, short, global = true, default_value = "1883", env = "MQTT_PORT")]
	port: u16,

	/// Client ID. Generated from the package name when omitted.
	#[arg(long = "client-id", short = 'i', global = true, env = "MQTT_ID")]
	id: Option<String>,

	#[arg(long, short = 'u', global = true, env = "MQTT_USERNAME")]
	username: Option<String>,

	/// Ignored unless a username is given.
	#[arg(long, short = 'P', global = true, env = "MQTT_PASSWORD")]
	password: Option<String>,

	/// Seconds between control packets before the broker may drop us. Zero
	/// disables PingReq.
	#[arg(long, short = 'k', global = true, default_value_t = umqtt::clients::DEFAULT_KEEP_ALIVE)]
	keep_alive: u16,

	/// Ask the broker to keep session state after disconnecting.
	#[arg(long = "persist", short = 'c', global = true)]
	disable_clean_session: bool,

	/// QoS for subscriptions and published messages.
	#[arg(long, value_enum, global = true, default_value_t = InputQoS::Qos0)]
	qos: InputQoS,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Print messages published to the given topic filters
	Sub {
		#[arg(default_value = "#")]
		topics: Vec<String>,
	},
	/// Publish a payload, or each line read from stdin
	Pub {
		topic: String,
		payload: Option<String>,

		/// Number of messages to send.
		#[arg(long, short = 'C')]
		count: Option<usize>,
	},
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "lower")]
enum InputQoS {
	Qos0,
	Qos1,
}

impl From<InputQoS> for QoS {
	fn from(value: InputQoS) -> Self {
		match value {
			InputQoS::Qos0 => QoS::AtMostOnce,
			InputQoS::Qos1 => QoS::AtLeastOnce,
		}
	}
}
