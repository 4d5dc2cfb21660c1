use crate::QoS;
use bytes::Bytes;

/// Username and optional password sent with a Connect packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

impl Credentials {
	pub fn new(username: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: None,
		}
	}

	pub fn new_with(username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: Some(password.into()),
		}
	}

	pub fn set_password(&mut self, password: impl Into<String>) {
		self.password = Some(password.into());
	}
}

impl From<String> for Credentials {
	fn from(username: String) -> Self {
		Self::new(username)
	}
}

impl From<&str> for Credentials {
	fn from(username: &str) -> Self {
		Self::new(username)
	}
}

impl From<(String, String)> for Credentials {
	fn from((username, password): (String, String)) -> Self {
		Self::new_with(username, password)
	}
}

impl From<(&str, &str)> for Credentials {
	fn from((username, password): (&str, &str)) -> Self {
		Self::new_with(username, password)
	}
}

/// Last will message, published by the Server if the Client disconnects
/// ungracefully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Will {
	pub topic: String,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

impl Will {
	pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
		Self {
			topic: topic.into(),
			payload: payload.into(),
			qos,
			retain,
		}
	}
}
