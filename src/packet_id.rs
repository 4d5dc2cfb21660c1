use crate::PacketId;
use std::sync::atomic::{AtomicU16, Ordering};

/// Generates packet identifiers for outgoing Publish, Subscribe and
/// Unsubscribe packets.
///
/// Identifiers start at 1 and count up to `u16::MAX - 1` before wrapping
/// back to 1. Zero is never produced. Safe to share between threads.
#[derive(Debug, Default)]
pub struct PacketIds {
	current: AtomicU16,
}

impl PacketIds {
	pub const fn new() -> Self {
		Self {
			current: AtomicU16::new(0),
		}
	}

	/// Returns the next packet identifier.
	pub fn next(&self) -> PacketId {
		let previous = self
			.current
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
				Some(Self::successor(id))
			})
			.unwrap_or_else(|id| id);

		PacketId::new(Self::successor(previous)).unwrap_or(PacketId::MIN)
	}

	#[inline]
	const fn successor(id: u16) -> u16 {
		if id >= u16::MAX - 1 {
			1
		} else {
			id + 1
		}
	}
}
