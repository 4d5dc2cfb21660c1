use crate::transport::{Cancel, Scheduler};
use core::fmt;
use std::time::Duration;

/// A scheduled keep-alive timer. Dropping it cancels the timer.
pub(crate) struct KeepAlive {
	interval: Duration,
	handle: Box<dyn Cancel>,
}

impl KeepAlive {
	pub fn start(
		scheduler: &dyn Scheduler,
		interval: Duration,
		callback: Box<dyn FnMut() + Send>,
	) -> Self {
		tracing::debug!(?interval, "starting keep-alive timer");
		Self {
			interval,
			handle: scheduler.schedule_repeating(interval, callback),
		}
	}
}

impl Drop for KeepAlive {
	fn drop(&mut self) {
		tracing::debug!(interval = ?self.interval, "cancelling keep-alive timer");
		self.handle.cancel();
	}
}

impl fmt::Debug for KeepAlive {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeepAlive")
			.field("interval", &self.interval)
			.finish_non_exhaustive()
	}
}
