use crate::transport::{Cancel, Scheduler};
use std::time::Duration;
use tokio::{
	runtime::Handle,
	task::JoinHandle,
	time::{self, Instant, MissedTickBehavior},
};

/// Runs repeating callbacks as tasks on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
	runtime: Handle,
}

impl TokioScheduler {
	pub fn new(runtime: Handle) -> Self {
		Self { runtime }
	}

	/// Uses the runtime of the current context.
	///
	/// # Panics
	///
	/// Panics if called outside of a tokio runtime.
	pub fn current() -> Self {
		Self::new(Handle::current())
	}
}

impl Scheduler for TokioScheduler {
	fn schedule_repeating(
		&self,
		interval: Duration,
		mut callback: Box<dyn FnMut() + Send>,
	) -> Box<dyn Cancel> {
		let task = self.runtime.spawn(async move {
			let mut ticker = time::interval_at(Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				callback();
			}
		});
		Box::new(TaskHandle(task))
	}
}

/// Aborts the task when cancelled.
struct TaskHandle(JoinHandle<()>);

impl Cancel for TaskHandle {
	fn cancel(&mut self) {
		self.0.abort();
	}
}
