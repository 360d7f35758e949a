use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use std::time::Duration;

/// Constructs a new pair for draining.
/// * `DrainTrigger` starts a draining sequence and waits for it to complete.
/// * `DrainWatcher` should be held by anything that wants to participate in
///   draining. It can be cloned; a drain does not complete until every
///   outstanding watcher has been dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None);
	let (drained_tx, drained_rx) = mpsc::channel::<Never>(1);
	(
		DrainTrigger {
			drained_rx,
			signal_tx,
		},
		DrainWatcher {
			drained_tx,
			signal_rx,
		},
	)
}

enum Never {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	Immediate,
	Graceful,
}

/// Sends the drain command to all watchers.
pub struct DrainTrigger {
	drained_rx: mpsc::Receiver<Never>,
	signal_tx: watch::Sender<Option<DrainMode>>,
}

impl DrainTrigger {
	/// Signals all watchers to begin draining and waits for every watcher
	/// handle to be dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(Some(mode));
		match self.drained_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}

	/// Like `start_drain_and_wait`, but gives watchers at most `deadline` to
	/// finish before returning anyway.
	pub async fn start_drain_with_deadline(self, mode: DrainMode, deadline: Duration) {
		if tokio::time::timeout(deadline, self.start_drain_and_wait(mode))
			.await
			.is_err()
		{
			warn!(
				"drain deadline of {:?} expired with connections still active, shutting down anyway",
				deadline
			);
		} else {
			info!("drain complete");
		}
	}
}

/// Watches for a drain command.
#[derive(Clone)]
pub struct DrainWatcher {
	drained_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<Option<DrainMode>>,
}

impl DrainWatcher {
	/// Completes once a drain has been signaled. The returned guard must be
	/// dropped when the holder has finished shutting down; the trigger side
	/// blocks until all guards (and watchers) are gone.
	pub async fn wait_for_drain(mut self) -> DrainGuard {
		let mode = self
			.signal_rx
			.wait_for(Option::is_some)
			.await
			.map(|v| v.expect("checked is_some"))
			// The trigger was dropped without draining; treat it as immediate.
			.unwrap_or(DrainMode::Immediate);
		debug!(?mode, "drain signaled");
		DrainGuard(self.drained_tx, mode)
	}
}

#[must_use = "dropping the guard releases the drain; hold it until cleanup is done"]
pub struct DrainGuard(mpsc::Sender<Never>, DrainMode);

impl DrainGuard {
	pub fn mode(&self) -> DrainMode {
		self.1
	}
}

impl std::fmt::Debug for DrainTrigger {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainTrigger").finish_non_exhaustive()
	}
}

impl std::fmt::Debug for DrainWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DrainWatcher").finish_non_exhaustive()
	}
}
