use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use super::Fingerprint;

/// At-most-one concurrent computation per fingerprint. The first caller for
/// a key becomes the leader and performs the work; every later caller gets a
/// receiver to await the leader's published result. Insertion and completion
/// are serialized by one mutex.
pub struct SingleFlight<T> {
	inflight: Arc<Mutex<HashMap<Fingerprint, watch::Receiver<Option<T>>>>>,
}

impl<T> Default for SingleFlight<T> {
	fn default() -> Self {
		SingleFlight {
			inflight: Arc::new(Mutex::new(HashMap::new())),
		}
	}
}

pub enum Flight<T> {
	Leader(FlightLeader<T>),
	Follower(watch::Receiver<Option<T>>),
}

pub struct FlightLeader<T> {
	key: Fingerprint,
	tx: Option<watch::Sender<Option<T>>>,
	inflight: Arc<Mutex<HashMap<Fingerprint, watch::Receiver<Option<T>>>>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FlightWaitError {
	#[error("the leading request failed before publishing a result")]
	LeaderGone,
	#[error("timed out waiting for the leading request")]
	Timeout,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn begin(&self, key: Fingerprint) -> Flight<T> {
		let mut inflight = self.inflight.lock().expect("single flight poisoned");
		if let Some(rx) = inflight.get(&key) {
			return Flight::Follower(rx.clone());
		}
		let (tx, rx) = watch::channel(None);
		inflight.insert(key, rx);
		Flight::Leader(FlightLeader {
			key,
			tx: Some(tx),
			inflight: self.inflight.clone(),
		})
	}

	pub fn in_flight(&self) -> usize {
		self.inflight.lock().expect("single flight poisoned").len()
	}
}

impl<T: Clone> FlightLeader<T> {
	/// Publishes the result to every follower and retires the flight.
	pub fn publish(mut self, value: T) {
		self
			.inflight
			.lock()
			.expect("single flight poisoned")
			.remove(&self.key);
		if let Some(tx) = self.tx.take() {
			let _ = tx.send(Some(value));
		}
	}
}

impl<T> Drop for FlightLeader<T> {
	fn drop(&mut self) {
		// Leader died without publishing (cancelled connection, panic).
		// Retire the flight so the next request restarts the work; pending
		// followers observe the closed channel.
		if self.tx.is_some() {
			self
				.inflight
				.lock()
				.expect("single flight poisoned")
				.remove(&self.key);
		}
	}
}

/// Awaits the leader's result. The wait is bounded: the leader itself is
/// bounded by the upstream and transformer budgets, so a stuck flight means
/// a dead leader.
pub async fn wait<T: Clone>(
	mut rx: watch::Receiver<Option<T>>,
	budget: Duration,
) -> Result<T, FlightWaitError> {
	match tokio::time::timeout(budget, rx.wait_for(|v| v.is_some())).await {
		Ok(Ok(guard)) => Ok(guard.clone().expect("checked is_some")),
		Ok(Err(_)) => Err(FlightWaitError::LeaderGone),
		Err(_) => Err(FlightWaitError::Timeout),
	}
}
