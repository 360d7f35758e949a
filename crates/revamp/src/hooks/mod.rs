use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use revamp_core::prelude::*;
use serde_json::Value;

/// The closed set of extension points. Chain hooks run sequentially and can
/// alter the request path; notification hooks are observational and run
/// fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
	RequestPre,
	ResponsePost,
	TransformPre,
	TransformPost,
	FilterDecision,
	ConfigResolution,
	CacheGet,
	CacheSet,
	DomainLifecycle,
	MetricsRecord,
}

impl HookPoint {
	pub fn as_str(&self) -> &'static str {
		match self {
			HookPoint::RequestPre => "request:pre",
			HookPoint::ResponsePost => "response:post",
			HookPoint::TransformPre => "transform:pre",
			HookPoint::TransformPost => "transform:post",
			HookPoint::FilterDecision => "filter:decision",
			HookPoint::ConfigResolution => "config:resolution",
			HookPoint::CacheGet => "cache:get",
			HookPoint::CacheSet => "cache:set",
			HookPoint::DomainLifecycle => "domain:lifecycle",
			HookPoint::MetricsRecord => "metrics:record",
		}
	}

	pub fn parse(s: &str) -> Option<HookPoint> {
		Self::all().iter().copied().find(|p| p.as_str() == s)
	}

	pub fn all() -> &'static [HookPoint] {
		&[
			HookPoint::RequestPre,
			HookPoint::ResponsePost,
			HookPoint::TransformPre,
			HookPoint::TransformPost,
			HookPoint::FilterDecision,
			HookPoint::ConfigResolution,
			HookPoint::CacheGet,
			HookPoint::CacheSet,
			HookPoint::DomainLifecycle,
			HookPoint::MetricsRecord,
		]
	}

	/// Notification hooks may not modify state visible to the lifecycle, so
	/// they run in parallel and their results are discarded.
	pub fn is_notification(&self) -> bool {
		matches!(
			self,
			HookPoint::CacheSet | HookPoint::DomainLifecycle | HookPoint::MetricsRecord
		)
	}
}

impl std::fmt::Display for HookPoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What a handler returns.
#[derive(Debug, Clone)]
pub enum HookVerdict {
	/// Merge the value (if any) into the accumulating payload and proceed.
	Continue(Option<Value>),
	/// Halt the chain, merging the value as the final word.
	Stop(Value),
	/// Halt the chain; the lifecycle step converts this to a 502.
	Error(String),
}

#[async_trait]
pub trait Handler: Send + Sync {
	async fn invoke(&self, point: HookPoint, payload: Value) -> HookVerdict;
}

/// The outcome of running a chain.
#[derive(Debug, Clone)]
pub enum ChainOutcome {
	/// All handlers ran (or none were registered); final merged payload.
	Completed(Value),
	/// A handler stopped the chain; payload includes its stop value.
	Stopped(Value),
	/// A handler returned an explicit error.
	Failed(String),
}

struct Registration {
	plugin_id: Strng,
	priority: i32,
	seq: u64,
	handler: Arc<dyn Handler>,
}

#[derive(Default, Debug)]
pub struct HookStats {
	pub count: AtomicU64,
	pub success: AtomicU64,
	pub fail: AtomicU64,
	pub timeouts: AtomicU64,
	pub total_micros: AtomicU64,
}

/// Priority-ordered hook registry. Registrations are kept pre-sorted and
/// handed out as immutable snapshots, so activating or deactivating a plugin
/// mid-request never disturbs a chain that is already executing.
pub struct HookRegistry {
	chains: RwLock<HashMap<HookPoint, Arc<Vec<Registration>>>>,
	stats: RwLock<HashMap<(Strng, HookPoint), Arc<HookStats>>>,
	seq: AtomicU64,
	timeout: Duration,
}

impl HookRegistry {
	pub fn new(timeout: Duration) -> Self {
		HookRegistry {
			chains: RwLock::new(HashMap::new()),
			stats: RwLock::new(HashMap::new()),
			seq: AtomicU64::new(0),
			timeout,
		}
	}

	pub fn register(
		&self,
		plugin_id: Strng,
		point: HookPoint,
		priority: i32,
		handler: Arc<dyn Handler>,
	) {
		let seq = self.seq.fetch_add(1, Ordering::Relaxed);
		let mut chains = self.chains.write().expect("hook registry poisoned");
		let current = chains.entry(point).or_insert_with(|| Arc::new(Vec::new()));
		let mut next: Vec<Registration> = current
			.iter()
			.map(|r| Registration {
				plugin_id: r.plugin_id.clone(),
				priority: r.priority,
				seq: r.seq,
				handler: r.handler.clone(),
			})
			.collect();
		next.push(Registration {
			plugin_id,
			priority,
			seq,
			handler,
		});
		// Execution order: descending priority, ties by registration order.
		next.sort_by_key(|r| (std::cmp::Reverse(r.priority), r.seq));
		*current = Arc::new(next);
	}

	pub fn unregister_plugin(&self, plugin_id: &str) {
		let mut chains = self.chains.write().expect("hook registry poisoned");
		for regs in chains.values_mut() {
			if regs.iter().any(|r| r.plugin_id.as_str() == plugin_id) {
				let next: Vec<Registration> = regs
					.iter()
					.filter(|r| r.plugin_id.as_str() != plugin_id)
					.map(|r| Registration {
						plugin_id: r.plugin_id.clone(),
						priority: r.priority,
						seq: r.seq,
						handler: r.handler.clone(),
					})
					.collect();
				*regs = Arc::new(next);
			}
		}
	}

	pub fn is_empty(&self, point: HookPoint) -> bool {
		self
			.chains
			.read()
			.expect("hook registry poisoned")
			.get(&point)
			.map(|r| r.is_empty())
			.unwrap_or(true)
	}

	fn snapshot(&self, point: HookPoint) -> Arc<Vec<Registration>> {
		self
			.chains
			.read()
			.expect("hook registry poisoned")
			.get(&point)
			.cloned()
			.unwrap_or_default()
	}

	fn stats_for(&self, plugin_id: &Strng, point: HookPoint) -> Arc<HookStats> {
		{
			let stats = self.stats.read().expect("hook registry poisoned");
			if let Some(s) = stats.get(&(plugin_id.clone(), point)) {
				return s.clone();
			}
		}
		let mut stats = self.stats.write().expect("hook registry poisoned");
		stats
			.entry((plugin_id.clone(), point))
			.or_insert_with(|| Arc::new(HookStats::default()))
			.clone()
	}

	/// Run a chain hook sequentially in priority order. Each invocation is
	/// bounded by the configured timeout; a timed-out or panicking handler is
	/// recorded and the chain proceeds. `Stop` halts the chain, `Error` fails
	/// it.
	pub async fn run_chain(&self, point: HookPoint, mut payload: Value) -> ChainOutcome {
		debug_assert!(!point.is_notification());
		let regs = self.snapshot(point);
		for reg in regs.iter() {
			let stats = self.stats_for(&reg.plugin_id, point);
			stats.count.fetch_add(1, Ordering::Relaxed);
			let started = Instant::now();
			let outcome = self.invoke_guarded(reg.handler.clone(), point, payload.clone()).await;
			stats
				.total_micros
				.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
			match outcome {
				Invocation::Done(HookVerdict::Continue(value)) => {
					stats.success.fetch_add(1, Ordering::Relaxed);
					if let Some(v) = value {
						merge_payload(&mut payload, v);
					}
				},
				Invocation::Done(HookVerdict::Stop(value)) => {
					stats.success.fetch_add(1, Ordering::Relaxed);
					merge_payload(&mut payload, value);
					return ChainOutcome::Stopped(payload);
				},
				Invocation::Done(HookVerdict::Error(err)) => {
					stats.fail.fetch_add(1, Ordering::Relaxed);
					warn!(plugin = %reg.plugin_id, hook = %point, err, "hook returned error");
					return ChainOutcome::Failed(err);
				},
				Invocation::TimedOut => {
					stats.timeouts.fetch_add(1, Ordering::Relaxed);
					warn!(plugin = %reg.plugin_id, hook = %point, "hook timed out, continuing chain");
				},
				Invocation::Panicked(msg) => {
					stats.fail.fetch_add(1, Ordering::Relaxed);
					warn!(plugin = %reg.plugin_id, hook = %point, msg, "hook panicked, continuing chain");
				},
			}
		}
		ChainOutcome::Completed(payload)
	}

	/// Fire a notification hook: every handler runs concurrently, results
	/// are recorded in the stats and discarded.
	pub fn notify(self: &Arc<Self>, point: HookPoint, payload: Value) {
		debug_assert!(point.is_notification());
		let regs = self.snapshot(point);
		for reg in regs.iter() {
			let this = self.clone();
			let handler = reg.handler.clone();
			let plugin_id = reg.plugin_id.clone();
			let payload = payload.clone();
			tokio::spawn(async move {
				let stats = this.stats_for(&plugin_id, point);
				stats.count.fetch_add(1, Ordering::Relaxed);
				let started = Instant::now();
				match this.invoke_guarded(handler, point, payload).await {
					Invocation::Done(HookVerdict::Error(err)) => {
						stats.fail.fetch_add(1, Ordering::Relaxed);
						debug!(plugin = %plugin_id, hook = %point, err, "notification hook error");
					},
					Invocation::Done(_) => {
						stats.success.fetch_add(1, Ordering::Relaxed);
					},
					Invocation::TimedOut => {
						stats.timeouts.fetch_add(1, Ordering::Relaxed);
					},
					Invocation::Panicked(msg) => {
						stats.fail.fetch_add(1, Ordering::Relaxed);
						debug!(plugin = %plugin_id, hook = %point, msg, "notification hook panicked");
					},
				}
				stats
					.total_micros
					.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
			});
		}
	}

	async fn invoke_guarded(
		&self,
		handler: Arc<dyn Handler>,
		point: HookPoint,
		payload: Value,
	) -> Invocation {
		// Spawned so a panicking handler surfaces as a JoinError instead of
		// unwinding through the request task.
		let task = tokio::spawn(async move { handler.invoke(point, payload).await });
		match tokio::time::timeout(self.timeout, task).await {
			Ok(Ok(verdict)) => Invocation::Done(verdict),
			Ok(Err(join_err)) => Invocation::Panicked(join_err.to_string()),
			Err(_) => Invocation::TimedOut,
		}
	}

	/// Per-plugin, per-hook statistics for the internal API.
	pub fn stats_snapshot(&self) -> Value {
		let stats = self.stats.read().expect("hook registry poisoned");
		let mut by_plugin: HashMap<&str, serde_json::Map<String, Value>> = HashMap::new();
		for ((plugin, point), s) in stats.iter() {
			let count = s.count.load(Ordering::Relaxed);
			let avg_ms = if count == 0 {
				0.0
			} else {
				s.total_micros.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
			};
			by_plugin.entry(plugin.as_str()).or_default().insert(
				point.as_str().to_string(),
				serde_json::json!({
					"count": count,
					"success": s.success.load(Ordering::Relaxed),
					"fail": s.fail.load(Ordering::Relaxed),
					"timeouts": s.timeouts.load(Ordering::Relaxed),
					"avgDurationMs": avg_ms,
				}),
			);
		}
		Value::Object(
			by_plugin
				.into_iter()
				.map(|(k, v)| (k.to_string(), Value::Object(v)))
				.collect(),
		)
	}
}

/// Shallow merge with one extra level for object-valued keys, so a handler
/// returning `{"config": {"transformJs": false}}` refines the accumulated
/// config instead of replacing it.
pub fn merge_payload(payload: &mut Value, incoming: Value) {
	let Value::Object(src) = incoming else {
		payload["value"] = incoming;
		return;
	};
	if !payload.is_object() {
		*payload = Value::Object(serde_json::Map::new());
	}
	let dst = payload.as_object_mut().expect("just ensured object");
	for (k, v) in src {
		match v {
			Value::Object(new) if matches!(dst.get(&k), Some(Value::Object(_))) => {
				if let Some(Value::Object(existing)) = dst.get_mut(&k) {
					for (k2, v2) in new {
						existing.insert(k2, v2);
					}
				}
			},
			v => {
				dst.insert(k, v);
			},
		}
	}
}

enum Invocation {
	Done(HookVerdict),
	TimedOut,
	Panicked(String),
}
