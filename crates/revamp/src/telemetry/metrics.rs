use std::sync::Mutex;
use std::time::Instant;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Process-wide counters. Every counter is registered with the Prometheus
/// registry and also read back for the JSON snapshot the internal API serves,
/// so the two views can never disagree.
pub struct Metrics {
	pub requests_total: Counter,
	pub requests_blocked: Counter,
	pub requests_errors: Counter,

	pub cache_hits: Counter,
	pub cache_misses: Counter,

	pub transforms_js: Counter,
	pub transforms_css: Counter,
	pub transforms_html: Counter,
	pub transforms_image: Counter,
	pub transforms_failed: Counter,

	pub bytes_in: Counter,
	pub bytes_out: Counter,

	pub connections_socks5: Counter,
	pub connections_http: Counter,
	pub connections_active: Gauge,

	pub mitm_connections: Counter,
	pub spliced_tunnels: Counter,

	started: Instant,
	registry: Mutex<Registry>,
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let mut build = |name: &str, help: &str| {
			let m = Counter::default();
			registry.register(name, help, m.clone());
			m
		};
		let requests_total = build("requests", "Requests entering the lifecycle controller");
		let requests_blocked = build("requests_blocked", "Requests blocked by filter rules or hooks");
		let requests_errors = build("requests_errors", "Requests that failed with an upstream error");
		let cache_hits = build("cache_hits", "Transformation cache hits");
		let cache_misses = build("cache_misses", "Transformation cache misses");
		let transforms_js = build("transforms_js", "JavaScript bodies transformed");
		let transforms_css = build("transforms_css", "CSS bodies transformed");
		let transforms_html = build("transforms_html", "HTML bodies transformed");
		let transforms_image = build("transforms_image", "Images transcoded");
		let transforms_failed = build("transforms_failed", "Transformer invocations that failed");
		let bytes_in = build("bytes_in", "Raw upstream body bytes received");
		let bytes_out = build("bytes_out", "Bytes written to clients");
		let connections_socks5 = build("connections_socks5", "Accepted SOCKS5 connections");
		let connections_http = build("connections_http", "Accepted HTTP proxy connections");
		let mitm_connections = build("mitm_connections", "CONNECT tunnels terminated with MITM TLS");
		let spliced_tunnels = build("spliced_tunnels", "CONNECT tunnels spliced without inspection");
		let connections_active = Gauge::default();
		registry.register(
			"connections_active",
			"Connections currently open",
			connections_active.clone(),
		);
		Metrics {
			requests_total,
			requests_blocked,
			requests_errors,
			cache_hits,
			cache_misses,
			transforms_js,
			transforms_css,
			transforms_html,
			transforms_image,
			transforms_failed,
			bytes_in,
			bytes_out,
			connections_socks5,
			connections_http,
			connections_active,
			mitm_connections,
			spliced_tunnels,
			started: Instant::now(),
			registry: Mutex::new(registry),
		}
	}

	/// The JSON document served by `/__revamp__/metrics/json`. `savedBytes`
	/// may go negative when polyfills enlarge output.
	pub fn snapshot(&self) -> serde_json::Value {
		let bytes_in = self.bytes_in.get();
		let bytes_out = self.bytes_out.get();
		serde_json::json!({
			"requests": {
				"total": self.requests_total.get(),
				"blocked": self.requests_blocked.get(),
				"errors": self.requests_errors.get(),
			},
			"cache": {
				"hits": self.cache_hits.get(),
				"misses": self.cache_misses.get(),
			},
			"transforms": {
				"js": self.transforms_js.get(),
				"css": self.transforms_css.get(),
				"html": self.transforms_html.get(),
				"images": self.transforms_image.get(),
				"failed": self.transforms_failed.get(),
			},
			"bandwidth": {
				"totalBytesIn": bytes_in,
				"totalBytesOut": bytes_out,
				"savedBytes": bytes_in as i64 - bytes_out as i64,
			},
			"connections": {
				"socks5": self.connections_socks5.get(),
				"http": self.connections_http.get(),
				"active": self.connections_active.get(),
				"mitm": self.mitm_connections.get(),
				"spliced": self.spliced_tunnels.get(),
			},
			"uptimeSeconds": self.started.elapsed().as_secs(),
		})
	}

	/// Prometheus text exposition from the same registry.
	pub fn prometheus_text(&self) -> String {
		let mut out = String::new();
		let registry = self.registry.lock().expect("metrics registry poisoned");
		if let Err(e) = prometheus_client::encoding::text::encode(&mut out, &registry) {
			tracing::warn!(err = %e, "failed to encode prometheus metrics");
		}
		out
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_reflects_counters() {
		let m = Metrics::new();
		m.requests_total.inc();
		m.requests_total.inc();
		m.bytes_in.inc_by(100);
		m.bytes_out.inc_by(250);
		let snap = m.snapshot();
		assert_eq!(snap["requests"]["total"], 2);
		assert_eq!(snap["bandwidth"]["savedBytes"], -150);
	}

	#[test]
	fn prometheus_exposition_contains_counters() {
		let m = Metrics::new();
		m.cache_hits.inc();
		let text = m.prometheus_text();
		assert!(text.contains("cache_hits_total"));
	}
}
