use std::net::IpAddr;
use std::sync::Arc;

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod fetch;
pub mod filter;
pub mod hooks;
pub mod http;
pub mod plugins;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod tls;
pub mod transform;

pub use config::{Config, RuntimeConfig};

/// Everything a request needs, owned by the proxy root and shared by the
/// frontends. There is no module-scope mutable state: caches, registries and
/// counters all live here.
pub struct ProxyInputs {
	pub cfg: Arc<RuntimeConfig>,
	pub resolver: config::Resolver,
	pub store: store::Store,
	pub cache: cache::TransformCache,
	pub redirects: cache::RedirectSet,
	pub flights: cache::SingleFlight<proxy::lifecycle::FlightResult>,
	pub ca: Arc<tls::CertAuthority>,
	pub certs: Arc<tls::CertFactory>,
	pub fetch: Arc<fetch::UpstreamClient>,
	pub hooks: Arc<hooks::HookRegistry>,
	pub plugins: plugins::PluginManager,
	pub transformers: transform::Transformers,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	/// The address PAC files hand to clients.
	pub local_ip: IpAddr,
}

impl ProxyInputs {
	/// Whether `host` names the proxy machine (reserved hostname, loopback,
	/// or our advertised address).
	pub fn is_self_host(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		if host == "localhost" || host == "revamp.local" || host == "revamp" {
			return true;
		}
		match host.parse::<IpAddr>() {
			Ok(ip) => ip.is_loopback() || ip == self.local_ip,
			Err(_) => false,
		}
	}

	/// Whether a CONNECT target means the proxy's own API, i.e. internal
	/// traffic that must never be dialed upstream. Reserved hostnames always
	/// qualify; plain local addresses qualify only on the proxy's own service
	/// ports, so tunnels to other local services still splice through.
	pub fn is_self_target(&self, host: &str, port: u16) -> bool {
		let lowered = host.to_ascii_lowercase();
		if lowered == "revamp.local" || lowered == "revamp" {
			return true;
		}
		if !self.is_self_host(&lowered) {
			return false;
		}
		let base = self.resolver.base();
		port == base.http_proxy_port || port == base.captive_portal_port
	}
}
