use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use revamp_core::prelude::*;
use revamp_core::{drain, signal};
use tokio::net::TcpListener;

use crate::config::RuntimeConfig;
use crate::telemetry::metrics::Metrics;
use crate::transform::bundler::FetchBundler;
use crate::transform::Transformers;
use crate::{ProxyInputs, cache, config, fetch, plugins, proxy, store, tls};

/// Builds the whole proxy and binds its listeners. Startup failures (bind
/// errors, CA initialization) are fatal and surface as `Err`.
pub async fn run(cfg: RuntimeConfig) -> anyhow::Result<Bound> {
	let cfg = Arc::new(cfg);
	let store = store::Store::new(&cfg.data_dir).context("opening data directory")?;

	let ca = Arc::new(tls::CertAuthority::load_or_create(&store).context("initializing root CA")?);
	let certs = tls::CertFactory::new(ca.clone(), cfg.cert_cache_capacity);

	let metrics = Arc::new(Metrics::new());
	let fetch = Arc::new(
		fetch::UpstreamClient::new(cfg.upstream_timeout, cfg.body_cap, metrics.clone())
			.context("building upstream client")?,
	);

	let resolver = config::Resolver::load(store.clone(), cfg.base.clone());
	let cache = cache::TransformCache::open(
		cfg.data_dir.join("cache"),
		cfg.memory_cache_budget,
		cfg.disk_cache_budget,
	)
	.context("opening transformation cache")?;

	let hooks = Arc::new(crate::hooks::HookRegistry::new(cfg.hook_timeout));
	let plugins = plugins::PluginManager::new(
		store.clone(),
		hooks.clone(),
		cfg.plugins_dir.display().to_string(),
	);
	plugins.load_persisted();

	let base = resolver.base();
	let transformers = {
		let defaults = Transformers::passthrough();
		Transformers {
			bundler: Arc::new(FetchBundler::new(
				fetch.clone(),
				defaults.text.clone(),
				(*base).clone(),
			)),
			..defaults
		}
	};

	let local_ip = local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

	let inputs = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		resolver,
		store,
		cache,
		redirects: cache::RedirectSet::new(),
		flights: cache::SingleFlight::new(),
		ca,
		certs,
		fetch,
		hooks,
		plugins,
		transformers,
		metrics,
		local_ip,
	});

	let bind = |port: u16| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
	let socks5 = TcpListener::bind(bind(base.socks5_port))
		.await
		.with_context(|| format!("binding SOCKS5 port {}", base.socks5_port))?;
	let http = TcpListener::bind(bind(base.http_proxy_port))
		.await
		.with_context(|| format!("binding HTTP proxy port {}", base.http_proxy_port))?;
	let captive = TcpListener::bind(bind(base.captive_portal_port))
		.await
		.with_context(|| format!("binding captive portal port {}", base.captive_portal_port))?;

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	tokio::spawn(proxy::socks5::serve(socks5, inputs.clone(), drain_rx.clone()));
	tokio::spawn(proxy::httpproxy::serve(http, inputs.clone(), drain_rx.clone()));
	tokio::spawn(proxy::httpproxy::serve_captive(
		captive,
		inputs.clone(),
		drain_rx.clone(),
	));
	drop(drain_rx);

	info!(
		socks5 = base.socks5_port,
		http = base.http_proxy_port,
		captive = base.captive_portal_port,
		local_ip = %local_ip,
		data_dir = %cfg.data_dir.display(),
		"revamp is up"
	);

	Ok(Bound {
		shutdown,
		drain_tx,
		grace: cfg.drain_grace,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
	grace: Duration,
}

impl Bound {
	/// Blocks until a shutdown is requested, then drains connections inside
	/// the grace window.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self
			.drain_tx
			.start_drain_with_deadline(drain::DrainMode::Graceful, self.grace)
			.await;
		Ok(())
	}
}
