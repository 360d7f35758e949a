use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use revamp::config::{Config, RuntimeConfig};
use revamp::telemetry::metrics::Metrics;
use revamp::transform::Transformers;
use revamp::transform::bundler::FetchBundler;
use revamp::{ProxyInputs, cache, config, fetch, plugins, proxy, store, tls};
use revamp_core::drain;
use tokio::net::TcpListener;

pub struct TestProxy {
	pub inputs: Arc<ProxyInputs>,
	pub http_addr: SocketAddr,
	pub captive_addr: SocketAddr,
	pub socks_addr: SocketAddr,
	pub data_dir: std::path::PathBuf,
	_tempdir: tempfile::TempDir,
}

impl TestProxy {
	pub fn captive_url(&self, path: &str) -> String {
		format!("http://{}{}", self.captive_addr, path)
	}

	pub fn http_proxy_url(&self) -> String {
		format!("http://{}", self.http_addr)
	}
}

/// Builds a full proxy on ephemeral ports with passthrough transformers and
/// a throwaway data directory.
pub async fn spawn_proxy() -> TestProxy {
	spawn_proxy_with(Config::default()).await
}

pub async fn spawn_proxy_with(base: Config) -> TestProxy {
	let tempdir = tempfile::tempdir().expect("tempdir");
	let data_dir = tempdir.path().to_path_buf();
	let cfg = Arc::new(RuntimeConfig {
		base: base.clone(),
		data_dir: data_dir.clone(),
		plugins_dir: data_dir.join("plugins"),
		upstream_timeout: Duration::from_secs(5),
		body_cap: 4 * 1024 * 1024,
		hook_timeout: Duration::from_millis(500),
		memory_cache_budget: 8 * 1024 * 1024,
		disk_cache_budget: 32 * 1024 * 1024,
		cert_cache_capacity: 64,
		drain_grace: Duration::from_millis(200),
	});

	let store = store::Store::new(&cfg.data_dir).expect("store");
	let ca = Arc::new(tls::CertAuthority::load_or_create(&store).expect("ca"));
	let certs = tls::CertFactory::new(ca.clone(), cfg.cert_cache_capacity);
	let metrics = Arc::new(Metrics::new());
	let fetch = Arc::new(
		fetch::UpstreamClient::new(cfg.upstream_timeout, cfg.body_cap, metrics.clone())
			.expect("upstream client"),
	);
	let resolver = config::Resolver::load(store.clone(), base);
	let cache = cache::TransformCache::open(
		cfg.data_dir.join("cache"),
		cfg.memory_cache_budget,
		cfg.disk_cache_budget,
	)
	.expect("cache");
	let hooks = Arc::new(revamp::hooks::HookRegistry::new(cfg.hook_timeout));
	let plugins = plugins::PluginManager::new(store.clone(), hooks.clone(), "plugins".into());
	let transformers = {
		let defaults = Transformers::passthrough();
		Transformers {
			bundler: Arc::new(FetchBundler::new(
				fetch.clone(),
				defaults.text.clone(),
				(*resolver.base()).clone(),
			)),
			..defaults
		}
	};

	let inputs = Arc::new(ProxyInputs {
		cfg,
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
		local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
	});

	let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
	let socks = TcpListener::bind(bind).await.expect("bind socks");
	let http = TcpListener::bind(bind).await.expect("bind http");
	let captive = TcpListener::bind(bind).await.expect("bind captive");
	let socks_addr = socks.local_addr().unwrap();
	let http_addr = http.local_addr().unwrap();
	let captive_addr = captive.local_addr().unwrap();

	let (drain_tx, drain_rx) = drain::new();
	std::mem::forget(drain_tx);
	tokio::spawn(proxy::socks5::serve(socks, inputs.clone(), drain_rx.clone()));
	tokio::spawn(proxy::httpproxy::serve(http, inputs.clone(), drain_rx.clone()));
	tokio::spawn(proxy::httpproxy::serve_captive(
		captive,
		inputs.clone(),
		drain_rx,
	));

	TestProxy {
		inputs,
		http_addr,
		captive_addr,
		socks_addr,
		data_dir,
		_tempdir: tempdir,
	}
}

/// Files currently present in the disk cache tier.
pub fn cache_files(proxy: &TestProxy) -> Vec<String> {
	std::fs::read_dir(proxy.data_dir.join("cache"))
		.map(|entries| {
			entries
				.filter_map(|e| e.ok())
				.map(|e| e.file_name().to_string_lossy().into_owned())
				.collect()
		})
		.unwrap_or_default()
}
