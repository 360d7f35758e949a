use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use revamp::config::{Config, RuntimeConfig, default_data_dir};
use revamp_core::version::BuildInfo;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "revamp", about = "Intercepting proxy that makes the modern web usable from legacy browsers", long_about = None)]
struct Args {
	/// SOCKS5 listener port
	#[arg(long, default_value_t = 1080)]
	socks5_port: u16,

	/// HTTP proxy listener port
	#[arg(long, default_value_t = 8080)]
	http_proxy_port: u16,

	/// Captive portal / dashboard port
	#[arg(long, default_value_t = 8888)]
	captive_portal_port: u16,

	/// Data directory (defaults to $XDG_DATA_HOME/revamp or ./data)
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Plugins directory (defaults to <data-dir>/plugins)
	#[arg(long)]
	plugins_dir: Option<PathBuf>,

	/// Disable JavaScript transformation
	#[arg(long)]
	no_transform_js: bool,

	/// Disable CSS transformation
	#[arg(long)]
	no_transform_css: bool,

	/// Disable HTML transformation
	#[arg(long)]
	no_transform_html: bool,

	/// Disable polyfill injection
	#[arg(long)]
	no_polyfills: bool,

	/// Disable the ad blocker
	#[arg(long)]
	no_remove_ads: bool,

	/// Disable tracking protection
	#[arg(long)]
	no_remove_tracking: bool,

	/// Disable the transformation cache
	#[arg(long)]
	no_cache: bool,

	/// Disable User-Agent spoofing
	#[arg(long)]
	no_spoof_user_agent: bool,

	/// Browserslist-style targets, repeatable (e.g. --target "safari 9")
	#[arg(long = "target")]
	targets: Vec<String>,

	/// User-Agent presented upstream when spoofing
	#[arg(long)]
	user_agent: Option<String>,

	/// Print version and exit
	#[arg(short = 'V', long)]
	version: bool,
}

fn main() -> ExitCode {
	revamp::telemetry::log::setup_logging();

	let args = Args::parse();
	if args.version {
		println!("{}", BuildInfo::new());
		return ExitCode::SUCCESS;
	}

	let mut base = Config {
		socks5_port: args.socks5_port,
		http_proxy_port: args.http_proxy_port,
		captive_portal_port: args.captive_portal_port,
		..Config::default()
	};
	base.transform_js = !args.no_transform_js;
	base.transform_css = !args.no_transform_css;
	base.transform_html = !args.no_transform_html;
	base.inject_polyfills = !args.no_polyfills;
	base.remove_ads = !args.no_remove_ads;
	base.remove_tracking = !args.no_remove_tracking;
	base.cache_enabled = !args.no_cache;
	base.spoof_user_agent = !args.no_spoof_user_agent;
	if !args.targets.is_empty() {
		base.targets = args.targets.clone();
	}
	if let Some(ua) = args.user_agent.clone() {
		base.user_agent = ua;
	}

	let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
	let cfg = RuntimeConfig {
		base,
		plugins_dir: args.plugins_dir.unwrap_or_else(|| data_dir.join("plugins")),
		data_dir,
		..RuntimeConfig::default()
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			error!(err = %e, "failed to build runtime");
			return ExitCode::from(1);
		},
	};
	runtime.block_on(async move {
		info!("{}", BuildInfo::new());
		let bound = match revamp::app::run(cfg).await {
			Ok(bound) => bound,
			Err(e) => {
				// Bind errors and CA failures are startup failures.
				error!(err = format!("{e:#}"), "startup failed");
				return ExitCode::from(1);
			},
		};
		match bound.wait_termination().await {
			Ok(()) => ExitCode::SUCCESS,
			Err(e) => {
				error!(err = format!("{e:#}"), "fatal error");
				ExitCode::from(2)
			},
		}
	})
}
