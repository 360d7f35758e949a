use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod profile;
mod resolver;

pub use profile::{DomainProfile, ProfileStore, pattern_matches, pattern_specificity};
pub use resolver::{Resolved, Resolver};

/// The default User-Agent presented upstream when spoofing is on. Legacy
/// Safari UAs get many sites served broken or not at all; a current desktop
/// UA keeps upstream serving its modern variant, which we then transform.
pub const MODERN_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
	AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// The per-request effective configuration. Immutable once resolved; the
/// resolver produces a fresh value for every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
	pub transform_js: bool,
	pub transform_css: bool,
	pub transform_html: bool,
	pub inject_polyfills: bool,
	pub bundle_es_modules: bool,
	pub remove_ads: bool,
	pub remove_tracking: bool,
	pub emulate_service_workers: bool,
	pub remote_service_workers: bool,
	pub spoof_user_agent: bool,
	pub spoof_user_agent_in_js: bool,
	pub cache_enabled: bool,
	pub socks5_port: u16,
	pub http_proxy_port: u16,
	pub captive_portal_port: u16,
	/// Browserslist-style target strings, e.g. `"safari 9"`.
	pub targets: Vec<String>,
	pub user_agent: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			transform_js: true,
			transform_css: true,
			transform_html: true,
			inject_polyfills: true,
			bundle_es_modules: true,
			remove_ads: true,
			remove_tracking: true,
			emulate_service_workers: true,
			remote_service_workers: false,
			spoof_user_agent: true,
			spoof_user_agent_in_js: false,
			cache_enabled: true,
			socks5_port: 1080,
			http_proxy_port: 8080,
			captive_portal_port: 8888,
			targets: vec!["safari 9".to_string(), "ios_saf 9".to_string()],
			user_agent: MODERN_USER_AGENT.to_string(),
		}
	}
}

impl Config {
	pub fn any_text_transform(&self) -> bool {
		self.transform_js || self.transform_css || self.transform_html
	}

	/// Whether the target list implies a browser without WebP/AVIF support.
	/// Safari gained WebP in 14; anything older needs transcoding.
	pub fn wants_legacy_images(&self) -> bool {
		self
			.targets
			.iter()
			.any(|t| target_is_legacy_for_images(t))
	}

	/// A CONNECT is worth terminating only when something downstream would
	/// actually rewrite the bytes.
	pub fn wants_mitm(&self) -> bool {
		self.any_text_transform() || self.wants_legacy_images()
	}
}

fn target_is_legacy_for_images(target: &str) -> bool {
	let mut parts = target.split_whitespace();
	let (Some(browser), Some(version)) = (parts.next(), parts.next()) else {
		return false;
	};
	let major: u32 = version
		.split('.')
		.next()
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	match browser.to_ascii_lowercase().as_str() {
		"safari" | "ios_saf" | "ios" => major < 14,
		"ie" => true,
		_ => false,
	}
}

/// A sparse overlay over `Config`: only present fields are applied. Used for
/// the persisted base overrides, domain profiles and API merge-updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PartialConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_js: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_css: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_html: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inject_polyfills: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bundle_es_modules: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_ads: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_tracking: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub emulate_service_workers: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_service_workers: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spoof_user_agent: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spoof_user_agent_in_js: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_enabled: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub socks5_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http_proxy_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub captive_portal_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub targets: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
}

macro_rules! apply_field {
	($self:ident, $cfg:ident, $($field:ident),* $(,)?) => {
		$(if let Some(v) = &$self.$field {
			$cfg.$field = v.clone();
		})*
	};
}

impl PartialConfig {
	pub fn apply(&self, cfg: &mut Config) {
		apply_field!(
			self,
			cfg,
			transform_js,
			transform_css,
			transform_html,
			inject_polyfills,
			bundle_es_modules,
			remove_ads,
			remove_tracking,
			emulate_service_workers,
			remote_service_workers,
			spoof_user_agent,
			spoof_user_agent_in_js,
			cache_enabled,
			socks5_port,
			http_proxy_port,
			captive_portal_port,
			targets,
			user_agent,
		);
	}

	/// Layer `other` on top of `self`: fields present in `other` win.
	pub fn merge(&mut self, other: &PartialConfig) {
		let mut as_value = serde_json::to_value(&*self).expect("partial config serializes");
		let other_value = serde_json::to_value(other).expect("partial config serializes");
		if let (Some(dst), Some(src)) = (as_value.as_object_mut(), other_value.as_object()) {
			for (k, v) in src {
				dst.insert(k.clone(), v.clone());
			}
		}
		*self = serde_json::from_value(as_value).expect("merged partial config deserializes");
	}

	pub fn is_empty(&self) -> bool {
		*self == PartialConfig::default()
	}
}

/// Application-level settings: everything that is fixed for the lifetime of
/// the process rather than resolved per request.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	pub base: Config,
	pub data_dir: PathBuf,
	pub plugins_dir: PathBuf,
	pub upstream_timeout: Duration,
	pub body_cap: usize,
	pub hook_timeout: Duration,
	pub memory_cache_budget: usize,
	pub disk_cache_budget: u64,
	pub cert_cache_capacity: usize,
	pub drain_grace: Duration,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		let data_dir = default_data_dir();
		RuntimeConfig {
			base: Config::default(),
			plugins_dir: data_dir.join("plugins"),
			data_dir,
			upstream_timeout: Duration::from_secs(30),
			body_cap: 32 * 1024 * 1024,
			hook_timeout: Duration::from_secs(5),
			memory_cache_budget: 64 * 1024 * 1024,
			disk_cache_budget: 512 * 1024 * 1024,
			cert_cache_capacity: 4096,
			drain_grace: Duration::from_secs(5),
		}
	}
}

pub fn default_data_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("REVAMP_DATA_DIR") {
		return PathBuf::from(dir);
	}
	if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
		return PathBuf::from(xdg).join("revamp");
	}
	PathBuf::from("./data")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_ports() {
		let cfg = Config::default();
		assert!(cfg.transform_js);
		assert_eq!(cfg.socks5_port, 1080);
		assert_eq!(cfg.http_proxy_port, 8080);
		assert_eq!(cfg.captive_portal_port, 8888);
	}

	#[test]
	fn partial_apply_overrides_only_present_fields() {
		let mut cfg = Config::default();
		let partial: PartialConfig =
			serde_json::from_str(r#"{"transformJs": false, "socks5Port": 1090}"#).unwrap();
		partial.apply(&mut cfg);
		assert!(!cfg.transform_js);
		assert_eq!(cfg.socks5_port, 1090);
		// Untouched fields keep their defaults.
		assert!(cfg.transform_css);
		assert_eq!(cfg.http_proxy_port, 8080);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		let res: Result<PartialConfig, _> = serde_json::from_str(r#"{"transformJsx": true}"#);
		assert!(res.is_err());
	}

	#[test]
	fn merge_prefers_newer_fields() {
		let mut a: PartialConfig = serde_json::from_str(r#"{"transformJs": false}"#).unwrap();
		let b: PartialConfig =
			serde_json::from_str(r#"{"transformJs": true, "removeAds": false}"#).unwrap();
		a.merge(&b);
		assert_eq!(a.transform_js, Some(true));
		assert_eq!(a.remove_ads, Some(false));
	}

	#[test]
	fn legacy_image_targets() {
		let mut cfg = Config::default();
		assert!(cfg.wants_legacy_images());
		cfg.targets = vec!["safari 17".to_string()];
		assert!(!cfg.wants_legacy_images());
		cfg.targets = vec!["chrome 120".to_string()];
		assert!(!cfg.wants_legacy_images());
	}

	#[test]
	fn serde_uses_camel_case() {
		let cfg = Config::default();
		let v = serde_json::to_value(&cfg).unwrap();
		assert!(v.get("transformJs").is_some());
		assert!(v.get("socks5Port").is_some());
	}
}
