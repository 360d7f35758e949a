use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::{Config, DomainProfile, PartialConfig, ProfileStore};
use crate::hooks::{ChainOutcome, HookPoint, HookRegistry};
use crate::store::{self, Store};

/// The outcome of config resolution for one request. Immutable; dropped with
/// the request.
#[derive(Debug, Clone)]
pub struct Resolved {
	pub config: Arc<Config>,
	pub matched_profile: Option<String>,
}

/// Resolves the effective config for `(client_ip, hostname)`:
/// defaults → persisted base overrides → winning domain profile →
/// `config:resolution` hook chain. The pure part (`resolve`) is deterministic
/// given stable inputs; hook output may depend on time, so results are never
/// reused across requests.
pub struct Resolver {
	defaults: Config,
	overrides: RwLock<PartialConfig>,
	base: RwLock<Arc<Config>>,
	pub profiles: ProfileStore,
	store: Store,
}

impl Resolver {
	pub fn load(store: Store, defaults: Config) -> Self {
		let overrides: PartialConfig = store.load_json(store::CONFIG_FILE).unwrap_or_default();
		let mut base = defaults.clone();
		overrides.apply(&mut base);
		let profiles: Vec<DomainProfile> = store.load_json(store::DOMAINS_FILE).unwrap_or_default();
		Resolver {
			defaults,
			overrides: RwLock::new(overrides),
			base: RwLock::new(Arc::new(base)),
			profiles: ProfileStore::new(profiles),
			store,
		}
	}

	pub fn base(&self) -> Arc<Config> {
		self.base.read().expect("resolver poisoned").clone()
	}

	/// Merge-update the base config and persist the accumulated overrides.
	pub fn update_base(&self, partial: &PartialConfig) -> anyhow::Result<Arc<Config>> {
		let merged = {
			let mut overrides = self.overrides.write().expect("resolver poisoned");
			overrides.merge(partial);
			overrides.clone()
		};
		let mut next = self.defaults.clone();
		merged.apply(&mut next);
		let next = Arc::new(next);
		*self.base.write().expect("resolver poisoned") = next.clone();
		self.store.save_json(store::CONFIG_FILE, &merged)?;
		Ok(next)
	}

	/// Reset the base config to compiled-in defaults.
	pub fn reset_base(&self) -> anyhow::Result<Arc<Config>> {
		*self.overrides.write().expect("resolver poisoned") = PartialConfig::default();
		let next = Arc::new(self.defaults.clone());
		*self.base.write().expect("resolver poisoned") = next.clone();
		self.store.save_json(store::CONFIG_FILE, &PartialConfig::default())?;
		Ok(next)
	}

	pub fn upsert_profile(&self, profile: DomainProfile) -> anyhow::Result<()> {
		self.profiles.upsert(profile);
		self.persist_profiles()
	}

	pub fn remove_profile(&self, id: &str) -> anyhow::Result<bool> {
		let removed = self.profiles.remove(id);
		if removed {
			self.persist_profiles()?;
		}
		Ok(removed)
	}

	fn persist_profiles(&self) -> anyhow::Result<()> {
		let snap = self.profiles.snapshot();
		self.store.save_json(store::DOMAINS_FILE, snap.as_ref())
	}

	/// The deterministic part: base + winning domain profile.
	pub fn resolve(&self, hostname: Option<&str>) -> (Config, Option<String>) {
		let mut cfg = (*self.base()).clone();
		let matched = hostname.and_then(|h| self.profiles.select(h));
		let matched_id = matched.as_ref().map(|p| p.id.clone());
		if let Some(profile) = matched {
			profile.config.apply(&mut cfg);
		}
		(cfg, matched_id)
	}

	/// Full resolution including the `config:resolution` hook chain. Hooks
	/// see the accumulated config under the payload's `config` key and may
	/// shallow-merge additional overrides; a `stop` freezes the config at
	/// that point.
	pub async fn resolve_with_hooks(
		&self,
		hooks: &HookRegistry,
		client_ip: IpAddr,
		hostname: Option<&str>,
	) -> Resolved {
		let (cfg, matched_profile) = self.resolve(hostname);
		if hooks.is_empty(HookPoint::ConfigResolution) {
			return Resolved {
				config: Arc::new(cfg),
				matched_profile,
			};
		}
		let payload = serde_json::json!({
			"clientIp": client_ip.to_string(),
			"hostname": hostname,
			"config": serde_json::to_value(&cfg).expect("config serializes"),
		});
		let final_payload = match hooks.run_chain(HookPoint::ConfigResolution, payload).await {
			ChainOutcome::Completed(p) | ChainOutcome::Stopped(p) => p,
			ChainOutcome::Failed(err) => {
				warn!(err, "config resolution hook chain failed, using unhooked config");
				return Resolved {
					config: Arc::new(cfg),
					matched_profile,
				};
			},
		};
		let config = match serde_json::from_value::<Config>(final_payload["config"].clone()) {
			Ok(c) => c,
			Err(e) => {
				warn!(err = %e, "config resolution hooks produced an invalid config, ignoring");
				cfg
			},
		};
		Resolved {
			config: Arc::new(config),
			matched_profile,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn resolver_with(profiles: Vec<DomainProfile>) -> Resolver {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		let r = Resolver::load(store, Config::default());
		for p in profiles {
			r.upsert_profile(p).unwrap();
		}
		// Leak the tempdir so the store path stays valid for the test body.
		std::mem::forget(dir);
		r
	}

	fn profile(id: &str, pattern: &str, priority: i32, config: &str) -> DomainProfile {
		DomainProfile {
			id: id.to_string(),
			patterns: vec![pattern.to_string()],
			config: serde_json::from_str(config).unwrap(),
			priority,
		}
	}

	#[test]
	fn resolution_is_pure() {
		let r = resolver_with(vec![profile(
			"ex",
			"*.example.com",
			0,
			r#"{"transformJs": false}"#,
		)]);
		let (a, matched_a) = r.resolve(Some("www.example.com"));
		let (b, matched_b) = r.resolve(Some("www.example.com"));
		assert_eq!(a, b);
		assert_eq!(matched_a, matched_b);
		assert_eq!(matched_a.as_deref(), Some("ex"));
		assert!(!a.transform_js);
	}

	#[test]
	fn profile_overrides_apply_on_match_only() {
		let r = resolver_with(vec![profile(
			"ex",
			"*.example.com",
			0,
			r#"{"removeAds": false}"#,
		)]);
		let (matched, _) = r.resolve(Some("cdn.example.com"));
		assert!(!matched.remove_ads);
		let (unmatched, id) = r.resolve(Some("other.net"));
		assert!(unmatched.remove_ads);
		assert!(id.is_none());
	}

	#[test]
	fn base_update_and_reset_round_trip() {
		let r = resolver_with(vec![]);
		let partial: PartialConfig = serde_json::from_str(r#"{"transformJs": false}"#).unwrap();
		let updated = r.update_base(&partial).unwrap();
		assert!(!updated.transform_js);
		let reset = r.reset_base().unwrap();
		assert!(reset.transform_js);
	}

	#[test]
	fn overrides_survive_reload() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		{
			let r = Resolver::load(store.clone(), Config::default());
			let partial: PartialConfig = serde_json::from_str(r#"{"spoofUserAgent": false}"#).unwrap();
			r.update_base(&partial).unwrap();
		}
		let r = Resolver::load(store, Config::default());
		assert!(!r.base().spoof_user_agent);
	}
}
