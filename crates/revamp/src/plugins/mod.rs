use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use revamp_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hooks::{Handler, HookPoint, HookRegistry};
use crate::store::{self, Store};

/// What a plugin declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
	pub id: String,
	pub version: String,
	pub main: String,
	#[serde(default)]
	pub permissions: Vec<String>,
	#[serde(default)]
	pub hooks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
	Loaded,
	Initialized,
	Active,
	Deactivated,
	Error,
}

#[derive(Debug, Clone)]
pub struct PluginRecord {
	pub manifest: PluginManifest,
	pub state: PluginState,
	pub error: Option<String>,
	pub config: Value,
	pub enabled: bool,
}

/// A hook a plugin wants installed while active.
pub struct HookRegistration {
	pub point: HookPoint,
	pub priority: i32,
	pub handler: Arc<dyn Handler>,
}

/// The bridge to the external plugin host runtime: given a manifest and its
/// config, produce the hook handlers to install. Without a factory attached,
/// lifecycle transitions still work but no hooks are registered.
pub trait HandlerFactory: Send + Sync {
	fn instantiate(
		&self,
		manifest: &PluginManifest,
		config: &Value,
	) -> anyhow::Result<Vec<HookRegistration>>;
}

/// An HTTP endpoint a plugin exposes under `/__revamp__/plugins/{id}/...`.
#[async_trait::async_trait]
pub trait PluginApiHandler: Send + Sync {
	async fn handle(&self, req: ::http::Request<bytes::Bytes>) -> crate::http::Response;
}

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
	#[error("plugin {0} not found")]
	NotFound(String),
	#[error("plugin {id}: cannot {action} while {state:?}")]
	InvalidTransition {
		id: String,
		action: &'static str,
		state: PluginState,
	},
	#[error("plugin {id} lifecycle error: {message}")]
	Lifecycle { id: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PersistedPlugins {
	enabled: bool,
	hot_reload: bool,
	plugins_dir: String,
	plugins: HashMap<String, PersistedPlugin>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PersistedPlugin {
	enabled: bool,
	config: Value,
}

/// Owns plugin records and their gated lifecycle. Transitions for one plugin
/// are serialized behind a per-plugin async mutex; a failing transition moves
/// that plugin to `Error` without disturbing the others.
pub struct PluginManager {
	plugins: RwLock<HashMap<Strng, Arc<AsyncMutex<PluginRecord>>>>,
	registry: Arc<HookRegistry>,
	factory: RwLock<Option<Arc<dyn HandlerFactory>>>,
	http_handlers: RwLock<HashMap<(Strng, String), Arc<dyn PluginApiHandler>>>,
	store: Store,
	plugins_dir: String,
}

impl PluginManager {
	pub fn new(store: Store, registry: Arc<HookRegistry>, plugins_dir: String) -> Self {
		PluginManager {
			plugins: RwLock::new(HashMap::new()),
			registry,
			factory: RwLock::new(None),
			http_handlers: RwLock::new(HashMap::new()),
			store,
			plugins_dir,
		}
	}

	/// Registers an HTTP sub-path for a plugin, reachable at
	/// `/__revamp__/plugins/{id}/{subpath}`.
	pub fn register_http_handler(
		&self,
		plugin_id: Strng,
		subpath: impl Into<String>,
		handler: Arc<dyn PluginApiHandler>,
	) {
		self
			.http_handlers
			.write()
			.expect("plugin manager poisoned")
			.insert((plugin_id, subpath.into()), handler);
	}

	pub fn http_handler(&self, plugin_id: &str, subpath: &str) -> Option<Arc<dyn PluginApiHandler>> {
		self
			.http_handlers
			.read()
			.expect("plugin manager poisoned")
			.get(&(strng::new(plugin_id), subpath.to_string()))
			.cloned()
	}

	/// Attach the external host runtime. Plugins activated afterwards get
	/// real handlers.
	pub fn set_factory(&self, factory: Arc<dyn HandlerFactory>) {
		*self.factory.write().expect("plugin manager poisoned") = Some(factory);
	}

	/// Restores records persisted in plugins.json (states start at Loaded;
	/// activation is explicit or host-driven).
	pub fn load_persisted(&self) {
		let Some(persisted) = self.store.load_json::<PersistedPlugins>(store::PLUGINS_FILE) else {
			return;
		};
		let mut plugins = self.plugins.write().expect("plugin manager poisoned");
		for (id, p) in persisted.plugins {
			let manifest = PluginManifest {
				id: id.clone(),
				version: String::new(),
				main: String::new(),
				permissions: Vec::new(),
				hooks: Vec::new(),
			};
			plugins.insert(
				strng::new(&id),
				Arc::new(AsyncMutex::new(PluginRecord {
					manifest,
					state: PluginState::Loaded,
					error: None,
					config: p.config,
					enabled: p.enabled,
				})),
			);
		}
		info!(count = plugins.len(), "restored plugin records");
	}

	fn persist(&self) {
		let plugins = self.plugins.read().expect("plugin manager poisoned");
		let mut out = PersistedPlugins {
			enabled: true,
			hot_reload: false,
			plugins_dir: self.plugins_dir.clone(),
			plugins: HashMap::new(),
		};
		for (id, record) in plugins.iter() {
			// Records mid-transition keep their last persisted view; the
			// next persist call catches up.
			if let Ok(r) = record.try_lock() {
				out.plugins.insert(
					id.to_string(),
					PersistedPlugin {
						enabled: r.enabled,
						config: r.config.clone(),
					},
				);
			}
		}
		if let Err(e) = self.store.save_json(store::PLUGINS_FILE, &out) {
			warn!(err = %e, "failed to persist plugin state");
		}
	}

	fn record(&self, id: &str) -> Result<Arc<AsyncMutex<PluginRecord>>, PluginError> {
		self
			.plugins
			.read()
			.expect("plugin manager poisoned")
			.get(&strng::new(id))
			.cloned()
			.ok_or_else(|| PluginError::NotFound(id.to_string()))
	}

	pub async fn load(&self, manifest: PluginManifest, config: Value) -> Result<(), PluginError> {
		for hook in &manifest.hooks {
			if HookPoint::parse(hook).is_none() {
				return Err(PluginError::Lifecycle {
					id: manifest.id.clone(),
					message: format!("unknown hook {hook}"),
				});
			}
		}
		let id = strng::new(&manifest.id);
		let record = Arc::new(AsyncMutex::new(PluginRecord {
			manifest,
			state: PluginState::Loaded,
			error: None,
			config,
			enabled: true,
		}));
		self
			.plugins
			.write()
			.expect("plugin manager poisoned")
			.insert(id, record);
		self.persist();
		Ok(())
	}

	pub async fn activate(&self, id: &str) -> Result<(), PluginError> {
		let record = self.record(id)?;
		let mut r = record.lock().await;
		match r.state {
			PluginState::Loaded | PluginState::Initialized | PluginState::Deactivated => {},
			state => {
				return Err(PluginError::InvalidTransition {
					id: id.to_string(),
					action: "activate",
					state,
				});
			},
		}
		let factory = self.factory.read().expect("plugin manager poisoned").clone();
		if let Some(factory) = factory {
			match factory.instantiate(&r.manifest, &r.config) {
				Ok(registrations) => {
					for reg in registrations {
						self
							.registry
							.register(strng::new(id), reg.point, reg.priority, reg.handler);
					}
				},
				Err(e) => {
					r.state = PluginState::Error;
					r.error = Some(e.to_string());
					return Err(PluginError::Lifecycle {
						id: id.to_string(),
						message: e.to_string(),
					});
				},
			}
		}
		r.state = PluginState::Active;
		r.error = None;
		r.enabled = true;
		drop(r);
		self.persist();
		info!(plugin = id, "plugin activated");
		Ok(())
	}

	pub async fn deactivate(&self, id: &str) -> Result<(), PluginError> {
		let record = self.record(id)?;
		let mut r = record.lock().await;
		if r.state != PluginState::Active {
			return Err(PluginError::InvalidTransition {
				id: id.to_string(),
				action: "deactivate",
				state: r.state,
			});
		}
		self.registry.unregister_plugin(id);
		r.state = PluginState::Deactivated;
		r.enabled = false;
		drop(r);
		self.persist();
		info!(plugin = id, "plugin deactivated");
		Ok(())
	}

	pub async fn reload(&self, id: &str) -> Result<(), PluginError> {
		let record = self.record(id)?;
		{
			let mut r = record.lock().await;
			if r.state == PluginState::Active {
				self.registry.unregister_plugin(id);
				r.state = PluginState::Deactivated;
			}
		}
		self.activate(id).await
	}

	pub async fn configure(&self, id: &str, config: Value) -> Result<(), PluginError> {
		let record = self.record(id)?;
		let was_active = {
			let mut r = record.lock().await;
			r.config = config;
			r.state == PluginState::Active
		};
		if was_active {
			// Re-instantiate with the new config.
			self.reload(id).await?;
		}
		self.persist();
		Ok(())
	}

	pub async fn unload(&self, id: &str) -> Result<(), PluginError> {
		let record = self.record(id)?;
		{
			let r = record.lock().await;
			if r.state == PluginState::Active {
				self.registry.unregister_plugin(id);
			}
		}
		self
			.plugins
			.write()
			.expect("plugin manager poisoned")
			.remove(&strng::new(id));
		self
			.http_handlers
			.write()
			.expect("plugin manager poisoned")
			.retain(|(plugin, _), _| plugin.as_str() != id);
		self.persist();
		info!(plugin = id, "plugin unloaded");
		Ok(())
	}

	pub async fn list(&self) -> Vec<Value> {
		let records: Vec<Arc<AsyncMutex<PluginRecord>>> = {
			let plugins = self.plugins.read().expect("plugin manager poisoned");
			plugins.values().cloned().collect()
		};
		let mut out = Vec::with_capacity(records.len());
		for record in records {
			let r = record.lock().await;
			out.push(serde_json::json!({
				"id": r.manifest.id,
				"version": r.manifest.version,
				"state": r.state,
				"error": r.error,
				"enabled": r.enabled,
				"hooks": r.manifest.hooks,
				"config": r.config,
			}));
		}
		out.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hooks::{HookVerdict, Handler};
	use async_trait::async_trait;
	use std::time::Duration;

	struct Nop;

	#[async_trait]
	impl Handler for Nop {
		async fn invoke(&self, _point: HookPoint, _payload: Value) -> HookVerdict {
			HookVerdict::Continue(None)
		}
	}

	struct NopFactory;

	impl HandlerFactory for NopFactory {
		fn instantiate(
			&self,
			_manifest: &PluginManifest,
			_config: &Value,
		) -> anyhow::Result<Vec<HookRegistration>> {
			Ok(vec![HookRegistration {
				point: HookPoint::RequestPre,
				priority: 0,
				handler: Arc::new(Nop),
			}])
		}
	}

	struct FailingFactory;

	impl HandlerFactory for FailingFactory {
		fn instantiate(
			&self,
			_manifest: &PluginManifest,
			_config: &Value,
		) -> anyhow::Result<Vec<HookRegistration>> {
			anyhow::bail!("host refused")
		}
	}

	fn manifest(id: &str) -> PluginManifest {
		PluginManifest {
			id: id.to_string(),
			version: "1.0.0".to_string(),
			main: "index.js".to_string(),
			permissions: vec![],
			hooks: vec!["request:pre".to_string()],
		}
	}

	fn manager() -> (PluginManager, Arc<HookRegistry>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		std::mem::forget(dir);
		let registry = Arc::new(HookRegistry::new(Duration::from_secs(1)));
		(
			PluginManager::new(store, registry.clone(), "./plugins".to_string()),
			registry,
		)
	}

	#[tokio::test]
	async fn activation_installs_hooks_and_deactivation_removes_them() {
		let (mgr, registry) = manager();
		mgr.set_factory(Arc::new(NopFactory));
		mgr.load(manifest("p1"), Value::Null).await.unwrap();
		assert!(registry.is_empty(HookPoint::RequestPre));
		mgr.activate("p1").await.unwrap();
		assert!(!registry.is_empty(HookPoint::RequestPre));
		mgr.deactivate("p1").await.unwrap();
		assert!(registry.is_empty(HookPoint::RequestPre));
	}

	#[tokio::test]
	async fn factory_failure_moves_plugin_to_error() {
		let (mgr, _registry) = manager();
		mgr.set_factory(Arc::new(FailingFactory));
		mgr.load(manifest("p1"), Value::Null).await.unwrap();
		let err = mgr.activate("p1").await.unwrap_err();
		assert!(matches!(err, PluginError::Lifecycle { .. }));
		let listed = mgr.list().await;
		assert_eq!(listed[0]["state"], "error");
	}

	#[tokio::test]
	async fn double_deactivate_is_an_invalid_transition() {
		let (mgr, _registry) = manager();
		mgr.load(manifest("p1"), Value::Null).await.unwrap();
		mgr.activate("p1").await.unwrap();
		mgr.deactivate("p1").await.unwrap();
		let err = mgr.deactivate("p1").await.unwrap_err();
		assert!(matches!(err, PluginError::InvalidTransition { .. }));
	}

	#[tokio::test]
	async fn unknown_hook_in_manifest_is_rejected() {
		let (mgr, _registry) = manager();
		let mut m = manifest("bad");
		m.hooks = vec!["request:nonsense".to_string()];
		assert!(mgr.load(m, Value::Null).await.is_err());
	}

	#[tokio::test]
	async fn unknown_plugin_is_not_found() {
		let (mgr, _registry) = manager();
		assert!(matches!(
			mgr.activate("ghost").await.unwrap_err(),
			PluginError::NotFound(_)
		));
	}
}
