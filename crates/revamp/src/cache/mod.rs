use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::Config;

mod flight;
mod lru;

pub use flight::{Flight, FlightLeader, FlightWaitError, SingleFlight, wait as flight_wait};
pub use lru::LruMap;

/// ES-module bundles share the transformation cache but live under their own
/// classified label, so per-file and bundle entries can never collide.
pub const ESM_BUNDLE_LABEL: &str = "esm-bundle";

/// A 256-bit content address over `(url, classified_content_type,
/// client_fingerprint)`. File names use the first 128 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
	pub fn file_name(&self) -> String {
		hex::encode(&self.0[..16])
	}
}

impl std::fmt::Debug for Fingerprint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Fingerprint({})", self.file_name())
	}
}

pub fn fingerprint(url: &str, content_label: &str, client_fp: &str) -> Fingerprint {
	let mut h = Sha256::new();
	h.update(url.as_bytes());
	h.update(b"\0");
	h.update(content_label.as_bytes());
	h.update(b"\0");
	h.update(client_fp.as_bytes());
	Fingerprint(h.finalize().into())
}

/// The canonical client fingerprint: client IP mixed with a hash of the
/// effective config, so two clients with differing configs never share cache
/// entries. This is the only derivation in the codebase.
pub fn client_fingerprint(client_ip: IpAddr, config: &Config) -> String {
	let config_json = serde_json::to_vec(config).expect("config serializes");
	let config_hash = hex::encode(Sha256::digest(&config_json));
	let mut h = Sha256::new();
	h.update(client_ip.to_string().as_bytes());
	h.update(b"\0");
	h.update(config_hash.as_bytes());
	let digest: [u8; 32] = h.finalize().into();
	hex::encode(&digest[..16])
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
	pub bytes: Bytes,
	pub content_label: &'static str,
	pub stored_at: SystemTime,
}

/// Two-tier content-addressed store for transformed output. The memory tier
/// answers hot lookups; the disk tier holds flat files named by the hex
/// fingerprint (the filesystem is the index). Disk writes are staged in the
/// background with write-temp-then-rename.
pub struct TransformCache {
	mem: Mutex<LruMap<Fingerprint, CacheEntry>>,
	disk: Arc<Mutex<LruMap<String, u64>>>,
	dir: PathBuf,
	url_index: Mutex<HashMap<String, Vec<Fingerprint>>>,
}

impl TransformCache {
	pub fn open(dir: PathBuf, memory_budget: usize, disk_budget: u64) -> anyhow::Result<Self> {
		std::fs::create_dir_all(&dir)?;
		let mut disk = LruMap::new(disk_budget as usize);
		// Seed the disk index from what survived the last run. Recency starts
		// flat; it rebuilds as entries are touched.
		for entry in std::fs::read_dir(&dir)? {
			let entry = entry?;
			let Ok(meta) = entry.metadata() else { continue };
			if !meta.is_file() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.ends_with(".tmp") {
				let _ = std::fs::remove_file(entry.path());
				continue;
			}
			for (evicted, _) in disk.insert(name, meta.len(), meta.len() as usize) {
				let _ = std::fs::remove_file(dir.join(evicted));
			}
		}
		Ok(TransformCache {
			mem: Mutex::new(LruMap::new(memory_budget)),
			disk: Arc::new(Mutex::new(disk)),
			dir,
			url_index: Mutex::new(HashMap::new()),
		})
	}

	/// Memory first, then disk; a disk hit is promoted to memory under the
	/// caller's expected content label (flat files carry no type metadata).
	/// Corrupt disk entries (unreadable or empty) are evicted silently.
	pub async fn get(&self, key: &Fingerprint, label: &'static str) -> Option<CacheEntry> {
		if let Some(entry) = self.mem.lock().expect("cache poisoned").get(key) {
			return Some(entry.clone());
		}
		let name = key.file_name();
		if !self.disk.lock().expect("cache poisoned").contains(&name) {
			return None;
		}
		let path = self.dir.join(&name);
		match tokio::fs::read(&path).await {
			Ok(data) if !data.is_empty() => {
				self.disk.lock().expect("cache poisoned").touch(&name);
				let entry = CacheEntry {
					bytes: Bytes::from(data),
					content_label: label,
					stored_at: SystemTime::now(),
				};
				// Memory-tier evictions still live on disk; drop them.
				let _ = self.mem.lock().expect("cache poisoned").insert(
					*key,
					entry.clone(),
					entry.bytes.len(),
				);
				Some(entry)
			},
			Ok(_) | Err(_) => {
				debug!(file = %name, "evicting unreadable cache entry");
				self.disk.lock().expect("cache poisoned").remove(&name);
				let _ = tokio::fs::remove_file(&path).await;
				None
			},
		}
	}

	/// Writes to the memory tier synchronously (visible to all readers before
	/// the caller releases the response) and stages the disk write in the
	/// background.
	pub fn put(&self, key: Fingerprint, url: &str, content_label: &'static str, bytes: Bytes) {
		let entry = CacheEntry {
			bytes: bytes.clone(),
			content_label,
			stored_at: SystemTime::now(),
		};
		let len = entry.bytes.len();
		let _ = self
			.mem
			.lock()
			.expect("cache poisoned")
			.insert(key, entry, len);
		self
			.url_index
			.lock()
			.expect("cache poisoned")
			.entry(url.to_string())
			.or_default()
			.push(key);

		let dir = self.dir.clone();
		let name = key.file_name();
		let disk = self.disk.clone();
		tokio::spawn(async move {
			if let Err(e) = stage_to_disk(&dir, &name, &bytes).await {
				warn!(err = %e, file = %name, "failed to stage cache entry to disk");
				return;
			}
			let evicted = disk
				.lock()
				.expect("cache poisoned")
				.insert(name, bytes.len() as u64, bytes.len());
			for (old, _) in evicted {
				let _ = tokio::fs::remove_file(dir.join(old)).await;
			}
		});
	}

	pub fn invalidate_url(&self, url: &str) {
		let keys = self
			.url_index
			.lock()
			.expect("cache poisoned")
			.remove(url)
			.unwrap_or_default();
		let mut mem = self.mem.lock().expect("cache poisoned");
		let mut disk = self.disk.lock().expect("cache poisoned");
		for key in keys {
			mem.remove(&key);
			let name = key.file_name();
			disk.remove(&name);
			let _ = std::fs::remove_file(self.dir.join(name));
		}
	}

	pub fn invalidate_all(&self) {
		self.mem.lock().expect("cache poisoned").clear();
		self.url_index.lock().expect("cache poisoned").clear();
		let mut disk = self.disk.lock().expect("cache poisoned");
		let names: Vec<String> = disk.keys().cloned().collect();
		disk.clear();
		for name in names {
			let _ = std::fs::remove_file(self.dir.join(name));
		}
	}

	pub fn stats(&self) -> serde_json::Value {
		let mem = self.mem.lock().expect("cache poisoned");
		let disk = self.disk.lock().expect("cache poisoned");
		serde_json::json!({
			"memoryEntries": mem.len(),
			"memoryBytes": mem.total_weight(),
			"diskEntries": disk.len(),
			"diskBytes": disk.total_weight(),
		})
	}

	/// True when neither tier holds the key. Test support.
	pub fn is_unknown(&self, key: &Fingerprint) -> bool {
		!self.mem.lock().expect("cache poisoned").contains(key)
			&& !self
				.disk
				.lock()
				.expect("cache poisoned")
				.contains(&key.file_name())
	}
}

async fn stage_to_disk(dir: &std::path::Path, name: &str, bytes: &Bytes) -> std::io::Result<()> {
	let tmp = dir.join(format!("{name}.tmp"));
	let path = dir.join(name);
	tokio::fs::write(&tmp, bytes).await?;
	tokio::fs::rename(&tmp, &path).await
}

/// The redirect-exclusion set: once a URL is seen redirecting it is never
/// cached again for the life of the process. Capped so a long-lived proxy
/// cannot grow it unbounded.
pub struct RedirectSet {
	urls: Mutex<LruMap<String, ()>>,
}

const REDIRECT_SET_BUDGET: usize = 4096;

impl RedirectSet {
	pub fn new() -> Self {
		RedirectSet {
			urls: Mutex::new(LruMap::new(REDIRECT_SET_BUDGET)),
		}
	}

	pub fn insert(&self, url: &str) {
		let _ = self
			.urls
			.lock()
			.expect("redirect set poisoned")
			.insert(url.to_string(), (), 1);
	}

	/// Membership test that also refreshes recency, so hot redirectors stay
	/// excluded under pressure.
	pub fn contains(&self, url: &str) -> bool {
		self
			.urls
			.lock()
			.expect("redirect set poisoned")
			.get(&url.to_string())
			.is_some()
	}

	pub fn len(&self) -> usize {
		self.urls.lock().expect("redirect set poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for RedirectSet {
	fn default() -> Self {
		Self::new()
	}
}
