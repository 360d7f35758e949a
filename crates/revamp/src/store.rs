use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Durable JSON state under the data directory. Every write goes to a
/// sibling temp file first, is fsynced, then renamed over the final path, so
/// a crash mid-write leaves either the old content or the new content.
#[derive(Clone, Debug)]
pub struct Store {
	data_dir: PathBuf,
}

pub const CONFIG_FILE: &str = "config.json";
pub const DOMAINS_FILE: &str = "domains.json";
pub const PLUGINS_FILE: &str = "plugins.json";

impl Store {
	pub fn new(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let data_dir = data_dir.into();
		std::fs::create_dir_all(&data_dir)?;
		Ok(Store { data_dir })
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	pub fn path(&self, name: &str) -> PathBuf {
		self.data_dir.join(name)
	}

	/// Loads `name` if present. A missing file is a fresh start; a malformed
	/// file is logged and treated the same way rather than aborting startup.
	pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
		let path = self.path(name);
		let data = match std::fs::read_to_string(&path) {
			Ok(s) => s,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "no state file, starting fresh");
				return None;
			},
			Err(e) => {
				warn!(err = %e, path = %path.display(), "failed to read state file");
				return None;
			},
		};
		match serde_json::from_str(&data) {
			Ok(v) => Some(v),
			Err(e) => {
				warn!(err = %e, path = %path.display(), "state file is malformed, ignoring");
				None
			},
		}
	}

	pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
		let json = serde_json::to_vec_pretty(value)?;
		self.write_atomic(&self.path(name), &json)
	}

	/// Atomic write: temp sibling, fsync, rename.
	pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp = tmp_sibling(path);
		{
			let mut f = std::fs::File::create(&tmp)?;
			f.write_all(contents)?;
			f.sync_all()?;
		}
		std::fs::rename(&tmp, path)?;
		debug!(path = %path.display(), "state saved");
		Ok(())
	}
}

fn tmp_sibling(path: &Path) -> PathBuf {
	let mut name = path
		.file_name()
		.map(|n| n.to_os_string())
		.unwrap_or_default();
	name.push(".tmp");
	path.with_file_name(name)
}
