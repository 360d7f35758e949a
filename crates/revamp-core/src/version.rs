use std::fmt;

#[derive(serde::Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
	pub version: &'static str,
	pub rust_version: &'static str,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION"),
			rust_version: "1.85",
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for BuildInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "version {} (rust {})", self.version, self.rust_version)
	}
}
