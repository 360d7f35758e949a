use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::PartialConfig;

/// A per-domain configuration overlay. Patterns are hostname globs (`*`
/// matches any run of characters); on multiple matching profiles the highest
/// priority wins, ties broken by the most specific pattern (longest literal
/// prefix).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainProfile {
	pub id: String,
	pub patterns: Vec<String>,
	pub config: PartialConfig,
	#[serde(default)]
	pub priority: i32,
}

impl DomainProfile {
	pub fn matches(&self, hostname: &str) -> bool {
		self.patterns.iter().any(|p| pattern_matches(p, hostname))
	}

	/// The best (most specific) matching pattern's specificity.
	fn specificity_for(&self, hostname: &str) -> usize {
		self
			.patterns
			.iter()
			.filter(|p| pattern_matches(p, hostname))
			.map(|p| pattern_specificity(p))
			.max()
			.unwrap_or(0)
	}
}

/// Glob match with `*` as the only metacharacter, case-insensitive the way
/// hostnames are.
pub fn pattern_matches(pattern: &str, hostname: &str) -> bool {
	let pattern = pattern.to_ascii_lowercase();
	let hostname = hostname.to_ascii_lowercase();
	glob_match(pattern.as_bytes(), hostname.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
	// Iterative wildcard matching with backtracking to the last `*`.
	let (mut p, mut t) = (0usize, 0usize);
	let (mut star, mut mark) = (None::<usize>, 0usize);
	while t < text.len() {
		if p < pattern.len() && (pattern[p] == b'*') {
			star = Some(p);
			mark = t;
			p += 1;
		} else if p < pattern.len() && pattern[p] == text[t] {
			p += 1;
			t += 1;
		} else if let Some(s) = star {
			p = s + 1;
			mark += 1;
			t = mark;
		} else {
			return false;
		}
	}
	while p < pattern.len() && pattern[p] == b'*' {
		p += 1;
	}
	p == pattern.len()
}

/// Specificity is the length of the literal prefix before the first `*`.
pub fn pattern_specificity(pattern: &str) -> usize {
	pattern.find('*').unwrap_or(pattern.len())
}

/// The live set of domain profiles. Reads take a cheap snapshot; mutation
/// replaces the whole vector, so profile edits never disturb requests that
/// are mid-resolution.
#[derive(Debug, Default)]
pub struct ProfileStore {
	profiles: RwLock<Arc<Vec<DomainProfile>>>,
}

impl ProfileStore {
	pub fn new(profiles: Vec<DomainProfile>) -> Self {
		ProfileStore {
			profiles: RwLock::new(Arc::new(profiles)),
		}
	}

	pub fn snapshot(&self) -> Arc<Vec<DomainProfile>> {
		self.profiles.read().expect("profile store poisoned").clone()
	}

	/// The winning profile for `hostname`, if any: highest priority, ties by
	/// longest literal prefix among the matching patterns.
	pub fn select(&self, hostname: &str) -> Option<DomainProfile> {
		let snap = self.snapshot();
		snap
			.iter()
			.filter(|p| p.matches(hostname))
			.max_by_key(|p| (p.priority, p.specificity_for(hostname)))
			.cloned()
	}

	/// Insert or replace by id.
	pub fn upsert(&self, profile: DomainProfile) {
		let mut guard = self.profiles.write().expect("profile store poisoned");
		let mut next: Vec<DomainProfile> = guard.iter().cloned().collect();
		if let Some(idx) = next.iter().position(|p| p.id == profile.id) {
			next[idx] = profile;
		} else {
			next.push(profile);
		}
		*guard = Arc::new(next);
	}

	/// Remove by id; returns whether anything was removed.
	pub fn remove(&self, id: &str) -> bool {
		let mut guard = self.profiles.write().expect("profile store poisoned");
		let before = guard.len();
		let next: Vec<DomainProfile> = guard.iter().filter(|p| p.id != id).cloned().collect();
		let removed = next.len() != before;
		*guard = Arc::new(next);
		removed
	}
}
