use std::collections::HashMap;
use std::hash::Hash;

/// A weight-budgeted LRU map. Entries carry an explicit weight (bytes for
/// cache tiers, 1 for entry-count budgets); inserting past the budget evicts
/// least-recently-used entries until the total fits again. Eviction scans for
/// the oldest tick, which is fine at the sizes we run (thousands of entries).
#[derive(Debug)]
pub struct LruMap<K, V> {
	map: HashMap<K, Slot<V>>,
	tick: u64,
	budget: usize,
	total_weight: usize,
}

#[derive(Debug)]
struct Slot<V> {
	value: V,
	weight: usize,
	last_used: u64,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
	pub fn new(budget: usize) -> Self {
		LruMap {
			map: HashMap::new(),
			tick: 0,
			budget,
			total_weight: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn total_weight(&self) -> usize {
		self.total_weight
	}

	/// Lookup that refreshes recency.
	pub fn get(&mut self, key: &K) -> Option<&V> {
		self.tick += 1;
		let tick = self.tick;
		self.map.get_mut(key).map(|slot| {
			slot.last_used = tick;
			&slot.value
		})
	}

	/// Lookup without touching recency.
	pub fn peek(&self, key: &K) -> Option<&V> {
		self.map.get(key).map(|s| &s.value)
	}

	pub fn contains(&self, key: &K) -> bool {
		self.map.contains_key(key)
	}

	/// Marks `key` as recently used without reading it.
	pub fn touch(&mut self, key: &K) {
		self.tick += 1;
		let tick = self.tick;
		if let Some(slot) = self.map.get_mut(key) {
			slot.last_used = tick;
		}
	}

	/// Inserts, returning everything evicted to fit the budget. An entry
	/// heavier than the whole budget is rejected and returned directly.
	pub fn insert(&mut self, key: K, value: V, weight: usize) -> Vec<(K, V)> {
		if weight > self.budget {
			return vec![(key, value)];
		}
		self.tick += 1;
		if let Some(old) = self.map.insert(
			key.clone(),
			Slot {
				value,
				weight,
				last_used: self.tick,
			},
		) {
			self.total_weight -= old.weight;
		}
		self.total_weight += weight;
		let mut evicted = Vec::new();
		while self.total_weight > self.budget {
			let Some(oldest) = self
				.map
				.iter()
				.filter(|(k, _)| **k != key)
				.min_by_key(|(_, s)| s.last_used)
				.map(|(k, _)| k.clone())
			else {
				break;
			};
			if let Some(slot) = self.map.remove(&oldest) {
				self.total_weight -= slot.weight;
				evicted.push((oldest, slot.value));
			}
		}
		evicted
	}

	pub fn remove(&mut self, key: &K) -> Option<V> {
		self.map.remove(key).map(|slot| {
			self.total_weight -= slot.weight;
			slot.value
		})
	}

	pub fn clear(&mut self) {
		self.map.clear();
		self.total_weight = 0;
	}

	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.map.keys()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_least_recently_used_first() {
		let mut lru = LruMap::new(3);
		lru.insert("a", 1, 1);
		lru.insert("b", 2, 1);
		lru.insert("c", 3, 1);
		// Touch "a" so "b" is now the oldest.
		assert_eq!(lru.get(&"a"), Some(&1));
		let evicted = lru.insert("d", 4, 1);
		assert_eq!(evicted.len(), 1);
		assert_eq!(evicted[0].0, "b");
		assert!(lru.contains(&"a"));
		assert!(lru.contains(&"d"));
	}

	#[test]
	fn weight_budget_evicts_multiple() {
		let mut lru = LruMap::new(10);
		lru.insert("a", (), 4);
		lru.insert("b", (), 4);
		let evicted = lru.insert("c", (), 8);
		assert_eq!(evicted.len(), 2);
		assert_eq!(lru.total_weight(), 8);
	}

	#[test]
	fn oversized_entry_is_rejected() {
		let mut lru = LruMap::new(4);
		let evicted = lru.insert("big", (), 5);
		assert_eq!(evicted.len(), 1);
		assert!(lru.is_empty());
	}

	#[test]
	fn reinsert_replaces_weight() {
		let mut lru = LruMap::new(10);
		lru.insert("a", 1, 8);
		lru.insert("a", 2, 3);
		assert_eq!(lru.total_weight(), 3);
		assert_eq!(lru.peek(&"a"), Some(&2));
	}

	#[test]
	fn remove_adjusts_weight() {
		let mut lru = LruMap::new(10);
		lru.insert("a", 1, 6);
		assert_eq!(lru.remove(&"a"), Some(1));
		assert_eq!(lru.total_weight(), 0);
		assert_eq!(lru.remove(&"a"), None);
	}
}
