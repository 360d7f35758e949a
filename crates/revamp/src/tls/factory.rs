use std::sync::{Arc, Mutex};

use anyhow::Context;
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber};
use revamp_core::prelude::*;
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;

use super::CertAuthority;
use crate::cache::LruMap;

/// Leaf validity window: a little backdating tolerates client clock skew.
const BACKDATE_MINUTES: i64 = 5;
const VALIDITY_DAYS: i64 = 30;
/// Re-mint when this close to expiry.
const ROTATE_WITHIN_DAYS: i64 = 1;

struct CachedLeaf {
	key: Arc<CertifiedKey>,
	not_after: OffsetDateTime,
}

/// Mints per-hostname leaf certificates under the local root, LRU-cached by
/// hostname. The mint happens under the cache mutex, which doubles as the
/// single-flight guard: concurrent handshakes for a new hostname produce one
/// key pair.
pub struct CertFactory {
	ca: Arc<CertAuthority>,
	cache: Mutex<LruMap<Strng, CachedLeaf>>,
}

impl CertFactory {
	pub fn new(ca: Arc<CertAuthority>, capacity: usize) -> Arc<Self> {
		Arc::new(CertFactory {
			ca,
			cache: Mutex::new(LruMap::new(capacity)),
		})
	}

	/// The certified key for `hostname`, minting (or rotating a near-expired
	/// leaf) as needed.
	pub fn certified_key(&self, hostname: &str) -> anyhow::Result<Arc<CertifiedKey>> {
		let host = strng::new(hostname.to_ascii_lowercase());
		let mut cache = self.cache.lock().expect("cert cache poisoned");
		if let Some(leaf) = cache.get(&host) {
			let rotate_at = leaf.not_after - time::Duration::days(ROTATE_WITHIN_DAYS);
			if OffsetDateTime::now_utc() < rotate_at {
				return Ok(leaf.key.clone());
			}
			debug!(%host, "leaf certificate near expiry, rotating");
		}
		let (key, not_after) = self.mint(&host)?;
		let _ = cache.insert(
			host,
			CachedLeaf {
				key: key.clone(),
				not_after,
			},
			1,
		);
		Ok(key)
	}

	fn mint(&self, hostname: &str) -> anyhow::Result<(Arc<CertifiedKey>, OffsetDateTime)> {
		let leaf_key = KeyPair::generate().context("generating leaf key")?;
		let mut sans = vec![hostname.to_string()];
		sans.extend(implied_wildcards(hostname));
		let mut params = CertificateParams::new(sans).context("building leaf params")?;
		params
			.distinguished_name
			.push(DnType::CommonName, hostname);
		let now = OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::minutes(BACKDATE_MINUTES);
		params.not_after = now + time::Duration::days(VALIDITY_DAYS);
		params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		let not_after = params.not_after;
		let cert = params
			.signed_by(&leaf_key, &self.ca.cert, &self.ca.key)
			.context("signing leaf")?;

		let chain = vec![cert.der().clone(), self.ca.cert_der().clone()];
		let signer = super::provider()
			.key_provider
			.load_private_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
				leaf_key.serialize_der(),
			)))
			.map_err(|e| anyhow::anyhow!("unusable leaf key: {e}"))?;
		Ok((Arc::new(CertifiedKey::new(chain, signer)), not_after))
	}

	/// A rustls server config whose certificate is chosen by SNI during the
	/// handshake, falling back to the CONNECT hostname when the client sends
	/// none (older Safari over proxies does exactly that).
	pub fn server_config(self: &Arc<Self>, fallback_host: Strng) -> anyhow::Result<Arc<ServerConfig>> {
		let config = ServerConfig::builder_with_provider(super::provider())
			.with_protocol_versions(super::ALL_TLS_VERSIONS)?
			.with_no_client_auth()
			.with_cert_resolver(Arc::new(SniResolver {
				factory: self.clone(),
				fallback: fallback_host,
			}));
		Ok(Arc::new(config))
	}

	pub fn cached_len(&self) -> usize {
		self.cache.lock().expect("cert cache poisoned").len()
	}
}

#[derive(Debug)]
struct SniResolver {
	factory: Arc<CertFactory>,
	fallback: Strng,
}

impl ResolvesServerCert for SniResolver {
	fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		let host = client_hello
			.server_name()
			.map(strng::new)
			.unwrap_or_else(|| self.fallback.clone());
		match self.factory.certified_key(&host) {
			Ok(key) => Some(key),
			Err(e) => {
				warn!(%host, err = %e, "failed to mint leaf certificate");
				None
			},
		}
	}
}

impl std::fmt::Debug for CertFactory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertFactory").finish_non_exhaustive()
	}
}

/// The wildcard SANs mechanically implied by a hostname with at least three
/// labels: one `*.` entry per suffix that keeps two or more labels.
pub fn implied_wildcards(hostname: &str) -> Vec<String> {
	if hostname.parse::<std::net::IpAddr>().is_ok() {
		return Vec::new();
	}
	let labels: Vec<&str> = hostname.split('.').collect();
	if labels.len() < 3 {
		return Vec::new();
	}
	(1..=labels.len() - 2)
		.map(|i| format!("*.{}", labels[i..].join(".")))
		.collect()
}

#[cfg(test)]
mod tests {
	use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

	use super::*;
	use crate::store::Store;

	fn factory() -> Arc<CertFactory> {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		let ca = Arc::new(CertAuthority::load_or_create(&store).unwrap());
		std::mem::forget(dir);
		CertFactory::new(ca, 16)
	}

	fn leaf_sans(key: &CertifiedKey) -> Vec<String> {
		let (_, cert) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
		cert
			.subject_alternative_name()
			.unwrap()
			.map(|ext| {
				ext
					.value
					.general_names
					.iter()
					.filter_map(|n| match n {
						GeneralName::DNSName(d) => Some(d.to_string()),
						_ => None,
					})
					.collect()
			})
			.unwrap_or_default()
	}

	#[test]
	fn wildcards_require_three_labels() {
		assert!(implied_wildcards("example.com").is_empty());
		assert_eq!(implied_wildcards("www.example.com"), vec!["*.example.com"]);
		assert_eq!(
			implied_wildcards("a.b.example.com"),
			vec!["*.b.example.com", "*.example.com"]
		);
		assert!(implied_wildcards("192.168.1.10").is_empty());
	}

	#[test]
	fn leaf_san_contains_hostname_and_wildcards() {
		let f = factory();
		let key = f.certified_key("cdn.static.example.com").unwrap();
		let sans = leaf_sans(&key);
		assert!(sans.contains(&"cdn.static.example.com".to_string()));
		assert!(sans.contains(&"*.static.example.com".to_string()));
		assert!(sans.contains(&"*.example.com".to_string()));
	}

	#[test]
	fn leaf_chains_to_the_local_root() {
		let f = factory();
		let key = f.certified_key("www.example.com").unwrap();
		// Chain carries leaf + root.
		assert_eq!(key.cert.len(), 2);
		let (_, leaf) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
		let (_, root) = X509Certificate::from_der(key.cert[1].as_ref()).unwrap();
		assert_eq!(leaf.issuer(), root.subject());
		let leaf_is_ca = leaf
			.basic_constraints()
			.unwrap()
			.map(|bc| bc.value.ca)
			.unwrap_or(false);
		assert!(!leaf_is_ca);
	}

	#[test]
	fn minted_leafs_are_cached_per_hostname() {
		let f = factory();
		let a = f.certified_key("www.example.com").unwrap();
		let b = f.certified_key("www.example.com").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		let c = f.certified_key("other.example.com").unwrap();
		assert!(!Arc::ptr_eq(&a, &c));
		assert_eq!(f.cached_len(), 2);
	}

	#[test]
	fn lru_evicts_past_capacity() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		let ca = Arc::new(CertAuthority::load_or_create(&store).unwrap());
		let f = CertFactory::new(ca, 2);
		f.certified_key("a.example.com").unwrap();
		f.certified_key("b.example.com").unwrap();
		f.certified_key("c.example.com").unwrap();
		assert_eq!(f.cached_len(), 2);
	}
}
