use anyhow::Context;
use rcgen::{
	BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::store::Store;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";

const CA_COMMON_NAME: &str = "Revamp Root CA";
const CA_VALIDITY_YEARS: i64 = 10;

/// The process-wide local root. Created once and persisted; clients install
/// `ca.pem` and every MITM leaf chains up to it, so regenerating the root
/// would invalidate every installed trust anchor.
pub struct CertAuthority {
	pub(super) cert: rcgen::Certificate,
	pub(super) key: KeyPair,
	cert_pem: String,
	cert_der: CertificateDer<'static>,
}

impl CertAuthority {
	/// Loads the persisted root or mints a fresh one. Failure here is a
	/// startup failure: the proxy cannot terminate TLS without its root.
	pub fn load_or_create(store: &Store) -> anyhow::Result<Self> {
		let cert_path = store.path(CA_CERT_FILE);
		let key_path = store.path(CA_KEY_FILE);
		if cert_path.exists() && key_path.exists() {
			let cert_pem = std::fs::read_to_string(&cert_path).context("reading ca.pem")?;
			let key_pem = std::fs::read_to_string(&key_path).context("reading ca.key")?;
			let key = KeyPair::from_pem(&key_pem).context("parsing ca.key")?;
			let params =
				CertificateParams::from_ca_cert_pem(&cert_pem).context("parsing ca.pem")?;
			let cert = params.self_signed(&key).context("rebuilding root certificate")?;
			let cert_der = cert.der().clone();
			info!("loaded root CA from {}", cert_path.display());
			return Ok(CertAuthority {
				cert,
				key,
				cert_pem,
				cert_der,
			});
		}

		let key = KeyPair::generate().context("generating root key")?;
		let mut params = CertificateParams::default();
		params
			.distinguished_name
			.push(DnType::CommonName, CA_COMMON_NAME);
		params
			.distinguished_name
			.push(DnType::OrganizationName, "Revamp Proxy");
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		let now = OffsetDateTime::now_utc();
		params.not_before = now - Duration::minutes(5);
		params.not_after = now + Duration::days(365 * CA_VALIDITY_YEARS);
		params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
		let cert = params.self_signed(&key).context("signing root certificate")?;

		let cert_pem = cert.pem();
		store.write_atomic(&cert_path, cert_pem.as_bytes())?;
		store.write_atomic(&key_path, key.serialize_pem().as_bytes())?;
		info!("minted new root CA at {}", cert_path.display());
		let cert_der = cert.der().clone();
		Ok(CertAuthority {
			cert,
			key,
			cert_pem,
			cert_der,
		})
	}

	/// The PEM clients install as their trust root.
	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn cert_der(&self) -> &CertificateDer<'static> {
		&self.cert_der
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_then_reload_keeps_the_same_root() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		let first = CertAuthority::load_or_create(&store).unwrap();
		let first_pem = first.cert_pem().to_string();
		drop(first);
		let second = CertAuthority::load_or_create(&store).unwrap();
		// The persisted PEM (what clients install) must be stable.
		assert_eq!(second.cert_pem(), first_pem);
	}

	#[test]
	fn root_is_a_ca_certificate() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path()).unwrap();
		let ca = CertAuthority::load_or_create(&store).unwrap();
		let (_, parsed) = x509_parser::parse_x509_certificate(ca.cert_der()).unwrap();
		let constraints = parsed.basic_constraints().unwrap().expect("CA extension");
		assert!(constraints.value.ca);
		assert!(
			parsed
				.subject()
				.iter_common_name()
				.any(|cn| cn.as_str().unwrap() == CA_COMMON_NAME)
		);
	}
}
