mod ca;
mod factory;

pub use ca::CertAuthority;
pub use factory::{CertFactory, implied_wildcards};

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("tls handshake error: {0}")]
	Handshake(std::io::Error),
	#[error("certificate minting failed: {0}")]
	Mint(#[from] anyhow::Error),
}
