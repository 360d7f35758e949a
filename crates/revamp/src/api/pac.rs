use std::net::IpAddr;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacKind {
	Socks5,
	Http,
	Combined,
}

impl PacKind {
	pub fn from_path(segment: &str) -> Option<PacKind> {
		match segment {
			"socks5" => Some(PacKind::Socks5),
			"http" => Some(PacKind::Http),
			"combined" => Some(PacKind::Combined),
			_ => None,
		}
	}
}

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Renders the PAC body clients download. Internal traffic and plain local
/// names bypass the proxy; everything else goes through with a DIRECT
/// fallback so a dead proxy does not brick the browser.
pub fn render(kind: PacKind, local_ip: IpAddr, cfg: &Config) -> String {
	let socks = format!("SOCKS5 {}:{}", local_ip, cfg.socks5_port);
	let http = format!("PROXY {}:{}", local_ip, cfg.http_proxy_port);
	let directive = match kind {
		PacKind::Socks5 => format!("{socks}; DIRECT"),
		PacKind::Http => format!("{http}; DIRECT"),
		PacKind::Combined => format!("{socks}; {http}; DIRECT"),
	};
	format!(
		r#"function FindProxyForURL(url, host) {{
	if (isPlainHostName(host) || shExpMatch(host, "localhost") || shExpMatch(host, "127.*")) {{
		return "DIRECT";
	}}
	return "{directive}";
}}
"#
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ip() -> IpAddr {
		"192.168.1.50".parse().unwrap()
	}

	#[test]
	fn socks5_pac_names_the_port() {
		let body = render(PacKind::Socks5, ip(), &Config::default());
		assert!(body.contains("function FindProxyForURL"));
		assert!(body.contains("SOCKS5 192.168.1.50:1080"));
		assert!(body.contains("DIRECT"));
	}

	#[test]
	fn http_pac_uses_proxy_directive() {
		let body = render(PacKind::Http, ip(), &Config::default());
		assert!(body.contains("PROXY 192.168.1.50:8080"));
		assert!(!body.contains("SOCKS5"));
	}

	#[test]
	fn combined_pac_prefers_socks() {
		let body = render(PacKind::Combined, ip(), &Config::default());
		let socks_at = body.find("SOCKS5").unwrap();
		let http_at = body.find("PROXY").unwrap();
		assert!(socks_at < http_at);
	}

	#[test]
	fn kind_parsing() {
		assert_eq!(PacKind::from_path("socks5"), Some(PacKind::Socks5));
		assert_eq!(PacKind::from_path("combined"), Some(PacKind::Combined));
		assert_eq!(PacKind::from_path("ftp"), None);
	}
}
