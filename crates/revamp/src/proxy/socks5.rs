use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use revamp_core::drain::DrainWatcher;
use revamp_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::httpproxy::accept_loop;
use super::mitm::{self, ConnectPlan};
use crate::ProxyInputs;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// The SOCKS5 frontend: RFC 1928, no authentication, CONNECT only.
pub async fn serve(listener: TcpListener, inputs: Arc<ProxyInputs>, drain: DrainWatcher) {
	accept_loop("socks5", listener, drain, move |socket, peer| {
		let inputs = inputs.clone();
		async move {
			inputs.metrics.connections_socks5.inc();
			inputs.metrics.connections_active.inc();
			if let Err(e) = serve_connection(socket, peer.ip(), inputs.clone()).await {
				// Protocol errors close the connection; nothing to send back.
				debug!(peer = %peer, err = %e, "socks5 connection ended");
			}
			inputs.metrics.connections_active.dec();
		}
	})
	.await;
}

#[derive(thiserror::Error, Debug)]
pub enum Socks5Error {
	#[error("unsupported protocol version {0}")]
	BadVersion(u8),
	#[error("no acceptable authentication method")]
	NoAcceptableMethod,
	#[error("unsupported command {0}")]
	UnsupportedCommand(u8),
	#[error("unsupported address type {0}")]
	UnsupportedAddress(u8),
	#[error("malformed address")]
	MalformedAddress,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

async fn serve_connection(
	mut socket: TcpStream,
	client_ip: IpAddr,
	inputs: Arc<ProxyInputs>,
) -> Result<(), Socks5Error> {
	let (host, port) = match handshake(&mut socket).await {
		Ok(target) => target,
		Err(e) => {
			// The reply (if one applies) was already written; drop the stream.
			return Err(e);
		},
	};
	let host = strng::new(&host);
	let plan = mitm::plan_connect(&inputs, client_ip, &host, port).await;
	debug!(%host, port, ?plan, "socks5 CONNECT accepted");

	match plan {
		ConnectPlan::Local => {
			write_reply(&mut socket, REP_SUCCESS).await?;
			mitm::serve_local(socket, host, port, inputs, client_ip).await;
		},
		ConnectPlan::Mitm => {
			write_reply(&mut socket, REP_SUCCESS).await?;
			mitm::terminate(socket, host, inputs, client_ip).await;
		},
		ConnectPlan::Splice => match mitm::dial(&host, port).await {
			Ok(upstream) => {
				write_reply(&mut socket, REP_SUCCESS).await?;
				mitm::splice_tunnel(socket, upstream, &inputs).await;
			},
			Err(e) => {
				let code = match e.kind() {
					std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
					_ => REP_HOST_UNREACHABLE,
				};
				debug!(%host, port, err = %e, "socks5 dial failed");
				write_reply(&mut socket, code).await?;
			},
		},
	}
	Ok(())
}

/// Runs the RFC 1928 negotiation on a fresh connection and returns the
/// CONNECT target. Writes the failure reply itself where the protocol calls
/// for one.
async fn handshake(socket: &mut TcpStream) -> Result<(String, u16), Socks5Error> {
	// Greeting: VER NMETHODS METHODS...
	let mut head = [0u8; 2];
	socket.read_exact(&mut head).await?;
	if head[0] != SOCKS_VERSION {
		return Err(Socks5Error::BadVersion(head[0]));
	}
	let mut methods = vec![0u8; head[1] as usize];
	socket.read_exact(&mut methods).await?;
	if !methods.contains(&METHOD_NO_AUTH) {
		socket
			.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
			.await?;
		return Err(Socks5Error::NoAcceptableMethod);
	}
	socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

	// Request: VER CMD RSV ATYP DST.ADDR DST.PORT
	let mut request = [0u8; 4];
	socket.read_exact(&mut request).await?;
	if request[0] != SOCKS_VERSION {
		return Err(Socks5Error::BadVersion(request[0]));
	}
	let host = match request[3] {
		0x01 => {
			let mut addr = [0u8; 4];
			socket.read_exact(&mut addr).await?;
			Ipv4Addr::from(addr).to_string()
		},
		0x03 => {
			let mut len = [0u8; 1];
			socket.read_exact(&mut len).await?;
			let mut name = vec![0u8; len[0] as usize];
			socket.read_exact(&mut name).await?;
			String::from_utf8(name).map_err(|_| Socks5Error::MalformedAddress)?
		},
		0x04 => {
			let mut addr = [0u8; 16];
			socket.read_exact(&mut addr).await?;
			Ipv6Addr::from(addr).to_string()
		},
		other => {
			write_reply(socket, REP_ADDRESS_NOT_SUPPORTED).await?;
			return Err(Socks5Error::UnsupportedAddress(other));
		},
	};
	let mut port = [0u8; 2];
	socket.read_exact(&mut port).await?;
	let port = u16::from_be_bytes(port);

	// UDP ASSOCIATE and BIND are out of scope.
	if request[1] != CMD_CONNECT {
		write_reply(socket, REP_COMMAND_NOT_SUPPORTED).await?;
		return Err(Socks5Error::UnsupportedCommand(request[1]));
	}
	Ok((host, port))
}

async fn write_reply(socket: &mut TcpStream, code: u8) -> std::io::Result<()> {
	// BND.ADDR/BND.PORT carry no useful information for CONNECT; zeroes are
	// what every client expects.
	let reply = [SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
	socket.write_all(&reply).await
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn pair() -> (TcpStream, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let client = TcpStream::connect(addr);
		let server = async { listener.accept().await.map(|(s, _)| s) };
		let (client, server) = tokio::join!(client, server);
		(client.unwrap(), server.unwrap())
	}

	#[tokio::test]
	async fn connect_to_domain_parses() {
		let (mut client, mut server) = pair().await;
		let task = tokio::spawn(async move { handshake(&mut server).await });
		// Greeting offering no-auth.
		client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply, [0x05, 0x00]);
		// CONNECT example.com:443.
		let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
		req.extend_from_slice(b"example.com");
		req.extend_from_slice(&443u16.to_be_bytes());
		client.write_all(&req).await.unwrap();
		let (host, port) = task.await.unwrap().unwrap();
		assert_eq!(host, "example.com");
		assert_eq!(port, 443);
	}

	#[tokio::test]
	async fn connect_to_ipv4_parses() {
		let (mut client, mut server) = pair().await;
		let task = tokio::spawn(async move { handshake(&mut server).await });
		client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await.unwrap();
		let mut req = vec![0x05, 0x01, 0x00, 0x01, 192, 168, 0, 1];
		req.extend_from_slice(&8080u16.to_be_bytes());
		client.write_all(&req).await.unwrap();
		let (host, port) = task.await.unwrap().unwrap();
		assert_eq!(host, "192.168.0.1");
		assert_eq!(port, 8080);
	}

	#[tokio::test]
	async fn bind_command_gets_command_not_supported() {
		let (mut client, mut server) = pair().await;
		let task = tokio::spawn(async move { handshake(&mut server).await });
		client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await.unwrap();
		// BIND to 1.2.3.4:80.
		let mut req = vec![0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4];
		req.extend_from_slice(&80u16.to_be_bytes());
		client.write_all(&req).await.unwrap();
		let mut rep = [0u8; 10];
		client.read_exact(&mut rep).await.unwrap();
		assert_eq!(rep[1], REP_COMMAND_NOT_SUPPORTED);
		assert!(matches!(
			task.await.unwrap(),
			Err(Socks5Error::UnsupportedCommand(0x02))
		));
	}

	#[tokio::test]
	async fn auth_required_client_is_rejected() {
		let (mut client, mut server) = pair().await;
		let task = tokio::spawn(async move { handshake(&mut server).await });
		// Only username/password offered.
		client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply, [0x05, 0xFF]);
		assert!(matches!(
			task.await.unwrap(),
			Err(Socks5Error::NoAcceptableMethod)
		));
	}

	#[tokio::test]
	async fn wrong_version_is_a_protocol_error() {
		let (mut client, mut server) = pair().await;
		let task = tokio::spawn(async move { handshake(&mut server).await });
		client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
		assert!(matches!(
			task.await.unwrap(),
			Err(Socks5Error::BadVersion(0x04))
		));
	}
}
