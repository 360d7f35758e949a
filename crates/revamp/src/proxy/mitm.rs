use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use pin_project_lite::pin_project;
use revamp_core::copy::{SpliceCounters, splice};
use revamp_core::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::lifecycle::{self, RequestMeta};
use crate::ProxyInputs;
use crate::api::ApiRouter;

/// What to do with an accepted CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
	/// The target is the proxy itself; serve the internal API locally.
	Local,
	/// Terminate TLS and run decrypted requests through the lifecycle.
	Mitm,
	/// Blind byte splice.
	Splice,
}

/// The MITM decision: terminate iff the tunnel is TLS on 443 and the
/// effective config for `(client_ip, hostname)` would actually rewrite
/// something.
pub async fn plan_connect(
	inputs: &Arc<ProxyInputs>,
	client_ip: IpAddr,
	host: &str,
	port: u16,
) -> ConnectPlan {
	if inputs.is_self_target(host, port) {
		return ConnectPlan::Local;
	}
	if port != 443 {
		return ConnectPlan::Splice;
	}
	let resolved = inputs
		.resolver
		.resolve_with_hooks(&inputs.hooks, client_ip, Some(host))
		.await;
	if resolved.config.wants_mitm() {
		ConnectPlan::Mitm
	} else {
		ConnectPlan::Splice
	}
}

pub async fn dial(host: &str, port: u16) -> std::io::Result<TcpStream> {
	let stream = TcpStream::connect((host, port)).await?;
	stream.set_nodelay(true).ok();
	Ok(stream)
}

/// TLS-terminates the client side of a CONNECT and serves the decrypted
/// HTTP/1.1 requests through the lifecycle controller. A failed handshake
/// falls back to splicing: the bytes consumed during the attempt are
/// replayed to the upstream.
pub async fn terminate<IO>(io: IO, host: Strng, inputs: Arc<ProxyInputs>, client_ip: IpAddr)
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let config = match inputs.certs.server_config(host.clone()) {
		Ok(c) => c,
		Err(e) => {
			warn!(%host, err = %e, "cannot build TLS config, dropping tunnel");
			return;
		},
	};
	let acceptor = TlsAcceptor::from(config);
	match acceptor.accept(Recorded::new(io)).into_fallible().await {
		Ok(tls) => {
			inputs.metrics.mitm_connections.inc();
			let meta = RequestMeta {
				client_ip,
				hostname: Some(host),
				is_https: true,
			};
			serve_http(tls, meta, inputs).await;
		},
		Err((e, recorded)) => {
			debug!(%host, err = %e, "TLS handshake failed, falling back to raw tunnel");
			let (io, consumed) = recorded.into_parts();
			match dial(&host, 443).await {
				Ok(mut upstream) => {
					if upstream.write_all(&consumed).await.is_ok() {
						splice_tunnel(io, upstream, &inputs).await;
					}
				},
				Err(e) => {
					debug!(%host, err = %e, "fallback dial failed");
				},
			}
		},
	}
}

/// Serves decrypted (or plain) client requests on one connection. HTTP/1.1
/// keep-alive requests are processed in arrival order by the hyper conn.
pub async fn serve_http<IO>(io: IO, meta: RequestMeta, inputs: Arc<ProxyInputs>)
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let service = service_fn(move |req| {
		let inputs = inputs.clone();
		let meta = meta.clone();
		async move {
			Ok::<_, std::convert::Infallible>(lifecycle::handle(inputs, meta, req).await)
		}
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.serve_connection(TokioIo::new(io), service);
	if let Err(e) = conn.await {
		debug!(err = %e, "connection closed with error");
	}
}

/// Serves the internal API directly on a client connection (SOCKS5 or
/// CONNECT targets that name the proxy itself). On 443 the exchange is
/// TLS-wrapped with a locally minted leaf first.
pub async fn serve_local<IO>(
	io: IO,
	host: Strng,
	port: u16,
	inputs: Arc<ProxyInputs>,
	client_ip: IpAddr,
) where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	if port == 443 {
		let config = match inputs.certs.server_config(host.clone()) {
			Ok(c) => c,
			Err(e) => {
				warn!(%host, err = %e, "cannot build TLS config for local exchange");
				return;
			},
		};
		match TlsAcceptor::from(config).accept(io).await {
			Ok(tls) => serve_api(tls, inputs, client_ip).await,
			Err(e) => debug!(err = %e, "local TLS handshake failed"),
		}
	} else {
		serve_api(io, inputs, client_ip).await;
	}
}

async fn serve_api<IO>(io: IO, inputs: Arc<ProxyInputs>, client_ip: IpAddr)
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let body_cap = inputs.cfg.body_cap;
	let service = service_fn(move |req: ::http::Request<hyper::body::Incoming>| {
		let inputs = inputs.clone();
		async move {
			let (parts, body) = req.into_parts();
			use http_body_util::BodyExt;
			let body = match http_body_util::Limited::new(body, body_cap).collect().await {
				Ok(collected) => collected.to_bytes(),
				Err(_) => Bytes::new(),
			};
			let req = ::http::Request::from_parts(parts, body);
			let response = ApiRouter::new(inputs).handle(req, client_ip).await;
			Ok::<_, std::convert::Infallible>(response)
		}
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.serve_connection(TokioIo::new(io), service);
	if let Err(e) = conn.await {
		debug!(err = %e, "local exchange closed with error");
	}
}

/// Raw tunnel with bandwidth accounting. Tunneled bytes count once in each
/// direction of the bandwidth totals.
pub async fn splice_tunnel<A, B>(client: A, upstream: B, inputs: &Arc<ProxyInputs>)
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	inputs.metrics.spliced_tunnels.inc();
	let counters = SpliceCounters::new();
	if let Err(e) = splice(client, upstream, &counters).await {
		debug!(err = %e, "tunnel ended with error");
	}
	let (sent, received) = counters.totals();
	inputs.metrics.bytes_in.inc_by(received);
	inputs.metrics.bytes_out.inc_by(received);
	trace!(sent, received, "tunnel complete");
}

pin_project! {
	/// Wraps a stream and records every byte the peer sent, so a failed TLS
	/// handshake can be replayed against the upstream when falling back to a
	/// raw tunnel.
	pub struct Recorded<S> {
		#[pin]
		inner: S,
		consumed: Vec<u8>,
	}
}

impl<S> Recorded<S> {
	pub fn new(inner: S) -> Self {
		Recorded {
			inner,
			consumed: Vec::new(),
		}
	}

	pub fn into_parts(self) -> (S, Vec<u8>) {
		(self.inner, self.consumed)
	}
}

impl<S: AsyncRead> AsyncRead for Recorded<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let me = self.project();
		let before = buf.filled().len();
		let result = me.inner.poll_read(cx, buf);
		if let Poll::Ready(Ok(())) = &result {
			me.consumed.extend_from_slice(&buf.filled()[before..]);
		}
		result
	}
}

impl<S: AsyncWrite> AsyncWrite for Recorded<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn recorded_stream_captures_reads() {
		let (mut a, b) = tokio::io::duplex(64);
		let mut recorded = Recorded::new(b);
		a.write_all(b"client hello bytes").await.unwrap();
		let mut buf = vec![0u8; 18];
		recorded.read_exact(&mut buf).await.unwrap();
		let (_inner, consumed) = recorded.into_parts();
		assert_eq!(consumed, b"client hello bytes");
	}

	#[tokio::test]
	async fn recorded_stream_passes_writes_through() {
		let (mut a, b) = tokio::io::duplex(64);
		let mut recorded = Recorded::new(b);
		recorded.write_all(b"reply").await.unwrap();
		let mut buf = vec![0u8; 5];
		a.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"reply");
		let (_inner, consumed) = recorded.into_parts();
		assert!(consumed.is_empty());
	}
}
