use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use revamp_core::drain::DrainWatcher;
use revamp_core::prelude::*;
use tokio::net::{TcpListener, TcpStream};

use super::mitm::{self, ConnectPlan};
use super::{ProxyError, lifecycle};
use crate::api::{ApiRouter, INTERNAL_PREFIX};
use crate::http::{Response, empty_response};
use crate::{ProxyInputs, proxy::lifecycle::RequestMeta};

/// The plain-HTTP frontend: `CONNECT host:port` tunnels (same MITM policy
/// as SOCKS5) and absolute-form proxy requests.
pub async fn serve(listener: TcpListener, inputs: Arc<ProxyInputs>, drain: DrainWatcher) {
	accept_loop("http-proxy", listener, drain, move |socket, peer| {
		let inputs = inputs.clone();
		async move {
			inputs.metrics.connections_http.inc();
			serve_proxy_connection(socket, peer, inputs).await;
		}
	})
	.await;
}

/// The captive-portal listener: the API surface (dashboard, PAC files, CA
/// download) without the internal prefix requirement.
pub async fn serve_captive(listener: TcpListener, inputs: Arc<ProxyInputs>, drain: DrainWatcher) {
	accept_loop("captive-portal", listener, drain, move |socket, peer| {
		let inputs = inputs.clone();
		async move {
			mitm::serve_local(socket, strng::new("localhost"), 0, inputs, peer.ip()).await;
		}
	})
	.await;
}

/// Shared accept loop: spawn a task per connection, stop accepting when the
/// drain fires, and keep the drain incomplete until every connection task
/// has finished.
pub async fn accept_loop<F, Fut>(
	name: &'static str,
	listener: TcpListener,
	drain: DrainWatcher,
	handle: F,
) where
	F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	use futures_util::StreamExt;
	let address = listener.local_addr().ok();
	info!(component = name, ?address, "listener established");
	let mut stream = tokio_stream::wrappers::TcpListenerStream::new(listener)
		.take_until(Box::pin(drain.clone().wait_for_drain()));
	while let Some(next) = stream.next().await {
		let socket = match next {
			Ok(s) => s,
			Err(e) => {
				warn!(component = name, err = %e, "accept failed");
				continue;
			},
		};
		socket.set_nodelay(true).ok();
		let Ok(peer) = socket.peer_addr() else { continue };
		let handle = handle.clone();
		// Holding a watcher keeps the drain incomplete until this task ends.
		let connection_guard = drain.clone();
		tokio::spawn(async move {
			let _guard = connection_guard;
			handle(socket, peer).await;
		});
	}
	info!(component = name, "listener drained");
}

async fn serve_proxy_connection(socket: TcpStream, peer: SocketAddr, inputs: Arc<ProxyInputs>) {
	inputs.metrics.connections_active.inc();
	let client_ip = peer.ip();
	let service_inputs = inputs.clone();
	let service = service_fn(move |req| {
		let inputs = service_inputs.clone();
		async move {
			Ok::<_, std::convert::Infallible>(route_request(inputs, client_ip, req).await)
		}
	});
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.preserve_header_case(true)
		.serve_connection(TokioIo::new(socket), service)
		.with_upgrades();
	if let Err(e) = conn.await {
		debug!(err = %e, "proxy connection closed with error");
	}
	inputs.metrics.connections_active.dec();
}

async fn route_request(
	inputs: Arc<ProxyInputs>,
	client_ip: IpAddr,
	req: ::http::Request<Incoming>,
) -> Response {
	if req.method() == Method::CONNECT {
		return handle_connect(inputs, client_ip, req).await;
	}

	if req.uri().scheme().is_some() && req.uri().authority().is_some() {
		// Absolute-form proxy request. Proxy-only headers stop here.
		let mut req = req;
		req.headers_mut().remove("proxy-connection");
		req.headers_mut().remove("proxy-authorization");
		let meta = RequestMeta {
			client_ip,
			hostname: None,
			is_https: false,
		};
		return lifecycle::handle(inputs, meta, req).await;
	}

	// Origin-form is only meaningful when the client is talking to the proxy
	// itself.
	let host = req
		.uri()
		.host()
		.map(str::to_string)
		.or_else(|| host_header(&req));
	let is_self = host.as_deref().map(|h| inputs.is_self_host(h)).unwrap_or(false);
	if req.uri().path().starts_with(INTERNAL_PREFIX) || is_self {
		let (parts, body) = req.into_parts();
		let body = match http_body_util::Limited::new(body, inputs.cfg.body_cap)
			.collect()
			.await
		{
			Ok(collected) => collected.to_bytes(),
			Err(_) => Bytes::new(),
		};
		let req = ::http::Request::from_parts(parts, body);
		return ApiRouter::new(inputs).handle(req, client_ip).await;
	}
	ProxyError::InvalidRequest.into_response()
}

fn host_header(req: &::http::Request<Incoming>) -> Option<String> {
	req
		.headers()
		.get(::http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|h| h.split(':').next().unwrap_or(h).to_string())
}

async fn handle_connect(
	inputs: Arc<ProxyInputs>,
	client_ip: IpAddr,
	req: ::http::Request<Incoming>,
) -> Response {
	let Some(authority) = req.uri().authority().cloned() else {
		return ProxyError::InvalidRequest.into_response();
	};
	let host = strng::new(authority.host());
	let port = authority.port_u16().unwrap_or(443);
	let plan = mitm::plan_connect(&inputs, client_ip, &host, port).await;
	debug!(%host, port, ?plan, "CONNECT accepted");

	// For splice tunnels the upstream is dialed before replying 200, so
	// unreachable hosts surface as 502 instead of a dead tunnel.
	let upstream = match plan {
		ConnectPlan::Splice => match mitm::dial(&host, port).await {
			Ok(upstream) => Some(upstream),
			Err(e) => {
				return ProxyError::UpstreamUnreachable(format!("{host}:{port}: {e}")).into_response();
			},
		},
		_ => None,
	};

	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let io = TokioIo::new(upgraded);
				match plan {
					ConnectPlan::Local => {
						mitm::serve_local(io, host, port, inputs, client_ip).await;
					},
					ConnectPlan::Mitm => {
						mitm::terminate(io, host, inputs, client_ip).await;
					},
					ConnectPlan::Splice => {
						if let Some(upstream) = upstream {
							mitm::splice_tunnel(io, upstream, &inputs).await;
						}
					},
				}
			},
			Err(e) => debug!(err = %e, "CONNECT upgrade failed"),
		}
	});
	empty_response(StatusCode::OK)
}
