mod common;

use std::time::Duration;

use common::{cache_files, spawn_proxy};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn proxied_client(proxy: &common::TestProxy) -> reqwest::Client {
	reqwest::Client::builder()
		.proxy(reqwest::Proxy::http(proxy.http_proxy_url()).unwrap())
		.redirect(reqwest::redirect::Policy::none())
		.build()
		.unwrap()
}

#[tokio::test]
async fn absolute_form_request_is_proxied() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/page"))
		.respond_with(ResponseTemplate::new(200).set_body_string("<html>hello</html>"))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let resp = client
		.get(format!("{}/page", upstream.uri()))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.text().await.unwrap(), "<html>hello</html>");
}

#[tokio::test]
async fn internal_prefix_is_reserved_for_every_host() {
	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	// The host does not even resolve; the router must answer locally.
	let resp = client
		.get("http://upstream-host.invalid/__revamp__/metrics/json")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let body: serde_json::Value = resp.json().await.unwrap();
	assert!(body["requests"]["total"].is_u64());
}

#[tokio::test]
async fn metrics_grow_with_activity() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let api = reqwest::Client::new();
	let before: serde_json::Value = api
		.get(proxy.captive_url("/__revamp__/metrics/json"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();

	let client = proxied_client(&proxy);
	client
		.get(format!("{}/page", upstream.uri()))
		.send()
		.await
		.unwrap();

	let after: serde_json::Value = api
		.get(proxy.captive_url("/__revamp__/metrics/json"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(
		after["requests"]["total"].as_u64().unwrap() > before["requests"]["total"].as_u64().unwrap()
	);
	assert!(after["bandwidth"]["totalBytesIn"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn redirects_are_never_cached() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/moved.js"))
		.respond_with(
			ResponseTemplate::new(302).insert_header("Location", "http://example.com/elsewhere"),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	for _ in 0..2 {
		let resp = client
			.get(format!("{}/moved.js", upstream.uri()))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::FOUND);
		assert_eq!(resp.headers()["location"], "http://example.com/elsewhere");
	}
	// Each request hit upstream; nothing was written to the cache.
	assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(cache_files(&proxy).is_empty());
}

#[tokio::test]
async fn second_fetch_is_served_from_cache() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/app.js"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/javascript")
				.set_body_string("var x = 1;"),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let url = format!("{}/app.js", upstream.uri());
	let first = client.get(&url).send().await.unwrap().text().await.unwrap();
	let second = client.get(&url).send().await.unwrap().text().await.unwrap();
	assert_eq!(first, "var x = 1;");
	assert_eq!(first, second);
	assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_identical_misses_fetch_once() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/bundle.js"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/javascript")
				.set_body_string("function main() {}")
				.set_delay(Duration::from_millis(300)),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let url = format!("{}/bundle.js", upstream.uri());
	let mut tasks = Vec::new();
	for _ in 0..4 {
		let client = proxied_client(&proxy);
		let url = url.clone();
		tasks.push(tokio::spawn(async move {
			client.get(&url).send().await.unwrap().text().await.unwrap()
		}));
	}
	let mut bodies = Vec::new();
	for task in tasks {
		bodies.push(task.await.unwrap());
	}
	assert!(bodies.iter().all(|b| b == "function main() {}"));
	assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn ad_hosts_get_synthetic_responses() {
	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);

	// Tracking pixel: 204, empty.
	let resp = client
		.get("http://ads.doubleclick.net/pixel")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);

	// Ad script: 200 with an empty JS body.
	let resp = client
		.get("http://cdn.taboola.com/loader.js")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers()["content-type"], "application/javascript");
	assert!(resp.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_failure_maps_to_bad_gateway() {
	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let resp = client
		.get("http://127.0.0.1:1/unreachable")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn socks5_connect_splices_to_upstream() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/tunnel"))
		.respond_with(ResponseTemplate::new(200).set_body_string("through the tunnel"))
		.mount(&upstream)
		.await;
	let upstream_addr: std::net::SocketAddr = upstream.address().to_owned();

	let proxy = spawn_proxy().await;
	let mut socket = tokio::net::TcpStream::connect(proxy.socks_addr).await.unwrap();

	// Greeting: no-auth.
	socket.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut reply = [0u8; 2];
	socket.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, [0x05, 0x00]);

	// CONNECT to the mock upstream (IPv4 form).
	let std::net::IpAddr::V4(ip) = upstream_addr.ip() else {
		panic!("mock server should listen on IPv4");
	};
	let mut req = vec![0x05, 0x01, 0x00, 0x01];
	req.extend_from_slice(&ip.octets());
	req.extend_from_slice(&upstream_addr.port().to_be_bytes());
	socket.write_all(&req).await.unwrap();
	let mut rep = [0u8; 10];
	socket.read_exact(&mut rep).await.unwrap();
	assert_eq!(rep[1], 0x00);

	// Speak HTTP through the tunnel.
	let http_req = format!(
		"GET /tunnel HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
		upstream_addr
	);
	socket.write_all(http_req.as_bytes()).await.unwrap();
	let mut response = Vec::new();
	socket.read_to_end(&mut response).await.unwrap();
	let response = String::from_utf8_lossy(&response);
	assert!(response.starts_with("HTTP/1.1 200"));
	assert!(response.contains("through the tunnel"));
}

#[tokio::test]
async fn socks5_refuses_bind_command() {
	let proxy = spawn_proxy().await;
	let mut socket = tokio::net::TcpStream::connect(proxy.socks_addr).await.unwrap();
	socket.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut reply = [0u8; 2];
	socket.read_exact(&mut reply).await.unwrap();
	let mut req = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
	req.extend_from_slice(&80u16.to_be_bytes());
	socket.write_all(&req).await.unwrap();
	let mut rep = [0u8; 10];
	socket.read_exact(&mut rep).await.unwrap();
	assert_eq!(rep[1], 0x07);
}

#[tokio::test]
async fn socks5_reports_unreachable_hosts() {
	let proxy = spawn_proxy().await;
	let mut socket = tokio::net::TcpStream::connect(proxy.socks_addr).await.unwrap();
	socket.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut reply = [0u8; 2];
	socket.read_exact(&mut reply).await.unwrap();
	// Port 1 on loopback: refused.
	let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	req.extend_from_slice(&1u16.to_be_bytes());
	socket.write_all(&req).await.unwrap();
	let mut rep = [0u8; 10];
	socket.read_exact(&mut rep).await.unwrap();
	assert!(rep[1] == 0x05 || rep[1] == 0x04);
}

#[tokio::test]
async fn connect_plan_reflects_config_and_port() {
	use revamp::proxy::mitm::{ConnectPlan, plan_connect};
	let proxy = spawn_proxy().await;
	let ip = "10.0.0.9".parse().unwrap();

	// 443 with default config (transforms on): terminate.
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "www.example.com", 443).await,
		ConnectPlan::Mitm
	);
	// Other ports always splice.
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "www.example.com", 8443).await,
		ConnectPlan::Splice
	);
	// The reserved hostname and the proxy's own service ports are local.
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "revamp.local", 443).await,
		ConnectPlan::Local
	);
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "localhost", 8888).await,
		ConnectPlan::Local
	);
	// A tunnel to some other local service is not ours to answer.
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "127.0.0.1", 5432).await,
		ConnectPlan::Splice
	);
}

#[tokio::test]
async fn connect_plan_splices_when_transforms_are_off() {
	use revamp::proxy::mitm::{ConnectPlan, plan_connect};
	let mut base = revamp::config::Config::default();
	base.transform_js = false;
	base.transform_css = false;
	base.transform_html = false;
	base.targets = vec!["chrome 120".to_string()];
	let proxy = common::spawn_proxy_with(base).await;
	let ip = "10.0.0.9".parse().unwrap();
	assert_eq!(
		plan_connect(&proxy.inputs, ip, "www.example.com", 443).await,
		ConnectPlan::Splice
	);
}

#[tokio::test]
async fn upstream_sees_spoofed_ua_and_limited_encodings() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/page.js"))
		.respond_with(ResponseTemplate::new(200).set_body_string("var a;"))
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	client
		.get(format!("{}/page.js", upstream.uri()))
		.header("user-agent", "Mozilla/5.0 (iPhone; CPU iPhone OS 9_3 like Mac OS X)")
		.header("if-none-match", "\"cached-etag\"")
		.send()
		.await
		.unwrap();

	let received = upstream.received_requests().await.unwrap();
	assert_eq!(received.len(), 1);
	let headers = &received[0].headers;
	assert_eq!(
		headers.get("user-agent").unwrap().to_str().unwrap(),
		revamp::config::MODERN_USER_AGENT
	);
	assert_eq!(headers.get("accept-encoding").unwrap(), "gzip, deflate");
	// Conditional headers are stripped for script URLs so a full body comes
	// back for transformation.
	assert!(headers.get("if-none-match").is_none());
}

#[tokio::test]
async fn gzip_bodies_are_decompressed_before_the_client() {
	use tokio::io::{AsyncReadExt, BufReader};
	let mut encoder =
		async_compression::tokio::bufread::GzipEncoder::new(BufReader::new(&b"<html>zipped</html>"[..]));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed).await.unwrap();

	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/page.html"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/html")
				.insert_header("content-encoding", "gzip")
				.set_body_bytes(compressed),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let resp = client
		.get(format!("{}/page.html", upstream.uri()))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.headers().get("content-encoding").is_none());
	assert_eq!(resp.text().await.unwrap(), "<html>zipped</html>");
}

#[tokio::test]
async fn undecodable_bodies_are_forwarded_verbatim() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/broken.html"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/html")
				.insert_header("content-encoding", "gzip")
				.set_body_bytes(b"definitely not gzip".to_vec()),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let resp = client
		.get(format!("{}/broken.html", upstream.uri()))
		.send()
		.await
		.unwrap();
	// Not an error: the original bytes and their encoding header survive.
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers()["content-encoding"], "gzip");
	assert_eq!(resp.bytes().await.unwrap().as_ref(), b"definitely not gzip");
}

#[tokio::test]
async fn cache_invalidation_forces_a_refetch() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/cached.js"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/javascript")
				.set_body_string("cached()"),
		)
		.mount(&upstream)
		.await;

	let proxy = spawn_proxy().await;
	let client = proxied_client(&proxy);
	let url = format!("{}/cached.js", upstream.uri());
	client.get(&url).send().await.unwrap();
	client.get(&url).send().await.unwrap();
	assert_eq!(upstream.received_requests().await.unwrap().len(), 1);

	let api = reqwest::Client::new();
	let resp = api
		.delete(proxy.captive_url("/__revamp__/cache"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);

	client.get(&url).send().await.unwrap();
	assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}
