use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use http::{Method, StatusCode};
use revamp_core::prelude::*;
use url::Url;

use crate::cache::{self, ESM_BUNDLE_LABEL};
use crate::config::{DomainProfile, PartialConfig};
use crate::hooks::HookPoint;
use crate::http::{
	Response, empty_response, html_response, json_error, json_response, method_not_allowed,
	plaintext_response,
};
use crate::plugins::PluginError;
use crate::{ProxyInputs, api::pac::PacKind};

pub mod pac;

/// The reserved path prefix. No upstream host is ever served under it.
pub const INTERNAL_PREFIX: &str = "/__revamp__";

const DASHBOARD_HTML: &str = include_str!("assets/dashboard.html");

/// Owns everything under `/__revamp__/*`. All responses carry permissive
/// CORS headers; `OPTIONS` preflights get an empty 204.
pub struct ApiRouter {
	inputs: Arc<ProxyInputs>,
}

impl ApiRouter {
	pub fn new(inputs: Arc<ProxyInputs>) -> Self {
		ApiRouter { inputs }
	}

	pub async fn handle(&self, req: ::http::Request<Bytes>, client_ip: IpAddr) -> Response {
		let mut response = self.route(req, client_ip).await;
		let headers = response.headers_mut();
		headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, "*".parse().expect("static header"));
		headers.insert(
			ACCESS_CONTROL_ALLOW_METHODS,
			"GET, POST, PUT, DELETE, OPTIONS".parse().expect("static header"),
		);
		headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type".parse().expect("static header"));
		response
	}

	async fn route(&self, req: ::http::Request<Bytes>, client_ip: IpAddr) -> Response {
		if req.method() == Method::OPTIONS {
			return empty_response(StatusCode::NO_CONTENT);
		}
		let full_path = req.uri().path().to_string();
		// The captive portal serves the same surface without the prefix.
		let path = full_path
			.strip_prefix(INTERNAL_PREFIX)
			.unwrap_or(&full_path)
			.trim_end_matches('/')
			.to_string();
		let query = parse_query(req.uri().query());

		match (req.method().clone(), path.as_str()) {
			(Method::GET, "" | "/") => html_response(StatusCode::OK, DASHBOARD_HTML),

			(method, "/config") => self.handle_config(method, req.body()).await,

			(Method::GET, "/metrics/json") => {
				let mut snapshot = self.inputs.metrics.snapshot();
				snapshot["cacheTiers"] = self.inputs.cache.stats();
				snapshot["hooks"] = self.inputs.hooks.stats_snapshot();
				json_response(StatusCode::OK, &snapshot)
			},
			(Method::GET, "/metrics" | "/metrics/dashboard") => {
				html_response(StatusCode::OK, DASHBOARD_HTML)
			},
			(Method::GET, "/metrics/prometheus") => {
				plaintext_response(StatusCode::OK, self.inputs.metrics.prometheus_text())
			},

			(Method::GET, p) if p.starts_with("/pac/") => {
				match PacKind::from_path(p.trim_start_matches("/pac/")) {
					Some(kind) => {
						let body = pac::render(kind, self.inputs.local_ip, &self.inputs.resolver.base());
						::http::Response::builder()
							.status(StatusCode::OK)
							.header(CONTENT_TYPE, pac::PAC_CONTENT_TYPE)
							.body(crate::http::Body::new(Bytes::from(body)))
							.expect("builder with known status code should not fail")
					},
					None => json_error(StatusCode::NOT_FOUND, "unknown PAC flavor"),
				}
			},

			(Method::GET, "/ca") => ::http::Response::builder()
				.status(StatusCode::OK)
				.header(CONTENT_TYPE, "application/x-pem-file")
				.body(crate::http::Body::new(Bytes::from(
					self.inputs.ca.cert_pem().to_string(),
				)))
				.expect("builder with known status code should not fail"),

			(Method::GET, "/sw/bundle") => self.handle_sw_bundle(&query, client_ip).await,
			(method, "/sw/bundle") if method != Method::GET => method_not_allowed("GET"),
			(Method::POST, "/sw/inline") => self.handle_sw_inline(req.body()).await,
			(_, "/sw/inline") => method_not_allowed("POST"),

			(method, "/domains") => self.handle_domains(method, None, req.body()).await,
			(method, p) if p.starts_with("/domains/") => {
				let id = p.trim_start_matches("/domains/").to_string();
				self.handle_domains(method, Some(id), req.body()).await
			},

			(Method::DELETE, "/cache") => {
				match query.get("url") {
					Some(url) => self.inputs.cache.invalidate_url(url),
					None => self.inputs.cache.invalidate_all(),
				}
				json_response(StatusCode::OK, &serde_json::json!({"invalidated": true}))
			},

			(method, p) if p == "/plugins" || p.starts_with("/plugins/") => {
				let rest = p.strip_prefix("/plugins").unwrap_or("").trim_start_matches('/');
				self.handle_plugins(method, rest.to_string(), &req).await
			},

			_ => json_error(StatusCode::NOT_FOUND, format!("no such endpoint: {path}")),
		}
	}

	async fn handle_config(&self, method: Method, body: &Bytes) -> Response {
		match method {
			Method::GET => json_response(
				StatusCode::OK,
				&serde_json::json!({"config": &*self.inputs.resolver.base()}),
			),
			Method::POST => {
				let partial: PartialConfig = match serde_json::from_slice(body) {
					Ok(p) => p,
					Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid config: {e}")),
				};
				match self.inputs.resolver.update_base(&partial) {
					Ok(updated) => json_response(StatusCode::OK, &serde_json::json!({"config": &*updated})),
					Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
				}
			},
			Method::DELETE => match self.inputs.resolver.reset_base() {
				Ok(reset) => json_response(StatusCode::OK, &serde_json::json!({"config": &*reset})),
				Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
			},
			_ => method_not_allowed("GET, POST, DELETE"),
		}
	}

	async fn handle_sw_bundle(&self, query: &HashMap<String, String>, client_ip: IpAddr) -> Response {
		let Some(raw_url) = query.get("url") else {
			return json_error(StatusCode::BAD_REQUEST, "Missing required parameter: url");
		};
		let base = self.inputs.resolver.base();
		if base.remote_service_workers {
			return json_error(
				StatusCode::BAD_REQUEST,
				"remote Service Worker mode is enabled; bundles are served by the remote runtime",
			);
		}
		let url: Url = match raw_url.parse() {
			Ok(u) => u,
			Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid url: {e}")),
		};
		let scope = query.get("scope").map(|s| s.as_str());

		let client_fp = cache::client_fingerprint(client_ip, &base);
		let key = cache::fingerprint(url.as_str(), ESM_BUNDLE_LABEL, &client_fp);
		if base.cache_enabled {
			if let Some(entry) = self.inputs.cache.get(&key, ESM_BUNDLE_LABEL).await {
				self.inputs.metrics.cache_hits.inc();
				return js_response(entry.bytes);
			}
		}
		match self.inputs.transformers.bundler.bundle(&url, scope).await {
			Ok(bundle) => {
				if base.cache_enabled {
					self.inputs.cache.put(key, url.as_str(), ESM_BUNDLE_LABEL, bundle.clone());
				}
				js_response(bundle)
			},
			Err(e) => {
				// The Service Worker bridge expects a script either way; a
				// failed bundle degrades to a no-op worker.
				warn!(%url, err = %e, "service worker bundling failed, serving fallback");
				let fallback =
					format!("/* revamp: bundling failed ({e}); this service worker is inert */\n");
				js_response(Bytes::from(fallback))
			},
		}
	}

	async fn handle_sw_inline(&self, body: &Bytes) -> Response {
		#[derive(serde::Deserialize)]
		struct InlineRequest {
			code: String,
			#[serde(default)]
			scope: Option<String>,
		}
		let parsed: InlineRequest = match serde_json::from_slice(body) {
			Ok(p) => p,
			Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
		};
		if parsed.code.is_empty() {
			return json_error(StatusCode::BAD_REQUEST, "Missing required parameter: code");
		}
		match self
			.inputs
			.transformers
			.bundler
			.bundle_inline(&parsed.code, parsed.scope.as_deref())
			.await
		{
			Ok(js) => js_response(js),
			Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
		}
	}

	async fn handle_domains(&self, method: Method, id: Option<String>, body: &Bytes) -> Response {
		match (method, id) {
			(Method::GET, None) => {
				json_response(StatusCode::OK, self.inputs.resolver.profiles.snapshot().as_ref())
			},
			(Method::POST, None) => self.upsert_domain(body, "created").await,
			(Method::PUT, Some(id)) => {
				let mut profile: DomainProfile = match serde_json::from_slice(body) {
					Ok(p) => p,
					Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid profile: {e}")),
				};
				profile.id = id;
				self.store_domain(profile, "updated").await
			},
			(Method::DELETE, Some(id)) => match self.inputs.resolver.remove_profile(&id) {
				Ok(true) => {
					self.notify_domains("deleted", &id);
					json_response(StatusCode::OK, &serde_json::json!({"deleted": id}))
				},
				Ok(false) => json_error(StatusCode::NOT_FOUND, format!("no profile {id}")),
				Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
			},
			(_, None) => method_not_allowed("GET, POST"),
			(_, Some(_)) => method_not_allowed("PUT, DELETE"),
		}
	}

	async fn upsert_domain(&self, body: &Bytes, event: &'static str) -> Response {
		let profile: DomainProfile = match serde_json::from_slice(body) {
			Ok(p) => p,
			Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid profile: {e}")),
		};
		if profile.id.is_empty() || profile.patterns.is_empty() {
			return json_error(StatusCode::BAD_REQUEST, "profile requires an id and patterns");
		}
		self.store_domain(profile, event).await
	}

	async fn store_domain(&self, profile: DomainProfile, event: &'static str) -> Response {
		let id = profile.id.clone();
		match self.inputs.resolver.upsert_profile(profile.clone()) {
			Ok(()) => {
				self.notify_domains(event, &id);
				json_response(StatusCode::OK, &profile)
			},
			Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
		}
	}

	fn notify_domains(&self, event: &str, id: &str) {
		self.inputs.hooks.notify(
			HookPoint::DomainLifecycle,
			serde_json::json!({"event": event, "id": id}),
		);
	}

	async fn handle_plugins(
		&self,
		method: Method,
		rest: String,
		req: &::http::Request<Bytes>,
	) -> Response {
		let plugins = &self.inputs.plugins;
		let body = req.body();
		let mut segments = rest.splitn(2, '/');
		let id = segments.next().unwrap_or("").to_string();
		let action = segments.next().unwrap_or("").to_string();

		// Plugin-registered sub-paths take anything the built-ins do not own.
		if !id.is_empty()
			&& !matches!(action.as_str(), "" | "activate" | "deactivate" | "reload" | "config")
		{
			if let Some(handler) = plugins.http_handler(&id, &action) {
				let mut forwarded = ::http::Request::builder()
					.method(req.method().clone())
					.uri(req.uri().clone());
				if let Some(headers) = forwarded.headers_mut() {
					*headers = req.headers().clone();
				}
				let forwarded = forwarded
					.body(body.clone())
					.expect("rebuilding an already-parsed request cannot fail");
				return handler.handle(forwarded).await;
			}
			return json_error(StatusCode::NOT_FOUND, format!("no handler for {id}/{action}"));
		}

		let result = match (method.clone(), id.as_str(), action.as_str()) {
			(Method::GET, "", "") => {
				return json_response(StatusCode::OK, &plugins.list().await);
			},
			(Method::POST, "", "") => {
				#[derive(serde::Deserialize)]
				struct LoadRequest {
					manifest: crate::plugins::PluginManifest,
					#[serde(default)]
					config: serde_json::Value,
				}
				let parsed: LoadRequest = match serde_json::from_slice(body) {
					Ok(p) => p,
					Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid manifest: {e}")),
				};
				plugins.load(parsed.manifest, parsed.config).await
			},
			(Method::POST, id, "activate") => plugins.activate(id).await,
			(Method::POST, id, "deactivate") => plugins.deactivate(id).await,
			(Method::POST, id, "reload") => plugins.reload(id).await,
			(Method::PUT, id, "config") | (Method::PUT, id, "") => {
				let config: serde_json::Value = match serde_json::from_slice(body) {
					Ok(c) => c,
					Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid config: {e}")),
				};
				plugins.configure(id, config).await
			},
			(Method::DELETE, id, "") if !id.is_empty() => plugins.unload(id).await,
			_ => return method_not_allowed("GET, POST, PUT, DELETE"),
		};
		match result {
			Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"ok": true})),
			Err(PluginError::NotFound(id)) => {
				json_error(StatusCode::NOT_FOUND, format!("plugin {id} not found"))
			},
			Err(e @ PluginError::InvalidTransition { .. }) => {
				json_error(StatusCode::BAD_REQUEST, e.to_string())
			},
			Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
		}
	}
}

fn js_response(body: Bytes) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(CONTENT_TYPE, "application/javascript; charset=UTF-8")
		.body(crate::http::Body::new(body))
		.expect("builder with known status code should not fail")
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
	query
		.map(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.into_owned()
				.collect()
		})
		.unwrap_or_default()
}
