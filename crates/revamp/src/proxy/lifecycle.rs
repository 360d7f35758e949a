use std::net::IpAddr;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use revamp_core::prelude::*;
use serde_json::Value;
use url::Url;

use super::{ProxyError, blocked_response};
use crate::api::{ApiRouter, INTERNAL_PREFIX};
use crate::cache::{self, Flight, FlightWaitError};
use crate::config::{Config, Resolved};
use crate::fetch::{FetchError, FetchOutcome, FetchRequest, classify};
use crate::filter::{self, BlockKind};
use crate::hooks::{ChainOutcome, HookPoint};
use crate::ProxyInputs;
use crate::http::Response;

/// What a single-flight leader publishes to its followers.
pub type FlightResult = Result<FetchOutcome, FetchError>;

/// Where a request came from, as established by the accepting frontend.
#[derive(Debug, Clone)]
pub struct RequestMeta {
	pub client_ip: IpAddr,
	/// CONNECT hostname for MITM-terminated requests; absolute-form requests
	/// carry their own authority.
	pub hostname: Option<Strng>,
	pub is_https: bool,
}

/// Everything known about one in-flight request. Created on entry to the
/// lifecycle controller, dropped once the response is written.
pub struct RequestContext {
	pub request_id: String,
	pub url: Url,
	pub method: Method,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub client_ip: IpAddr,
	pub hostname: Strng,
	pub is_https: bool,
	pub effective_config: Arc<Config>,
	pub matched_profile: Option<String>,
	pub start: Instant,
	/// Scratchpad owned by hooks: opaque keys carried across the chains of
	/// one request.
	pub plugin_data: serde_json::Map<String, Value>,
}

/// The central ordering for one request, after frontend framing.
pub async fn handle(
	inputs: Arc<ProxyInputs>,
	meta: RequestMeta,
	req: ::http::Request<Incoming>,
) -> Response {
	// Internal API paths are reserved for every host, before anything else
	// can touch the request.
	let (parts, body) = req.into_parts();
	let body = match collect_body(body, inputs.cfg.body_cap).await {
		Ok(b) => b,
		Err(e) => return e.into_response(),
	};
	if parts.uri.path().starts_with(INTERNAL_PREFIX) {
		let req = ::http::Request::from_parts(parts, body);
		return ApiRouter::new(inputs.clone()).handle(req, meta.client_ip).await;
	}

	let url = match absolute_url(&parts.uri, &meta) {
		Some(u) => u,
		None => return ProxyError::InvalidRequest.into_response(),
	};
	let hostname = strng::new(url.host_str().unwrap_or_default());

	inputs.metrics.requests_total.inc();
	let resolved: Resolved = inputs
		.resolver
		.resolve_with_hooks(&inputs.hooks, meta.client_ip, Some(&hostname))
		.await;

	let mut ctx = RequestContext {
		request_id: uuid::Uuid::new_v4().to_string(),
		url,
		method: parts.method,
		headers: parts.headers,
		body,
		client_ip: meta.client_ip,
		hostname,
		is_https: meta.is_https,
		effective_config: resolved.config,
		matched_profile: resolved.matched_profile,
		start: Instant::now(),
		plugin_data: serde_json::Map::new(),
	};

	let response = match run(&inputs, &mut ctx).await {
		Ok(resp) => resp,
		Err(e) => {
			inputs.metrics.requests_errors.inc();
			warn!(request_id = %ctx.request_id, url = %ctx.url, err = %e, "request failed");
			e.into_response()
		},
	};

	inputs.metrics.bytes_out.inc_by(response_len(&response) as u64);
	access_log(&inputs, &ctx, &response);
	response
}

async fn run(inputs: &Arc<ProxyInputs>, ctx: &mut RequestContext) -> Result<Response, ProxyError> {
	// Filter decision: built-in ad/tracking rules plus the hook chain.
	if let Some(kind) = filter_decision(inputs, ctx).await? {
		inputs.metrics.requests_blocked.inc();
		debug!(url = %ctx.url, ?kind, "request blocked");
		return Ok(blocked_response(kind));
	}

	// Pre-request hooks may short-circuit a response or mutate the request.
	if let Some(short_circuit) = run_request_pre(inputs, ctx).await? {
		return Ok(short_circuit);
	}

	let cfg = ctx.effective_config.clone();
	let expected_type = classify(None, ctx.url.as_str());
	let cacheable_request = cfg.cache_enabled
		&& ctx.method == Method::GET
		&& !inputs.redirects.contains(ctx.url.as_str());
	let client_fp = cache::client_fingerprint(ctx.client_ip, &cfg);
	let key = cache::fingerprint(ctx.url.as_str(), expected_type.label(), &client_fp);

	if cacheable_request && !cache_get_bypassed(inputs, ctx, &key).await {
		if let Some(entry) = inputs.cache.get(&key, expected_type.label()).await {
			inputs.metrics.cache_hits.inc();
			ctx.plugin_data.insert("cacheHit".to_string(), Value::Bool(true));
			let response = cached_response(&entry);
			return finish(inputs, ctx, response).await;
		}
		inputs.metrics.cache_misses.inc();
	}

	// Upstream fetch, single-flighted for cacheable requests so N concurrent
	// identical misses produce one fetch and one transformation.
	let outcome = if cacheable_request {
		match inputs.flights.begin(key) {
			Flight::Leader(leader) => {
				let result = do_fetch(inputs, ctx, &cfg).await;
				leader.publish(result.clone());
				let outcome = result.map_err(ProxyError::from)?;
				if outcome.cacheable() {
					inputs
						.cache
						.put(key, ctx.url.as_str(), outcome.content_type.label(), outcome.body.clone());
					inputs.hooks.notify(
						HookPoint::CacheSet,
						serde_json::json!({
							"url": ctx.url.as_str(),
							"key": key.file_name(),
							"size": outcome.body.len(),
						}),
					);
				}
				outcome
			},
			Flight::Follower(rx) => {
				let budget = inputs.cfg.upstream_timeout + inputs.cfg.hook_timeout;
				match cache::flight_wait(rx, budget).await {
					Ok(result) => result.map_err(ProxyError::from)?,
					Err(FlightWaitError::LeaderGone) => {
						// The leader was cancelled mid-flight; do our own fetch.
						do_fetch(inputs, ctx, &cfg).await.map_err(ProxyError::from)?
					},
					Err(e) => return Err(ProxyError::FlightFailed(e.to_string())),
				}
			},
		}
	} else {
		do_fetch(inputs, ctx, &cfg).await.map_err(ProxyError::from)?
	};

	let response = outcome_response(inputs, ctx, outcome).await?;
	finish(inputs, ctx, response).await
}

/// Steps shared by cached and fetched responses: the `response:post` chain
/// and the metrics notification.
async fn finish(
	inputs: &Arc<ProxyInputs>,
	ctx: &mut RequestContext,
	mut response: Response,
) -> Result<Response, ProxyError> {
	response = run_response_post(inputs, ctx, response).await?;
	inputs.hooks.notify(
		HookPoint::MetricsRecord,
		serde_json::json!({
			"requestId": ctx.request_id,
			"url": ctx.url.as_str(),
			"method": ctx.method.as_str(),
			"status": response.status().as_u16(),
			"durationMs": ctx.start.elapsed().as_millis() as u64,
			"cacheHit": ctx.plugin_data.get("cacheHit").cloned().unwrap_or(Value::Bool(false)),
		}),
	);
	Ok(response)
}

async fn filter_decision(
	inputs: &Arc<ProxyInputs>,
	ctx: &mut RequestContext,
) -> Result<Option<BlockKind>, ProxyError> {
	if let Some(kind) = filter::evaluate(&ctx.effective_config, &ctx.url) {
		return Ok(Some(kind));
	}
	if inputs.hooks.is_empty(HookPoint::FilterDecision) {
		return Ok(None);
	}
	let payload = serde_json::json!({
		"url": ctx.url.as_str(),
		"method": ctx.method.as_str(),
		"clientIp": ctx.client_ip.to_string(),
		"hostname": ctx.hostname.as_str(),
		"pluginData": Value::Object(ctx.plugin_data.clone()),
	});
	match inputs.hooks.run_chain(HookPoint::FilterDecision, payload).await {
		ChainOutcome::Stopped(payload) if payload["block"] == Value::Bool(true) => {
			let kind = if payload["kind"] == "script" {
				BlockKind::Script
			} else {
				BlockKind::TrackingPixel
			};
			Ok(Some(kind))
		},
		ChainOutcome::Stopped(_) | ChainOutcome::Completed(_) => Ok(None),
		ChainOutcome::Failed(err) => Err(ProxyError::HookRejected(err)),
	}
}

/// Runs `request:pre`. A stopping hook may substitute a response
/// (`{"response": {...}}`), signal an error (`{"error": ...}`), or mutate
/// the request (`{"url": ...}`, `{"headers": {...}}`).
async fn run_request_pre(
	inputs: &Arc<ProxyInputs>,
	ctx: &mut RequestContext,
) -> Result<Option<Response>, ProxyError> {
	if inputs.hooks.is_empty(HookPoint::RequestPre) {
		return Ok(None);
	}
	let payload = serde_json::json!({
		"url": ctx.url.as_str(),
		"method": ctx.method.as_str(),
		"clientIp": ctx.client_ip.to_string(),
		"hostname": ctx.hostname.as_str(),
		"headers": headers_to_json(&ctx.headers),
		"pluginData": Value::Object(ctx.plugin_data.clone()),
	});
	let payload = match inputs.hooks.run_chain(HookPoint::RequestPre, payload).await {
		ChainOutcome::Completed(p) | ChainOutcome::Stopped(p) => p,
		ChainOutcome::Failed(err) => return Err(ProxyError::HookRejected(err)),
	};
	if let Some(data) = payload["pluginData"].as_object() {
		ctx.plugin_data = data.clone();
	}
	if let Some(err) = payload["error"].as_str() {
		return Err(ProxyError::HookRejected(err.to_string()));
	}
	if let Some(sub) = payload["response"].as_object() {
		return Ok(Some(substitute_response(sub)));
	}
	if let Some(new_url) = payload["url"].as_str() {
		if new_url != ctx.url.as_str() {
			ctx.url = new_url
				.parse()
				.map_err(|_| ProxyError::HookRejected(format!("hook produced invalid url {new_url}")))?;
		}
	}
	if let Some(overrides) = payload["headers"].as_object() {
		apply_header_overrides(&mut ctx.headers, overrides);
	}
	Ok(None)
}

async fn cache_get_bypassed(
	inputs: &Arc<ProxyInputs>,
	ctx: &RequestContext,
	key: &cache::Fingerprint,
) -> bool {
	if inputs.hooks.is_empty(HookPoint::CacheGet) {
		return false;
	}
	let payload = serde_json::json!({
		"url": ctx.url.as_str(),
		"key": key.file_name(),
	});
	matches!(
		inputs.hooks.run_chain(HookPoint::CacheGet, payload).await,
		ChainOutcome::Stopped(p) if p["skip"] == Value::Bool(true)
	)
}

/// The upstream fetch wrapped in the `transform:pre` / `transform:post`
/// chains.
async fn do_fetch(
	inputs: &Arc<ProxyInputs>,
	ctx: &RequestContext,
	cfg: &Arc<Config>,
) -> Result<FetchOutcome, FetchError> {
	let mut effective = cfg.as_ref().clone();
	if !inputs.hooks.is_empty(HookPoint::TransformPre) {
		let payload = serde_json::json!({
			"url": ctx.url.as_str(),
			"clientIp": ctx.client_ip.to_string(),
		});
		if let ChainOutcome::Stopped(p) =
			inputs.hooks.run_chain(HookPoint::TransformPre, payload).await
		{
			if p["skipTransform"] == Value::Bool(true) {
				effective.transform_js = false;
				effective.transform_css = false;
				effective.transform_html = false;
				effective.targets = vec!["chrome 120".to_string()];
			}
		}
	}

	let request = FetchRequest {
		method: ctx.method.clone(),
		url: ctx.url.clone(),
		headers: ctx.headers.clone(),
		body: ctx.body.clone(),
	};
	let mut outcome = inputs
		.fetch
		.fetch(request, &effective, &inputs.transformers, &inputs.redirects)
		.await?;

	if !outcome.is_redirect && !inputs.hooks.is_empty(HookPoint::TransformPost) {
		let payload = serde_json::json!({
			"url": ctx.url.as_str(),
			"contentType": outcome.content_type.label(),
			"transformed": outcome.transformed,
		});
		let result = inputs.hooks.run_chain(HookPoint::TransformPost, payload).await;
		if let ChainOutcome::Completed(p) | ChainOutcome::Stopped(p) = result {
			if let Some(body) = p["body"].as_str() {
				outcome.body = Bytes::from(body.to_string());
			}
		}
	}
	Ok(outcome)
}

async fn outcome_response(
	inputs: &Arc<ProxyInputs>,
	ctx: &RequestContext,
	outcome: FetchOutcome,
) -> Result<Response, ProxyError> {
	let _ = inputs;
	let _ = ctx;
	let mut builder = ::http::Response::builder().status(outcome.status);
	if let Some(headers) = builder.headers_mut() {
		*headers = outcome.headers.clone();
	}
	builder
		.body(crate::http::Body::new(outcome.body))
		.map_err(|e| ProxyError::Processing(e.to_string()))
}

/// Runs `response:post`; a stopping hook may replace the body or headers.
async fn run_response_post(
	inputs: &Arc<ProxyInputs>,
	ctx: &mut RequestContext,
	response: Response,
) -> Result<Response, ProxyError> {
	if inputs.hooks.is_empty(HookPoint::ResponsePost) {
		return Ok(response);
	}
	let payload = serde_json::json!({
		"url": ctx.url.as_str(),
		"status": response.status().as_u16(),
		"headers": headers_to_json(response.headers()),
		"pluginData": Value::Object(ctx.plugin_data.clone()),
	});
	let payload = match inputs.hooks.run_chain(HookPoint::ResponsePost, payload).await {
		ChainOutcome::Completed(p) | ChainOutcome::Stopped(p) => p,
		ChainOutcome::Failed(err) => return Err(ProxyError::HookRejected(err)),
	};
	let (mut parts, body) = response.into_parts();
	if let Some(overrides) = payload["headers"].as_object() {
		apply_header_overrides(&mut parts.headers, overrides);
	}
	let body = match payload["body"].as_str() {
		Some(replacement) => crate::http::Body::new(Bytes::from(replacement.to_string())),
		None => body,
	};
	Ok(::http::Response::from_parts(parts, body))
}

fn cached_response(entry: &cache::CacheEntry) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(CONTENT_TYPE, mime_for_label(entry.content_label))
		.body(crate::http::Body::new(entry.bytes.clone()))
		.expect("builder with known status code should not fail")
}

fn mime_for_label(label: &str) -> &'static str {
	match label {
		"js" | cache::ESM_BUNDLE_LABEL => "application/javascript; charset=UTF-8",
		"css" => "text/css; charset=UTF-8",
		"html" => "text/html; charset=UTF-8",
		"image/webp" => "image/webp",
		"image/avif" => "image/avif",
		_ => "application/octet-stream",
	}
}

fn substitute_response(sub: &serde_json::Map<String, Value>) -> Response {
	let status = sub
		.get("status")
		.and_then(Value::as_u64)
		.and_then(|s| StatusCode::from_u16(s as u16).ok())
		.unwrap_or(StatusCode::OK);
	let body = sub
		.get("body")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string();
	let mut builder = ::http::Response::builder().status(status);
	if let Some(headers) = sub.get("headers").and_then(Value::as_object) {
		for (name, value) in headers {
			if let (Ok(name), Some(value)) = (name.parse::<HeaderName>(), value.as_str()) {
				if let Ok(value) = HeaderValue::from_str(value) {
					builder = builder.header(name, value);
				}
			}
		}
	}
	builder
		.body(crate::http::Body::new(Bytes::from(body)))
		.unwrap_or_else(|_| ProxyError::Processing("invalid substituted response".into()).into_response())
}

fn apply_header_overrides(headers: &mut HeaderMap, overrides: &serde_json::Map<String, Value>) {
	for (name, value) in overrides {
		let Ok(name) = name.parse::<HeaderName>() else {
			continue;
		};
		match value {
			Value::Null => {
				headers.remove(&name);
			},
			Value::String(s) => {
				if let Ok(value) = HeaderValue::from_str(s) {
					headers.insert(name, value);
				}
			},
			_ => {},
		}
	}
}

fn headers_to_json(headers: &HeaderMap) -> Value {
	let mut map = serde_json::Map::new();
	for (name, value) in headers {
		if let Ok(v) = value.to_str() {
			map.insert(name.as_str().to_string(), Value::String(v.to_string()));
		}
	}
	Value::Object(map)
}

fn absolute_url(uri: &::http::Uri, meta: &RequestMeta) -> Option<Url> {
	if uri.scheme().is_some() && uri.authority().is_some() {
		return uri.to_string().parse().ok();
	}
	let host = meta.hostname.as_ref()?;
	let scheme = if meta.is_https { "https" } else { "http" };
	let path_and_query = uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	format!("{scheme}://{host}{path_and_query}").parse().ok()
}

async fn collect_body(body: Incoming, cap: usize) -> Result<Bytes, ProxyError> {
	let limited = http_body_util::Limited::new(body, cap);
	match limited.collect().await {
		Ok(collected) => Ok(collected.to_bytes()),
		Err(_) => Err(ProxyError::BodyTooLarge),
	}
}

fn response_len(response: &Response) -> usize {
	use http_body::Body;
	response
		.body()
		.size_hint()
		.exact()
		.unwrap_or_default() as usize
}

fn access_log(inputs: &Arc<ProxyInputs>, ctx: &RequestContext, response: &Response) {
	let _ = inputs;
	info!(
		request_id = %ctx.request_id,
		method = %ctx.method,
		host = %ctx.hostname,
		path = ctx.url.path(),
		status = response.status().as_u16(),
		https = ctx.is_https,
		profile = ctx.matched_profile.as_deref().unwrap_or("-"),
		cache_hit = ctx.plugin_data.get("cacheHit").and_then(serde_json::Value::as_bool).unwrap_or(false),
		duration_ms = ctx.start.elapsed().as_millis() as u64,
		bytes_out = response_len(response),
		"request complete"
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn meta(https: bool, host: Option<&str>) -> RequestMeta {
		RequestMeta {
			client_ip: "10.0.0.1".parse().unwrap(),
			hostname: host.map(strng::new),
			is_https: https,
		}
	}

	#[test]
	fn absolute_form_uri_wins() {
		let uri: ::http::Uri = "http://example.com/a?b=1".parse().unwrap();
		let url = absolute_url(&uri, &meta(false, None)).unwrap();
		assert_eq!(url.as_str(), "http://example.com/a?b=1");
	}

	#[test]
	fn origin_form_uses_connect_hostname() {
		let uri: ::http::Uri = "/index.html".parse().unwrap();
		let url = absolute_url(&uri, &meta(true, Some("example.com"))).unwrap();
		assert_eq!(url.as_str(), "https://example.com/index.html");
	}

	#[test]
	fn origin_form_without_hostname_is_rejected() {
		let uri: ::http::Uri = "/index.html".parse().unwrap();
		assert!(absolute_url(&uri, &meta(false, None)).is_none());
	}

	#[test]
	fn substituted_response_carries_status_and_body() {
		let sub = serde_json::json!({
			"status": 418,
			"headers": {"x-hook": "yes"},
			"body": "teapot",
		});
		let resp = substitute_response(sub.as_object().unwrap());
		assert_eq!(resp.status().as_u16(), 418);
		assert_eq!(resp.headers()["x-hook"], "yes");
	}

	#[test]
	fn header_overrides_insert_and_remove() {
		let mut headers = HeaderMap::new();
		headers.insert("x-old", HeaderValue::from_static("1"));
		let overrides = serde_json::json!({"x-old": null, "x-new": "2"});
		apply_header_overrides(&mut headers, overrides.as_object().unwrap());
		assert!(headers.get("x-old").is_none());
		assert_eq!(headers.get("x-new").unwrap(), "2");
	}

	#[test]
	fn cached_label_maps_to_mime() {
		assert_eq!(mime_for_label("js"), "application/javascript; charset=UTF-8");
		assert_eq!(mime_for_label("esm-bundle"), "application/javascript; charset=UTF-8");
		assert_eq!(mime_for_label("weird"), "application/octet-stream");
	}
}
