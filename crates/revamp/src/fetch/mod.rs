use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{
	ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
	IF_MODIFIED_SINCE, IF_NONE_MATCH, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use revamp_core::prelude::*;
use url::Url;

use crate::cache::RedirectSet;
use crate::config::Config;
use crate::telemetry::metrics::Metrics;
use crate::transform::{ContentType, Transformers};

pub mod classify;
pub mod decompress;

pub use classify::{charset_of, classify, is_script_or_style_url};

#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
	#[error("upstream timed out")]
	Timeout,
	#[error("upstream unreachable: {0}")]
	Unreachable(String),
	#[error("upstream body exceeded the {0} byte cap")]
	TooLarge(usize),
}

impl FetchError {
	pub fn status(&self) -> StatusCode {
		match self {
			FetchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			FetchError::Unreachable(_) | FetchError::TooLarge(_) => StatusCode::BAD_GATEWAY,
		}
	}
}

pub struct FetchRequest {
	pub method: Method,
	pub url: Url,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// What came back from upstream, after decompression and (where applicable)
/// transformation. Clonable so single-flight followers can share it.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub content_type: ContentType,
	pub charset: Option<String>,
	/// Raw (possibly compressed) upstream body length, for bandwidth
	/// accounting.
	pub raw_len: usize,
	pub is_redirect: bool,
	pub transformed: bool,
	/// The transformer was asked and failed; the body is the untransformed
	/// original and must not be cached.
	pub transform_failed: bool,
}

impl FetchOutcome {
	pub fn cacheable(&self) -> bool {
		!self.is_redirect && self.transformed && !self.transform_failed
	}
}

/// The upstream fetch engine: HTTP/1.1 with relaxed certificate verification
/// (the MITM layer is already inspecting content), no redirect following, no
/// automatic decompression.
pub struct UpstreamClient {
	client: reqwest::Client,
	timeout: Duration,
	body_cap: usize,
	metrics: Arc<Metrics>,
}

const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

pub fn is_redirect_status(status: StatusCode) -> bool {
	REDIRECT_STATUSES.contains(&status.as_u16())
}

impl UpstreamClient {
	pub fn new(timeout: Duration, body_cap: usize, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.http1_only()
			.redirect(reqwest::redirect::Policy::none())
			.danger_accept_invalid_certs(true)
			.no_proxy()
			.connect_timeout(Duration::from_secs(10))
			.build()?;
		Ok(UpstreamClient {
			client,
			timeout,
			body_cap,
			metrics,
		})
	}

	/// One full upstream round trip: scrub headers, fetch, decompress,
	/// classify, transform.
	pub async fn fetch(
		&self,
		req: FetchRequest,
		cfg: &Config,
		transformers: &Transformers,
		redirects: &RedirectSet,
	) -> Result<FetchOutcome, FetchError> {
		let FetchRequest {
			method,
			url,
			mut headers,
			body,
		} = req;
		scrub_request_headers(&mut headers, &url, cfg);

		let started = Instant::now();
		let response = self
			.client
			.request(method, url.clone())
			.headers(headers)
			.body(body)
			.timeout(self.timeout)
			.send()
			.await
			.map_err(classify_reqwest_error)?;

		let status = response.status();
		let mut response_headers = response.headers().clone();
		let raw_body = self.read_capped(response).await?;
		let raw_len = raw_body.len();
		self.metrics.bytes_in.inc_by(raw_len as u64);
		scrub_response_headers(&mut response_headers);

		if is_redirect_status(status) {
			// Never transformed, never cached; remembered so later requests
			// skip the cache for this URL entirely.
			redirects.insert(url.as_str());
			debug!(%url, %status, "upstream redirect, forwarding as-is");
			return Ok(FetchOutcome {
				status,
				headers: response_headers,
				body: raw_body,
				content_type: ContentType::Other,
				charset: None,
				raw_len,
				is_redirect: true,
				transformed: false,
				transform_failed: false,
			});
		}

		let content_type_header = response_headers
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		let encoding = response_headers
			.get(CONTENT_ENCODING)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| decompress::parse_encoding(Some(v)));

		let body = match encoding {
			Some(enc) => match decompress::decompress(&raw_body, enc).await {
				Ok(inflated) => {
					response_headers.remove(CONTENT_ENCODING);
					response_headers.remove(CONTENT_LENGTH);
					inflated
				},
				Err(e) => {
					// Forward the compressed original verbatim; the client
					// asked for this encoding and can cope.
					warn!(%url, err = %e, "declared encoding did not decode, forwarding original bytes");
					raw_body
				},
			},
			None => raw_body,
		};

		let content_type = classify(content_type_header.as_deref(), url.as_str());
		let charset = charset_of(content_type_header.as_deref());
		let mut transformed = false;
		let mut transform_failed = false;
		let mut final_body = body;

		if content_type.wants_transform(cfg) {
			let result = if let Some(kind) = content_type.image_kind() {
				transformers.image.transform(final_body.clone(), kind, cfg).await
			} else if let Some(kind) = content_type.text_kind() {
				transformers
					.text
					.transform(final_body.clone(), kind, charset.as_deref(), cfg)
					.await
			} else {
				unreachable!("wants_transform covers only text and image types")
			};
			match result {
				Ok(output) => {
					transformed = true;
					final_body = output;
					if content_type.is_text() {
						let mime = match content_type {
							ContentType::Js => "application/javascript",
							ContentType::Css => "text/css",
							_ => "text/html",
						};
						response_headers.insert(
							CONTENT_TYPE,
							HeaderValue::from_str(&format!("{mime}; charset=UTF-8"))
								.expect("static mime header"),
						);
					}
					self.record_transform(content_type);
				},
				Err(e) => {
					transform_failed = true;
					self.metrics.transforms_failed.inc();
					warn!(%url, err = %e, "transformer failed, serving untransformed body");
				},
			}
		}

		trace!(%url, %status, raw_len, out_len = final_body.len(),
			elapsed_ms = started.elapsed().as_millis() as u64, "upstream fetch complete");
		Ok(FetchOutcome {
			status,
			headers: response_headers,
			body: final_body,
			content_type,
			charset,
			raw_len,
			is_redirect: false,
			transformed,
			transform_failed,
		})
	}

	/// A plain GET without transformation, used by the Service Worker
	/// bundler. Decompresses so callers always see plaintext.
	pub async fn fetch_raw(&self, url: &Url) -> Result<Bytes, FetchError> {
		let response = self
			.client
			.get(url.clone())
			.header(ACCEPT_ENCODING, "gzip, deflate")
			.timeout(self.timeout)
			.send()
			.await
			.map_err(classify_reqwest_error)?;
		let encoding = response
			.headers()
			.get(CONTENT_ENCODING)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| decompress::parse_encoding(Some(v)));
		let raw = self.read_capped(response).await?;
		self.metrics.bytes_in.inc_by(raw.len() as u64);
		match encoding {
			Some(enc) => decompress::decompress(&raw, enc)
				.await
				.map_err(|e| FetchError::Unreachable(format!("undecodable body: {e}"))),
			None => Ok(raw),
		}
	}

	async fn read_capped(&self, mut response: reqwest::Response) -> Result<Bytes, FetchError> {
		let mut buf = BytesMut::new();
		while let Some(chunk) = response.chunk().await.map_err(classify_reqwest_error)? {
			if buf.len() + chunk.len() > self.body_cap {
				return Err(FetchError::TooLarge(self.body_cap));
			}
			buf.extend_from_slice(&chunk);
		}
		Ok(buf.freeze())
	}

	fn record_transform(&self, content_type: ContentType) {
		match content_type {
			ContentType::Js => self.metrics.transforms_js.inc(),
			ContentType::Css => self.metrics.transforms_css.inc(),
			ContentType::Html => self.metrics.transforms_html.inc(),
			ContentType::ImageWebp | ContentType::ImageAvif => self.metrics.transforms_image.inc(),
			ContentType::Other => 0,
		};
	}
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
	if e.is_timeout() {
		FetchError::Timeout
	} else {
		FetchError::Unreachable(e.to_string())
	}
}

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const PROXY_AUTHORIZATION: HeaderName = HeaderName::from_static("proxy-authorization");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

fn scrub_request_headers(headers: &mut HeaderMap, url: &Url, cfg: &Config) {
	// Hop-by-hop and proxy-only headers never travel upstream; reqwest owns
	// Host and Content-Length.
	for name in [
		CONNECTION,
		TE,
		TRAILER,
		TRANSFER_ENCODING,
		UPGRADE,
		HOST,
		CONTENT_LENGTH,
	] {
		headers.remove(&name);
	}
	headers.remove(&PROXY_CONNECTION);
	headers.remove(&PROXY_AUTHORIZATION);
	headers.remove(&KEEP_ALIVE);

	if cfg.spoof_user_agent {
		if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
			headers.insert(USER_AGENT, ua);
		}
	}
	// A 304 would leave us with nothing to transform.
	if is_script_or_style_url(url.as_str()) {
		headers.remove(IF_NONE_MATCH);
		headers.remove(IF_MODIFIED_SINCE);
	}
	// Brotli is deliberately absent: the decompression tier speaks gzip and
	// deflate.
	headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
}

fn scrub_response_headers(headers: &mut HeaderMap) {
	for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, CONTENT_LENGTH] {
		headers.remove(&name);
	}
	headers.remove(&KEEP_ALIVE);
}
