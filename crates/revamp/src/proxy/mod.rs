pub mod httpproxy;
pub mod lifecycle;
pub mod mitm;
pub mod socks5;

use http::StatusCode;

use crate::fetch::FetchError;
use crate::http::{Response, empty_response, plaintext_response};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request")]
	InvalidRequest,
	#[error("request body too large")]
	BodyTooLarge,
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("upstream unreachable: {0}")]
	UpstreamUnreachable(String),
	#[error("a request hook rejected the request: {0}")]
	HookRejected(String),
	#[error("waiting on a concurrent identical request failed: {0}")]
	FlightFailed(String),
	#[error("processing failed: {0}")]
	Processing(String),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
			ProxyError::HookRejected(_) => StatusCode::BAD_GATEWAY,
			ProxyError::FlightFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn into_response(self) -> Response {
		plaintext_response(self.status(), self.to_string())
	}
}

impl From<FetchError> for ProxyError {
	fn from(e: FetchError) -> Self {
		match e {
			FetchError::Timeout => ProxyError::UpstreamTimeout,
			FetchError::Unreachable(msg) => ProxyError::UpstreamUnreachable(msg),
			FetchError::TooLarge(cap) => {
				ProxyError::UpstreamUnreachable(format!("body exceeded {cap} byte cap"))
			},
		}
	}
}

/// The synthetic answers for blocked requests: 204 for tracking pixels, an
/// empty 200 JS body for scripts.
pub fn blocked_response(kind: crate::filter::BlockKind) -> Response {
	match kind {
		crate::filter::BlockKind::TrackingPixel => empty_response(StatusCode::NO_CONTENT),
		crate::filter::BlockKind::Script => ::http::Response::builder()
			.status(StatusCode::OK)
			.header(::http::header::CONTENT_TYPE, "application/javascript")
			.body(crate::http::empty_body())
			.expect("builder with known status code should not fail"),
	}
}
