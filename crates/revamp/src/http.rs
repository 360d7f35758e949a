use bytes::Bytes;
use http_body_util::Full;

pub type Body = Full<Bytes>;
pub type Response = ::http::Response<Body>;
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

pub fn empty_body() -> Body {
	Full::new(Bytes::new())
}

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(empty_body())
		.expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: impl Into<Bytes>) -> Response {
	::http::Response::builder()
		.status(code)
		.header(::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(body.into()))
		.expect("builder with known status code should not fail")
}

pub fn html_response(code: StatusCode, body: impl Into<Bytes>) -> Response {
	::http::Response::builder()
		.status(code)
		.header(::http::header::CONTENT_TYPE, "text/html; charset=utf-8")
		.body(Full::new(body.into()))
		.expect("builder with known status code should not fail")
}

pub fn json_response<T: serde::Serialize>(code: StatusCode, value: &T) -> Response {
	let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
	::http::Response::builder()
		.status(code)
		.header(::http::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.expect("builder with known status code should not fail")
}

/// Validation failures on the internal API surface as `{"error": message}`.
pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
	json_response(code, &serde_json::json!({ "error": message.into() }))
}

pub fn method_not_allowed(allow: &str) -> Response {
	::http::Response::builder()
		.status(StatusCode::METHOD_NOT_ALLOWED)
		.header(::http::header::ALLOW, allow)
		.body(empty_body())
		.expect("builder with known status code should not fail")
}
