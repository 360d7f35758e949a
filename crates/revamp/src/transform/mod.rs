use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::config::Config;

pub mod bundler;

/// The classified type of an upstream body. Classification is MIME first,
/// then URL suffix; the first hit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
	Js,
	Css,
	Html,
	ImageWebp,
	ImageAvif,
	Other,
}

impl ContentType {
	/// The stable label used in cache fingerprints and metrics.
	pub fn label(&self) -> &'static str {
		match self {
			ContentType::Js => "js",
			ContentType::Css => "css",
			ContentType::Html => "html",
			ContentType::ImageWebp => "image/webp",
			ContentType::ImageAvif => "image/avif",
			ContentType::Other => "other",
		}
	}

	pub fn is_text(&self) -> bool {
		matches!(self, ContentType::Js | ContentType::Css | ContentType::Html)
	}

	pub fn is_image(&self) -> bool {
		matches!(self, ContentType::ImageWebp | ContentType::ImageAvif)
	}

	pub fn text_kind(&self) -> Option<TextKind> {
		match self {
			ContentType::Js => Some(TextKind::Js),
			ContentType::Css => Some(TextKind::Css),
			ContentType::Html => Some(TextKind::Html),
			_ => None,
		}
	}

	pub fn image_kind(&self) -> Option<ImageKind> {
		match self {
			ContentType::ImageWebp => Some(ImageKind::Webp),
			ContentType::ImageAvif => Some(ImageKind::Avif),
			_ => None,
		}
	}

	/// Whether the effective config asks for this type to be rewritten.
	pub fn wants_transform(&self, cfg: &Config) -> bool {
		match self {
			ContentType::Js => cfg.transform_js,
			ContentType::Css => cfg.transform_css,
			ContentType::Html => cfg.transform_html,
			ContentType::ImageWebp | ContentType::ImageAvif => cfg.wants_legacy_images(),
			ContentType::Other => false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
	Js,
	Css,
	Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
	Webp,
	Avif,
}

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
	#[error("transformer failed: {0}")]
	Failed(String),
	#[error("no transformer is installed for this content")]
	Unavailable,
}

/// Rewrites JS/CSS/HTML into output the target browsers can run. The actual
/// transpiler lives outside this crate; the proxy only owns the invocation
/// contract.
#[async_trait]
pub trait TextTransformer: Send + Sync {
	async fn transform(
		&self,
		body: Bytes,
		kind: TextKind,
		charset: Option<&str>,
		cfg: &Config,
	) -> Result<Bytes, TransformError>;
}

/// Transcodes WebP/AVIF into formats legacy browsers decode.
#[async_trait]
pub trait ImageTransformer: Send + Sync {
	async fn transform(
		&self,
		body: Bytes,
		kind: ImageKind,
		cfg: &Config,
	) -> Result<Bytes, TransformError>;
}

/// Builds a single-file Service Worker bundle from a URL or inline source.
#[async_trait]
pub trait SwBundler: Send + Sync {
	async fn bundle(&self, url: &Url, scope: Option<&str>) -> Result<Bytes, TransformError>;
	async fn bundle_inline(&self, code: &str, scope: Option<&str>)
	-> Result<Bytes, TransformError>;
}

/// The transformer set wired into the proxy. Defaults are passthrough so the
/// proxy is complete without the external transformer processes.
#[derive(Clone)]
pub struct Transformers {
	pub text: Arc<dyn TextTransformer>,
	pub image: Arc<dyn ImageTransformer>,
	pub bundler: Arc<dyn SwBundler>,
}

impl Transformers {
	pub fn passthrough() -> Self {
		Transformers {
			text: Arc::new(Passthrough),
			image: Arc::new(Passthrough),
			bundler: Arc::new(Passthrough),
		}
	}
}

/// Identity transformer: bytes out equal bytes in. Stands in wherever a real
/// transformer has not been attached.
pub struct Passthrough;

#[async_trait]
impl TextTransformer for Passthrough {
	async fn transform(
		&self,
		body: Bytes,
		_kind: TextKind,
		_charset: Option<&str>,
		_cfg: &Config,
	) -> Result<Bytes, TransformError> {
		Ok(body)
	}
}

#[async_trait]
impl ImageTransformer for Passthrough {
	async fn transform(
		&self,
		body: Bytes,
		_kind: ImageKind,
		_cfg: &Config,
	) -> Result<Bytes, TransformError> {
		Ok(body)
	}
}

#[async_trait]
impl SwBundler for Passthrough {
	async fn bundle(&self, _url: &Url, _scope: Option<&str>) -> Result<Bytes, TransformError> {
		Err(TransformError::Unavailable)
	}

	async fn bundle_inline(
		&self,
		code: &str,
		_scope: Option<&str>,
	) -> Result<Bytes, TransformError> {
		Ok(Bytes::from(code.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn labels_are_stable() {
		assert_eq!(ContentType::Js.label(), "js");
		assert_eq!(ContentType::ImageWebp.label(), "image/webp");
	}

	#[test]
	fn config_gates_transforms() {
		let mut cfg = Config::default();
		assert!(ContentType::Js.wants_transform(&cfg));
		cfg.transform_js = false;
		assert!(!ContentType::Js.wants_transform(&cfg));
		assert!(ContentType::ImageWebp.wants_transform(&cfg));
		cfg.targets = vec!["chrome 120".to_string()];
		assert!(!ContentType::ImageWebp.wants_transform(&cfg));
		assert!(!ContentType::Other.wants_transform(&cfg));
	}
}
