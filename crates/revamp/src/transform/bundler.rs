use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::{SwBundler, TextKind, TextTransformer, TransformError};
use crate::config::Config;
use crate::fetch::UpstreamClient;

/// The built-in bundler: fetches the entry script and runs it through the
/// text transformer as JS. A real ES-module bundler (module graph walking,
/// import rewriting) plugs in from outside; this keeps `/sw/bundle` and
/// `/sw/inline` functional without it.
pub struct FetchBundler {
	client: Arc<UpstreamClient>,
	text: Arc<dyn TextTransformer>,
	cfg: Config,
}

impl FetchBundler {
	pub fn new(client: Arc<UpstreamClient>, text: Arc<dyn TextTransformer>, cfg: Config) -> Self {
		FetchBundler { client, text, cfg }
	}
}

#[async_trait]
impl SwBundler for FetchBundler {
	async fn bundle(&self, url: &Url, _scope: Option<&str>) -> Result<Bytes, TransformError> {
		let body = self
			.client
			.fetch_raw(url)
			.await
			.map_err(|e| TransformError::Failed(e.to_string()))?;
		self.text.transform(body, TextKind::Js, None, &self.cfg).await
	}

	async fn bundle_inline(
		&self,
		code: &str,
		_scope: Option<&str>,
	) -> Result<Bytes, TransformError> {
		self
			.text
			.transform(Bytes::from(code.to_string()), TextKind::Js, None, &self.cfg)
			.await
	}
}
