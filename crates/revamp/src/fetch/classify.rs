use once_cell::sync::Lazy;
use regex::Regex;

use crate::transform::ContentType;

/// MIME-first classification; URL suffix decides when the header is absent
/// or unhelpful. The first hit wins.
pub fn classify(content_type: Option<&str>, url: &str) -> ContentType {
	if let Some(header) = content_type {
		let mime = header
			.split(';')
			.next()
			.unwrap_or("")
			.trim()
			.to_ascii_lowercase();
		match mime.as_str() {
			"application/javascript" | "text/javascript" | "application/x-javascript"
			| "application/ecmascript" | "text/ecmascript" => return ContentType::Js,
			"text/css" => return ContentType::Css,
			"text/html" | "application/xhtml+xml" => return ContentType::Html,
			"image/webp" => return ContentType::ImageWebp,
			"image/avif" => return ContentType::ImageAvif,
			_ => {},
		}
		// A concrete non-matching MIME that is clearly not generic wins over
		// the suffix; generic types fall through to the URL.
		if !mime.is_empty()
			&& mime != "application/octet-stream"
			&& mime != "text/plain"
		{
			return ContentType::Other;
		}
	}
	match url_suffix(url) {
		Some("js") | Some("mjs") | Some("jsx") => ContentType::Js,
		Some("css") => ContentType::Css,
		Some("html") | Some("htm") => ContentType::Html,
		Some("webp") => ContentType::ImageWebp,
		Some("avif") => ContentType::ImageAvif,
		_ => ContentType::Other,
	}
}

/// The declared charset, if any.
pub fn charset_of(content_type: Option<&str>) -> Option<String> {
	let header = content_type?;
	header
		.split(';')
		.skip(1)
		.filter_map(|param| {
			let mut kv = param.splitn(2, '=');
			let key = kv.next()?.trim().to_ascii_lowercase();
			let value = kv.next()?.trim().trim_matches('"');
			(key == "charset").then(|| value.to_ascii_lowercase())
		})
		.next()
}

// Versioned asset paths that carry no usable suffix, e.g. webpack chunk URLs.
static SCRIPT_PATH_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)/(js|javascript|scripts?|css|styles?)(/|$)").expect("static regex"));

/// Whether the URL looks like JS or CSS by path pattern or suffix. Used to
/// strip conditional headers so a full body is always available for
/// re-transformation. Cheap suffix checks run before the regex.
pub fn is_script_or_style_url(url: &str) -> bool {
	match url_suffix(url) {
		Some("js") | Some("mjs") | Some("jsx") | Some("css") => return true,
		Some(_) => return false,
		None => {},
	}
	SCRIPT_PATH_RE.is_match(path_of(url))
}

fn path_of(url: &str) -> &str {
	let without_fragment = url.split('#').next().unwrap_or(url);
	without_fragment.split('?').next().unwrap_or(without_fragment)
}

fn url_suffix(url: &str) -> Option<&str> {
	let path = path_of(url);
	let last_segment = path.rsplit('/').next()?;
	let (stem, ext) = last_segment.rsplit_once('.')?;
	if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
		return None;
	}
	Some(ext)
}
