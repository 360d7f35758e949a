use url::Url;

use crate::config::Config;

/// How a blocked request should be answered: tracking pixels get an empty
/// 204 so `<img>` loads fail quietly, scripts get an empty 200 JS body so
/// `<script>` tags do not error out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
	TrackingPixel,
	Script,
}

// Hosts whose whole purpose is ad delivery. Suffix-matched.
const AD_HOSTS: &[&str] = &[
	"doubleclick.net",
	"googlesyndication.com",
	"googleadservices.com",
	"adservice.google.com",
	"adnxs.com",
	"adsafeprotected.com",
	"taboola.com",
	"outbrain.com",
	"criteo.com",
	"pubmatic.com",
	"rubiconproject.com",
	"moatads.com",
];

// Analytics and behavior-tracking endpoints.
const TRACKING_HOSTS: &[&str] = &[
	"google-analytics.com",
	"googletagmanager.com",
	"analytics.google.com",
	"scorecardresearch.com",
	"quantserve.com",
	"hotjar.com",
	"mouseflow.com",
	"segment.io",
	"segment.com",
	"mixpanel.com",
	"amplitude.com",
	"fullstory.com",
	"connect.facebook.net",
];

const TRACKING_PATH_MARKERS: &[&str] = &[
	"/pixel",
	"/beacon",
	"/collect",
	"/tracking/",
	"/__utm.gif",
	"/1x1.gif",
];

/// Built-in ad/tracking rules, gated by the effective config. Hook verdicts
/// are layered on top by the lifecycle controller.
pub fn evaluate(cfg: &Config, url: &Url) -> Option<BlockKind> {
	let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
	let path = url.path().to_ascii_lowercase();

	let host_blocked = (cfg.remove_ads && host_matches(&host, AD_HOSTS))
		|| (cfg.remove_tracking && host_matches(&host, TRACKING_HOSTS));
	let path_blocked =
		cfg.remove_tracking && TRACKING_PATH_MARKERS.iter().any(|m| path.contains(m));
	if !host_blocked && !path_blocked {
		return None;
	}
	Some(block_kind_for(&path))
}

fn host_matches(host: &str, suffixes: &[&str]) -> bool {
	suffixes
		.iter()
		.any(|s| host == *s || host.ends_with(&format!(".{s}")))
}

fn block_kind_for(path: &str) -> BlockKind {
	if path.ends_with(".js") || path.ends_with(".mjs") {
		BlockKind::Script
	} else {
		BlockKind::TrackingPixel
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn url(s: &str) -> Url {
		s.parse().unwrap()
	}

	#[test]
	fn ad_hosts_blocked_when_enabled() {
		let cfg = Config::default();
		assert_eq!(
			evaluate(&cfg, &url("https://ads.doubleclick.net/pixel")),
			Some(BlockKind::TrackingPixel)
		);
		assert_eq!(
			evaluate(&cfg, &url("https://securepubads.googlesyndication.com/tag.js")),
			Some(BlockKind::Script)
		);
	}

	#[test]
	fn tracking_disabled_passes_through() {
		let mut cfg = Config::default();
		cfg.remove_tracking = false;
		assert_eq!(evaluate(&cfg, &url("https://www.google-analytics.com/collect")), None);
		// Ads are still blocked independently.
		assert!(evaluate(&cfg, &url("https://x.adnxs.com/seg")).is_some());
	}

	#[test]
	fn path_markers_catch_first_party_beacons() {
		let cfg = Config::default();
		assert_eq!(
			evaluate(&cfg, &url("https://shop.example.com/tracking/__utm.gif")),
			Some(BlockKind::TrackingPixel)
		);
	}

	#[test]
	fn unrelated_hosts_pass() {
		let cfg = Config::default();
		assert_eq!(evaluate(&cfg, &url("https://example.com/app.js")), None);
		// Suffix matching must not catch lookalike domains.
		assert_eq!(evaluate(&cfg, &url("https://nothotjar.com/x")), None);
	}
}
