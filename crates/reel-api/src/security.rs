//! Enqueue input checks: source URL allowlisting and job id shape.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

pub const MAX_URL_LENGTH: usize = 2048;

/// Registrable domains of the platforms the downloader understands.
///
/// Any subdomain of an entry is accepted too.
const PLATFORM_DOMAINS: &[&str] = &[
    "instagram.com",
    "instagr.am",
    "tiktok.com",
    "youtube.com",
    "youtu.be",
    "facebook.com",
    "fb.watch",
];

/// Host names that resolve to the local machine or cloud metadata services.
static INTERNAL_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(localhost|metadata)(\.|$)|\.(internal|local|localhost)$")
        .expect("static regex")
});

/// Why a source URL was refused. The message is returned to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("URL must not be empty")]
    Empty,

    #[error("URL is longer than {} characters", MAX_URL_LENGTH)]
    TooLong,

    #[error("URL could not be parsed: {0}")]
    Malformed(String),

    #[error("scheme '{0}' is not allowed, use http or https")]
    Scheme(String),

    #[error("URL targets an internal or restricted address")]
    Internal,

    #[error("'{0}' is not a supported platform, use an Instagram, TikTok, YouTube Shorts or Facebook link")]
    Platform(String),
}

/// Check a reel source URL and return its normalized form.
///
/// Order: length, syntax, scheme, internal targets, platform allowlist.
pub fn validate_reel_url(raw: &str) -> Result<String, UrlRejection> {
    if raw.len() > MAX_URL_LENGTH {
        return Err(UrlRejection::TooLong);
    }
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UrlRejection::Empty);
    }

    let url = Url::parse(raw).map_err(|e| UrlRejection::Malformed(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlRejection::Scheme(url.scheme().to_string()));
    }

    let host = match url.host() {
        Some(host) => host,
        None => return Err(UrlRejection::Malformed("missing host".to_string())),
    };
    let domain = match host {
        Host::Domain(name) if !INTERNAL_HOST.is_match(name) => name.to_ascii_lowercase(),
        Host::Domain(_) => return Err(internal(raw)),
        Host::Ipv4(ip) if is_internal(IpAddr::V4(ip)) => return Err(internal(raw)),
        Host::Ipv6(ip) if is_internal(IpAddr::V6(ip)) => return Err(internal(raw)),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };

    if !on_platform(&domain) {
        return Err(UrlRejection::Platform(domain));
    }
    Ok(url.into())
}

fn internal(raw: &str) -> UrlRejection {
    warn!(url = %raw, "Refused URL targeting an internal address");
    UrlRejection::Internal
}

fn is_internal(ip: IpAddr) -> bool {
    let v4_internal = |v4: Ipv4Addr| {
        v4.is_loopback()
            || v4.is_private()
            || v4.is_link_local()
            || v4.is_broadcast()
            || v4.octets()[0] == 0
    };
    match ip {
        IpAddr::V4(v4) => v4_internal(v4),
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 and fe80::/10
                || head & 0xfe00 == 0xfc00
                || head & 0xffc0 == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(v4_internal)
        }
    }
}

/// `domain` equals a platform domain or is one of its subdomains.
fn on_platform(domain: &str) -> bool {
    PLATFORM_DOMAINS.iter().any(|platform| {
        domain == *platform
            || domain
                .strip_suffix(platform)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Job ids are ASCII alphanumerics and hyphens, at most 64 long.
pub fn is_valid_job_id(id: &str) -> bool {
    (1..=64).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_platform_links() {
        for url in [
            "https://www.instagram.com/reel/C1a2B3c4D5e/",
            "https://www.tiktok.com/@someone/video/7300000000000000000",
            "https://vm.tiktok.com/ZMabc123/",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://fb.watch/abcdef/",
            "https://business.instagram.com/reel/abc",
        ] {
            assert!(validate_reel_url(url).is_ok(), "{url}");
        }
    }

    #[test]
    fn test_returns_normalized_url() {
        assert_eq!(
            validate_reel_url("  HTTPS://WWW.Instagram.com/reel/abc ").unwrap(),
            "https://www.instagram.com/reel/abc"
        );
    }

    #[test]
    fn test_refuses_internal_targets() {
        for url in [
            "http://127.0.0.1/video.mp4",
            "http://localhost/video.mp4",
            "http://192.168.1.1/video.mp4",
            "http://0.0.0.0/",
            "http://169.254.169.254/latest/meta-data/",
            "http://metadata.google.internal/computeMetadata/v1/",
            "http://[::1]/",
            "http://[::ffff:10.0.0.1]/",
        ] {
            assert_eq!(validate_reel_url(url), Err(UrlRejection::Internal), "{url}");
        }
    }

    #[test]
    fn test_refuses_other_platforms() {
        assert!(matches!(
            validate_reel_url("https://vimeo.com/123456789"),
            Err(UrlRejection::Platform(_))
        ));
        assert!(matches!(
            validate_reel_url("https://instagram.com.evil.example/reel/x"),
            Err(UrlRejection::Platform(_))
        ));
        assert!(matches!(
            validate_reel_url("https://notinstagram.com/reel/x"),
            Err(UrlRejection::Platform(_))
        ));
        assert!(matches!(
            validate_reel_url("https://8.8.8.8/reel/x"),
            Err(UrlRejection::Platform(_))
        ));
    }

    #[test]
    fn test_refuses_malformed_input() {
        assert!(matches!(
            validate_reel_url("ftp://instagram.com/reel"),
            Err(UrlRejection::Scheme(_))
        ));
        assert!(matches!(
            validate_reel_url("javascript:alert(1)"),
            Err(UrlRejection::Scheme(_))
        ));
        assert_eq!(validate_reel_url("   "), Err(UrlRejection::Empty));
        assert!(matches!(
            validate_reel_url("not a url"),
            Err(UrlRejection::Malformed(_))
        ));
    }

    #[test]
    fn test_too_long() {
        let url = format!("https://www.instagram.com/reel/{}", "a".repeat(MAX_URL_LENGTH));
        assert_eq!(validate_reel_url(&url), Err(UrlRejection::TooLong));
    }

    #[test]
    fn test_job_id_validation() {
        assert!(is_valid_job_id("0192f5c1-7b8e-7c3a-9d41-2f6b8e0a1c55"));
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("../etc/passwd"));
        assert!(!is_valid_job_id(&"a".repeat(65)));
    }
}
