//! Origin key derivation.
//!
//! An origin is `scheme://host[:port]` as in RFC 9110 section 4.3.1, with the
//! host lower-cased and the port left out when it is the scheme's default.

use reqwest::Request;
use url::Url;

/// Serialize the origin of `url`.
///
/// The `url` crate already drops default ports for the special schemes and
/// normalizes numeric ports, so `http://Example.COM:0080/a` becomes
/// `http://example.com`. Hosts of non-special schemes are lower-cased here
/// as well. A port of zero is treated as absent.
pub fn origin(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_lowercase();

    match url.port().filter(|port| *port != 0) {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

/// Key function that groups requests by the origin of their target URL.
pub fn target_origin(request: &Request) -> String {
    origin(request.url())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn origin_of(input: &str) -> String {
        origin(&Url::parse(input).unwrap())
    }

    #[test]
    fn test_origin_drops_path_and_query() {
        assert_eq!(
            origin_of("https://api.github.com/repos/user/repo?page=2#top"),
            "https://api.github.com"
        );
    }

    #[test]
    fn test_origin_lowercases_host() {
        assert_eq!(origin_of("HTTPS://API.GitHub.COM/"), "https://api.github.com");
        assert_eq!(origin_of("custom://MixedCase.Example/x"), "custom://mixedcase.example");
    }

    #[test]
    fn test_origin_omits_default_port() {
        assert_eq!(origin_of("http://example.com:80/"), "http://example.com");
        assert_eq!(origin_of("https://example.com:443/"), "https://example.com");
    }

    #[test]
    fn test_origin_strips_leading_zeros() {
        assert_eq!(origin_of("http://example.com:0080/"), "http://example.com");
        assert_eq!(origin_of("http://example.com:08080/"), "http://example.com:8080");
    }

    #[test]
    fn test_origin_keeps_explicit_port() {
        assert_eq!(origin_of("http://example.com:443/"), "http://example.com:443");
        assert_eq!(origin_of("https://example.com:8443/"), "https://example.com:8443");
    }

    #[test]
    fn test_origin_ipv6() {
        assert_eq!(origin_of("http://[::1]:3000/"), "http://[::1]:3000");
    }

    #[test]
    fn test_origin_subdomains_are_distinct() {
        assert_ne!(origin_of("https://api.github.com/"), origin_of("https://www.github.com/"));
        assert_ne!(origin_of("http://github.com/"), origin_of("https://github.com/"));
    }

    #[test]
    fn test_target_origin() {
        let request = Request::new(Method::GET, Url::parse("https://Example.com:443/a/b").unwrap());
        assert_eq!(target_origin(&request), "https://example.com");
    }
}
