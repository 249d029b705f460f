//! Minimal URL decomposition.
//!
//! A request needs exactly four things from its URL: the scheme (to pick
//! plain TCP or TLS), the host and port (to connect), and the path (for the
//! request line). Everything else — userinfo, query splitting, fragments,
//! percent decoding — is deliberately left to the caller, so this stays a
//! single-pass split rather than a general URL parser.

/// The pieces of a URL the engine consumes, derived once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl UrlParts {
    /// Splits `url` into scheme, host, port and path.
    ///
    /// The port defaults to 80 for `http` and 443 for `https`; for an
    /// unknown scheme it stays 0 (the scheme is rejected before connecting
    /// anyway). An explicit out-of-range port also falls back to the scheme
    /// default. A URL with no path component gets `/`.
    pub fn parse(url: &str) -> Self {
        let Some((scheme, rest)) = url.split_once(':') else {
            // no scheme separator at all, treat the whole string as a scheme
            return Self { scheme: url.to_string(), host: String::new(), port: 0, path: String::new() };
        };

        let mut parts =
            Self { scheme: scheme.to_string(), host: String::new(), port: default_port(scheme), path: String::new() };

        let Some(authority_and_path) = rest.strip_prefix("//") else {
            // scheme-relative form, e.g. "mailto:user@host"
            parts.path = rest.to_string();
            return parts;
        };

        let (authority, path) = match authority_and_path.find('/') {
            Some(slash) => (&authority_and_path[..slash], &authority_and_path[slash..]),
            None => (authority_and_path, "/"),
        };

        match authority.split_once(':') {
            Some((host, port)) => {
                parts.host = host.to_string();
                if let Some(port) = parse_port(port) {
                    parts.port = port;
                }
            }
            None => parts.host = authority.to_string(),
        }
        parts.path = path.to_string();

        parts
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

/// Leading decimal digits of `text` as a port, `None` when there are no
/// digits or the value does not fit.
fn parse_port(text: &str) -> Option<u16> {
    let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
