use http::Uri;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Remote endpoint a slot pool is bound to. Host is stored lowercased and the
/// port is always resolved, so `HTTP://Example.com` and `http://example.com:80`
/// share one pool.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port: port.unwrap_or(scheme.default_port()),
        }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let scheme = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(scheme) => {
                return Err(Error::UnsupportedScheme {
                    scheme: scheme.to_owned(),
                });
            }
            None => {
                return Err(Error::InvalidUri {
                    uri: uri.to_string(),
                });
            }
        };
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidUri {
                uri: uri.to_string(),
            })?;
        Ok(Self::new(scheme, host, uri.port_u16()))
    }

    pub fn parse(url: &str) -> Result<Self, Error> {
        let uri = parse_uri(url)?;
        Self::from_uri(&uri)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `Host` request header: the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub(crate) fn socket_authority(&self) -> String {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        if host.contains(':') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

pub(crate) fn parse_uri(url: &str) -> Result<Uri, Error> {
    url.parse::<Uri>()
        .map_err(|_| Error::InvalidUri { uri: url.to_owned() })
}

/// Origin-form request target (`/path?query`) for a request line.
pub(crate) fn request_target(uri: &Uri) -> String {
    match uri.path_and_query() {
        Some(path_and_query) if !path_and_query.as_str().is_empty() => {
            let text = path_and_query.as_str();
            if text.starts_with('/') {
                text.to_owned()
            } else {
                format!("/{text}")
            }
        }
        _ => "/".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::{Destination, Scheme, parse_uri, request_target};
    use crate::error::Error;

    #[test]
    fn destination_resolves_default_ports_and_lowercases_host() {
        let plain = Destination::parse("HTTP://API.Example.com/v1").expect("destination");
        let explicit = Destination::parse("http://api.example.com:80/other").expect("destination");
        assert_eq!(plain, explicit);
        assert_eq!(plain.port(), 80);
        assert_eq!(plain.scheme(), Scheme::Http);
        assert_eq!(plain.to_string(), "http://api.example.com:80");

        let tls = Destination::parse("https://api.example.com/").expect("destination");
        assert_eq!(tls.port(), 443);
        assert_ne!(tls, plain);
    }

    #[test]
    fn host_header_keeps_non_default_port() {
        let destination = Destination::parse("http://127.0.0.1:8080/").expect("destination");
        assert_eq!(destination.host_header(), "127.0.0.1:8080");
        assert_eq!(destination.socket_authority(), "127.0.0.1:8080");
    }

    #[test]
    fn destination_rejects_unsupported_scheme() {
        let error = Destination::parse("ftp://files.example.com/a").expect_err("ftp rejected");
        assert!(matches!(error, Error::UnsupportedScheme { scheme } if scheme == "ftp"));
    }

    #[test]
    fn request_target_includes_query() {
        let uri = parse_uri("http://api.example.com/search?q=rust").expect("uri");
        assert_eq!(request_target(&uri), "/search?q=rust");
        let bare = parse_uri("http://api.example.com").expect("uri");
        assert_eq!(request_target(&bare), "/");
    }
}
