use binding_controller_k8s_api::Scheme;
use std::{fmt, str::FromStr};

/// The routing 4-tuple parsed from an endpoint's public URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hostport {
    pub scheme: Scheme,
    pub service_name: String,
    pub namespace: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HostportError {
    #[error("public URL is empty")]
    Empty,

    #[error("invalid URL {url:?}: {source}")]
    Invalid {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("URL scheme {scheme} conflicts with endpoint protocol {protocol}")]
    ProtocolMismatch { scheme: String, protocol: String },

    #[error("hostname {0:?} must be of the form <service>.<namespace>")]
    Hostname(String),

    #[error("{0:?} must specify a port")]
    MissingPort(String),
}

/// Parses an endpoint's public URL into a [`Hostport`].
///
/// `protocol` is the endpoint's declared protocol and may be empty. When the
/// URL carries no scheme, the protocol is used, falling back to `https`. The
/// port defaults by scheme (`http` 80, `https`/`tls` 443); `tcp` URLs must
/// name a port.
pub fn parse_hostport(protocol: &str, public_url: &str) -> Result<Hostport, HostportError> {
    let public_url = public_url.trim();
    if public_url.is_empty() {
        return Err(HostportError::Empty);
    }

    let url = if public_url.contains("://") {
        public_url.to_string()
    } else {
        let scheme = if protocol.is_empty() {
            "https"
        } else {
            protocol
        };
        format!("{scheme}://{public_url}")
    };

    let parsed = url::Url::parse(&url).map_err(|source| HostportError::Invalid {
        url: url.clone(),
        source,
    })?;

    if !protocol.is_empty() && parsed.scheme() != protocol {
        return Err(HostportError::ProtocolMismatch {
            scheme: parsed.scheme().to_string(),
            protocol: protocol.to_string(),
        });
    }

    let scheme = parsed
        .scheme()
        .parse::<Scheme>()
        .map_err(|_| HostportError::UnsupportedScheme(parsed.scheme().to_string()))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| HostportError::Hostname(String::new()))?;
    let (service_name, namespace) = match host.split('.').collect::<Vec<_>>()[..] {
        [service, namespace] if is_dns_label(service) && is_dns_label(namespace) => {
            (service.to_string(), namespace.to_string())
        }
        _ => return Err(HostportError::Hostname(host.to_string())),
    };

    // `Url::port` elides the port when it is the default for a special scheme
    // (http/https), so fall back to the scheme's default.
    let port = parsed
        .port()
        .or_else(|| scheme.default_port())
        .ok_or_else(|| HostportError::MissingPort(url.clone()))?;

    Ok(Hostport {
        scheme,
        service_name,
        namespace,
        port,
    })
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

// === impl Hostport ===

impl Hostport {
    /// The `service.namespace` host.
    pub fn host(&self) -> String {
        format!("{}.{}", self.service_name, self.namespace)
    }
}

impl fmt::Display for Hostport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}.{}:{}",
            self.scheme, self.service_name, self.namespace, self.port
        )
    }
}

impl FromStr for Hostport {
    type Err = HostportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hostport("", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp(scheme: Scheme, service: &str, ns: &str, port: u16) -> Hostport {
        Hostport {
            scheme,
            service_name: service.to_string(),
            namespace: ns.to_string(),
            port,
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(
            parse_hostport("", "service.namespace").unwrap().to_string(),
            "https://service.namespace:443"
        );
        assert_eq!(
            parse_hostport("http", "service.namespace")
                .unwrap()
                .to_string(),
            "http://service.namespace:80"
        );
        assert_eq!(
            parse_hostport("tls", "service.namespace").unwrap(),
            hp(Scheme::Tls, "service", "namespace", 443)
        );
        assert_eq!(
            parse_hostport("https", "https://service.namespace").unwrap(),
            hp(Scheme::Https, "service", "namespace", 443)
        );
    }

    #[test]
    fn explicit_ports() {
        assert_eq!(
            parse_hostport("tcp", "tcp://db.data:5432").unwrap(),
            hp(Scheme::Tcp, "db", "data", 5432)
        );
        assert_eq!(
            parse_hostport("", "https://web.prod:8443").unwrap(),
            hp(Scheme::Https, "web", "prod", 8443)
        );
        assert_eq!(
            parse_hostport("http", "web.prod:8080").unwrap(),
            hp(Scheme::Http, "web", "prod", 8080)
        );
    }

    #[test]
    fn rejects() {
        assert_eq!(parse_hostport("https", ""), Err(HostportError::Empty));
        assert_eq!(parse_hostport("", "   "), Err(HostportError::Empty));
        assert!(matches!(
            parse_hostport("", "https://svc.ns:99999"),
            Err(HostportError::Invalid { .. })
        ));
        assert_eq!(
            parse_hostport("", "svc"),
            Err(HostportError::Hostname("svc".into()))
        );
        assert_eq!(
            parse_hostport("", "a.b.c"),
            Err(HostportError::Hostname("a.b.c".into()))
        );
        assert_eq!(
            parse_hostport("http", "https://svc.ns"),
            Err(HostportError::ProtocolMismatch {
                scheme: "https".into(),
                protocol: "http".into(),
            })
        );
        assert_eq!(
            parse_hostport("tcp", "svc.ns"),
            Err(HostportError::MissingPort("tcp://svc.ns".into()))
        );
        assert_eq!(
            parse_hostport("", "udp://svc.ns:53"),
            Err(HostportError::UnsupportedScheme("udp".into()))
        );
        assert!(matches!(
            parse_hostport("tls", "tls://Svc.ns:443"),
            Err(HostportError::Hostname(_))
        ));
    }

    #[test]
    fn render_then_parse() {
        for scheme in [Scheme::Tcp, Scheme::Http, Scheme::Https, Scheme::Tls] {
            for port in [1, 80, 443, 8080, 65535] {
                let tuple = hp(scheme, "my-svc", "ns-1", port);
                assert_eq!(tuple.to_string().parse::<Hostport>(), Ok(tuple.clone()));
            }
        }
    }
}
