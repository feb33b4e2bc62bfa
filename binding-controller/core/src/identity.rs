use uuid::Uuid;

/// Namespace for name-based (v5) UUIDs derived from endpoint URIs.
const NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b1e_8d44_4a8e_9b3f_0c55_d1a7_e2f4);

const PREFIX: &str = "ep-";

/// Derives the stable resource name of the BoundEndpoint for a canonical
/// endpoint URI.
///
/// The result is a valid DNS label (lowercase hex and dashes, 39 characters)
/// and depends only on the URI.
pub fn identity(endpoint_uri: &str) -> String {
    let id = Uuid::new_v5(&NAMESPACE, endpoint_uri.as_bytes());
    format!("{PREFIX}{}", id.hyphenated())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_and_dns_safe() {
        let a = identity("https://svc.ns:443");
        assert_eq!(a, identity("https://svc.ns:443"));
        assert_ne!(a, identity("https://svc.ns:8443"));
        assert_ne!(a, identity("tls://svc.ns:443"));

        assert!(a.len() <= 63, "{a} is too long");
        assert!(a.starts_with(PREFIX));
        assert!(a
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'));
        assert!(!a.ends_with('-'));
    }
}
