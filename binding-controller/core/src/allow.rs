use regex::Regex;
use std::str::FromStr;

/// Decides which endpoint URIs may be bound into the cluster.
///
/// Each pattern is matched against the whole canonical URI; `*` matches any
/// run of characters (including none).
#[derive(Clone, Debug)]
pub struct AllowPolicy {
    /// Set when some pattern is made only of `*`.
    any: bool,
    patterns: Vec<Regex>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid allow pattern {pattern:?}: {source}")]
pub struct InvalidPattern {
    pattern: String,
    #[source]
    source: regex::Error,
}

// === impl AllowPolicy ===

impl AllowPolicy {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, InvalidPattern>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self {
            any: false,
            patterns: Vec::new(),
        };
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            if pattern.bytes().all(|b| b == b'*') {
                policy.any = true;
                continue;
            }
            policy.patterns.push(glob_regex(pattern)?);
        }
        Ok(policy)
    }

    /// Permits every URI.
    pub fn allow_all() -> Self {
        Self {
            any: true,
            patterns: Vec::new(),
        }
    }

    pub fn permits(&self, uri: &str) -> bool {
        self.any || self.patterns.iter().any(|re| re.is_match(uri))
    }
}

impl Default for AllowPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl PartialEq for AllowPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
            && self.patterns.len() == other.patterns.len()
            && self
                .patterns
                .iter()
                .zip(&other.patterns)
                .all(|(a, b)| a.as_str() == b.as_str())
    }
}

impl Eq for AllowPolicy {}

impl FromStr for AllowPolicy {
    type Err = InvalidPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_patterns(s.split(',').map(str::trim))
    }
}

/// Compiles a glob into an anchored regex: literal runs are escaped and each
/// `*` becomes `.*`.
fn glob_regex(pattern: &str) -> Result<Regex, InvalidPattern> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^(?s:{body})$")).map_err(|source| InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
