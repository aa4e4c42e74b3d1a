//! Key Builder
//!
//! Every key written to the ephemeral store is built here, so identical
//! logical inputs always yield byte-identical keys across components.

use std::collections::BTreeMap;
use std::fmt::Display;

/// Separator between key parts.
pub const SEPARATOR: &str = ":";

/// Prefix for session entries.
pub const SESSION_PREFIX: &str = "session";

/// Prefix for rate-limit windows.
pub const RATE_LIMIT_PREFIX: &str = "rate_limit";

/// Join key parts with [`SEPARATOR`].
pub fn build<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Key for a session: `session:<id>`.
pub fn session(session_id: &str) -> String {
    build([SESSION_PREFIX, session_id])
}

/// Key for a caller's rate-limit window: `rate_limit:<identity>`.
pub fn rate_limit(identity: &str) -> String {
    build([RATE_LIMIT_PREFIX, identity])
}

/// Builder for cache keys.
///
/// Positional parts keep their order; named qualifiers are emitted sorted
/// by name so the order in which they were supplied does not matter.
///
/// ```ignore
/// let key = CacheKey::new("characters")
///     .part("list")
///     .with("page", 2)
///     .with("category", "prophets")
///     .build();
/// assert_eq!(key, "characters:list:category:prophets:page:2");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CacheKey {
    parts: Vec<String>,
    named: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            parts: vec![namespace.into()],
            named: BTreeMap::new(),
        }
    }

    /// Append a positional part.
    pub fn part(mut self, part: impl Display) -> Self {
        self.parts.push(part.to_string());
        self
    }

    /// Add a named qualifier.
    pub fn with(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.named.insert(name.into(), value.to_string());
        self
    }

    /// Add a named qualifier only when a value is present.
    pub fn with_opt<V: Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(name, v),
            None => self,
        }
    }

    pub fn build(&self) -> String {
        let named = self
            .named
            .iter()
            .flat_map(|(k, v)| [k.as_str(), v.as_str()]);
        build(self.parts.iter().map(String::as_str).chain(named))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_joins_parts() {
        assert_eq!(build(["a", "b", "c"]), "a:b:c");
        assert_eq!(build(Vec::<String>::new()), "");
    }

    #[test]
    fn test_session_and_rate_limit_keys() {
        assert_eq!(session("abc"), "session:abc");
        assert_eq!(rate_limit("10.0.0.1"), "rate_limit:10.0.0.1");
    }

    #[test]
    fn test_cache_key_named_order_independent() {
        let a = CacheKey::new("characters")
            .part("list")
            .with("page", 1)
            .with("category", "prophets")
            .build();
        let b = CacheKey::new("characters")
            .part("list")
            .with("category", "prophets")
            .with("page", 1)
            .build();
        assert_eq!(a, b);
        assert_eq!(a, "characters:list:category:prophets:page:1");
    }

    #[test]
    fn test_cache_key_optional_qualifier() {
        let key = CacheKey::new("stats")
            .with_opt("character", None::<u32>)
            .build();
        assert_eq!(key, "stats");

        let key = CacheKey::new("stats").with_opt("character", Some(7)).build();
        assert_eq!(key, "stats:character:7");
    }
}
