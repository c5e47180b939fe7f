use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::form_urlencoded;

/// Query parameters the content pipeline recognizes. Any other key makes a
/// request non-canonical and triggers a redirect to the sanitized form, so
/// the cache-key space downstream stays bounded. Additions here are
/// compatibility changes, not configuration.
pub const KNOWN_QUERY_PARAMS: &[&str] = &["main", "meta", "module"];

// Bytes that must be escaped when rendering keys/values back into a search
// string. Everything else passes through as-is.
const SEARCH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'?');

pub fn is_known_query_param(name: &str) -> bool {
    KNOWN_QUERY_PARAMS.contains(&name)
}

/// An ordered multimap of query parameters. An empty value models a
/// value-less flag (`?meta`), which round-trips back to a bare key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    entries: Vec<(String, String)>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw query string (no leading `?`). Percent-escapes and `+`
    /// are decoded; duplicate keys and their relative order are preserved.
    pub fn parse(raw: &str) -> Self {
        let entries = form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Update the first entry named `name` in place, or append a new one.
    /// Keeps the position of an existing key stable across a rewrite.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Remove every entry named `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| k != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True iff every key is whitelisted. The empty map is canonical.
    pub fn is_canonical(&self) -> bool {
        self.entries.iter().all(|(k, _)| is_known_query_param(k))
    }

    /// A copy with every non-whitelisted entry dropped, surviving entries
    /// keeping their values and relative order.
    pub fn sanitize(&self) -> QueryMap {
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| is_known_query_param(k))
            .cloned()
            .collect();
        QueryMap { entries }
    }

    /// Render as a `?`-prefixed search string, or `""` for the empty map.
    /// Entries keep insertion order so redirect targets are deterministic;
    /// empty values render as bare keys (`?meta`, never `?meta=`).
    pub fn to_search(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("?");
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.extend(utf8_percent_encode(key, SEARCH_ESCAPE));
            if !value.is_empty() {
                out.push('=');
                out.extend(utf8_percent_encode(value, SEARCH_ESCAPE));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelisted_maps_are_canonical() {
        for raw in ["", "meta", "main=index.js", "module&meta", "main=a&meta&module"] {
            let query = QueryMap::parse(raw);
            assert!(query.is_canonical(), "{raw:?} should be canonical");
            assert_eq!(query.sanitize(), query, "sanitize must not touch {raw:?}");
        }
    }

    #[test]
    fn unknown_key_breaks_canonical_form() {
        let query = QueryMap::parse("meta&evil=1");
        assert!(!query.is_canonical());

        let sane = query.sanitize();
        assert_eq!(sane.len(), 1);
        assert!(sane.contains("meta"));
        assert!(!sane.contains("evil"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let query = QueryMap::parse("a=1&meta&b=2&module=x");
        assert_eq!(query.sanitize().sanitize(), query.sanitize());
    }

    #[test]
    fn search_preserves_order_and_flags() {
        let query = QueryMap::parse("main=index.js&meta&module");
        assert_eq!(query.to_search(), "?main=index.js&meta&module");
    }

    #[test]
    fn empty_map_serializes_to_empty_string() {
        assert_eq!(QueryMap::new().to_search(), "");
        assert_eq!(QueryMap::parse("").to_search(), "");
    }

    #[test]
    fn set_updates_in_place_or_appends() {
        let mut query = QueryMap::parse("main=a&meta=x");
        query.set("meta", "");
        query.set("module", "");
        assert_eq!(query.to_search(), "?main=a&meta&module");
    }

    #[test]
    fn values_are_escaped_on_output() {
        let mut query = QueryMap::new();
        query.set("main", "a b&c");
        assert_eq!(query.to_search(), "?main=a%20b%26c");
    }

    #[test]
    fn remove_drops_all_occurrences() {
        let mut query = QueryMap::parse("json&meta&json=1");
        query.remove("json");
        assert_eq!(query.to_search(), "?meta");
    }
}
