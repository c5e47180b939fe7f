use percent_encoding::percent_decode_str;

use crate::query::QueryMap;

/// A package request URL, decomposed.
///
/// `/lodash@4.17.21/map.js?module` becomes name `lodash`, version `4.17.21`,
/// pathname `/map.js`, filename `map.js`, search `?module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPackageUrl {
    pub package_name: String,
    /// The literal `"latest"` when the URL names no version.
    pub package_version: String,
    /// In-package subpath, slash-collapsed; empty when the URL stops at the
    /// package name.
    pub pathname: String,
    /// Last non-empty segment of `pathname`, or empty.
    pub filename: String,
    pub search: String,
    pub query: QueryMap,
}

/// Parse a raw request URL against the package URL grammar
/// `/{@scope/}name{@version}{/subpath}`.
///
/// Returns None when the path does not fit the grammar or carries malformed
/// percent-encoding. The version is opaque text up to the next slash; range
/// and pre-release strings pass through untouched for the origin to resolve.
pub fn parse_package_url(raw_url: &str) -> Option<ParsedPackageUrl> {
    let (raw_path, raw_query) = match raw_url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_url, ""),
    };

    let path = decode_path(raw_path)?;
    let rest = path.strip_prefix('/')?;

    let (package_name, rest) = parse_package_name(rest)?;

    let (package_version, rest) = match rest.strip_prefix('@') {
        Some(after) => {
            let end = after.find('/').unwrap_or(after.len());
            if end == 0 {
                // `@` with nothing behind it
                return None;
            }
            (after[..end].to_string(), &after[end..])
        }
        None => ("latest".to_string(), rest),
    };

    let pathname = collapse_slashes(rest);
    let filename = pathname
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
        .to_string();

    let query = QueryMap::parse(raw_query);
    let search = query.to_search();

    Some(ParsedPackageUrl {
        package_name,
        package_version,
        pathname,
        filename,
        search,
        query,
    })
}

/// The leading name of the path: either `name` or `@scope/name`, each
/// segment taken up to the next structural `/` or `@`.
fn parse_package_name(rest: &str) -> Option<(String, &str)> {
    if let Some(scoped) = rest.strip_prefix('@') {
        let (scope, after) = take_segment(scoped)?;
        let after = after.strip_prefix('/')?;
        let (name, after) = take_segment(after)?;
        Some((format!("@{}/{}", scope, name), after))
    } else {
        let (name, after) = take_segment(rest)?;
        Some((name.to_string(), after))
    }
}

/// A name segment: non-empty, no `/` or `@`, not a relative path component.
fn take_segment(s: &str) -> Option<(&str, &str)> {
    let end = s.find(['/', '@']).unwrap_or(s.len());
    let segment = &s[..end];
    if segment.is_empty() || segment == "." || segment == ".." {
        return None;
    }
    Some((segment, &s[end..]))
}

/// Strict percent-decoding: every `%` must introduce a two-hex-digit escape
/// and the decoded bytes must form valid UTF-8.
fn decode_path(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(path)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

fn collapse_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}
