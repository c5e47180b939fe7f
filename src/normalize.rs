use axum::http::StatusCode;

use crate::npm_name::PackageNameValidator;
use crate::package_url::{parse_package_url, ParsedPackageUrl};
use crate::query::QueryMap;

/// The request shape the normalizer sees: path and query as received, plus
/// the original URL for reparsing and error reporting.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub path: String,
    pub query: QueryMap,
    pub raw_url: String,
}

impl RawRequest {
    pub fn new(path: impl Into<String>, raw_query: &str) -> Self {
        let path = path.into();
        let query = QueryMap::parse(raw_query);
        let raw_url = if raw_query.is_empty() {
            path.clone()
        } else {
            format!("{}?{}", path, raw_query)
        };
        Self { path, query, raw_url }
    }
}

/// Fields attached to a request that passed normalization, consumed by the
/// content stage. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub package_name: String,
    pub package_version: String,
    /// `name@version`
    pub package_spec: String,
    pub pathname: String,
    pub filename: String,
    pub search: String,
    pub query: QueryMap,
}

impl From<ParsedPackageUrl> for RequestContext {
    fn from(url: ParsedPackageUrl) -> Self {
        let package_spec = format!("{}@{}", url.package_name, url.package_version);
        Self {
            package_name: url.package_name,
            package_version: url.package_version,
            package_spec,
            pathname: url.pathname,
            filename: url.filename,
            search: url.search,
            query: url.query,
        }
    }
}

/// What the pipeline decided to do with a request. Every request produces
/// exactly one of these; redirects and rejections are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// 302 to the canonical form of the same resource.
    Redirect(String),
    /// Terminal rejection with a plain-text body.
    Reject(StatusCode, String),
    /// Hand off to the content stage.
    Forward(RequestContext),
}

pub type RuleFn = fn(&RawRequest, &dyn PackageNameValidator) -> Option<Decision>;

/// One row of the decision table.
pub struct Rule {
    pub name: &'static str,
    pub apply: RuleFn,
}

/// The normalization pipeline as an ordered decision table. Evaluation is
/// first-match-wins; each rule may assume every earlier rule declined.
pub const RULES: &[Rule] = &[
    Rule { name: "legacy-meta-prefix", apply: legacy_meta_prefix },
    Rule { name: "legacy-json-flag", apply: legacy_json_flag },
    Rule { name: "non-canonical-query", apply: non_canonical_query },
    Rule { name: "malformed-url", apply: malformed_url },
    Rule { name: "invalid-package-name", apply: invalid_package_name },
    Rule { name: "forward", apply: forward },
];

pub fn normalize(req: &RawRequest, validator: &dyn PackageNameValidator) -> Decision {
    for rule in RULES {
        if let Some(decision) = (rule.apply)(req, validator) {
            return decision;
        }
    }
    // forward declines only when the URL fails to parse, and malformed-url
    // answers that case first; this arm exists for the compiler.
    invalid_url(req)
}

fn invalid_url(req: &RawRequest) -> Decision {
    Decision::Reject(StatusCode::FORBIDDEN, format!("Invalid URL: {}", req.raw_url))
}

/// `/_meta/path` is the old spelling of `/path?meta`.
fn legacy_meta_prefix(req: &RawRequest, _: &dyn PackageNameValidator) -> Option<Decision> {
    if !req.path.starts_with("/_meta/") {
        return None;
    }
    let mut query = req.query.clone();
    query.set("meta", "");
    let stripped = &req.path["/_meta".len()..];
    Some(Decision::Redirect(format!("{}{}", stripped, query.to_search())))
}

/// `?json` is the old spelling of `?meta`.
fn legacy_json_flag(req: &RawRequest, _: &dyn PackageNameValidator) -> Option<Decision> {
    if !req.query.contains("json") {
        return None;
    }
    let mut query = req.query.clone();
    query.remove("json");
    query.set("meta", "");
    Some(Decision::Redirect(format!("{}{}", req.path, query.to_search())))
}

/// Unknown query parameters would give every cached URL an unbounded alias
/// space; strip them and let the client come back on the canonical form.
fn non_canonical_query(req: &RawRequest, _: &dyn PackageNameValidator) -> Option<Decision> {
    if req.query.is_canonical() {
        return None;
    }
    let search = req.query.sanitize().to_search();
    Some(Decision::Redirect(format!("{}{}", req.path, search)))
}

fn malformed_url(req: &RawRequest, _: &dyn PackageNameValidator) -> Option<Decision> {
    if parse_package_url(&req.raw_url).is_some() {
        return None;
    }
    Some(invalid_url(req))
}

fn invalid_package_name(
    req: &RawRequest,
    validator: &dyn PackageNameValidator,
) -> Option<Decision> {
    let url = parse_package_url(&req.raw_url)?;
    let errors = validator.validate(&url.package_name);
    if errors.is_empty() {
        return None;
    }
    Some(Decision::Reject(
        StatusCode::FORBIDDEN,
        format!(
            "Invalid package name \"{}\" ({})",
            url.package_name,
            errors.join(", ")
        ),
    ))
}

fn forward(req: &RawRequest, _: &dyn PackageNameValidator) -> Option<Decision> {
    parse_package_url(&req.raw_url).map(|url| Decision::Forward(url.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npm_name::RegistryNameRules;

    fn run(raw_url: &str) -> Decision {
        let (path, query) = match raw_url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (raw_url, ""),
        };
        normalize(&RawRequest::new(path, query), &RegistryNameRules)
    }

    /// The name of the first rule that matches, which is the branch the
    /// pipeline takes.
    fn first_rule(raw_url: &str) -> &'static str {
        let (path, query) = match raw_url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (raw_url, ""),
        };
        let req = RawRequest::new(path, query);
        RULES
            .iter()
            .find(|rule| (rule.apply)(&req, &RegistryNameRules).is_some())
            .map(|rule| rule.name)
            .expect("table is total")
    }

    #[test]
    fn meta_prefix_redirects_with_query_preserved() {
        assert_eq!(
            run("/_meta/foo/bar?x=1"),
            Decision::Redirect("/foo/bar?x=1&meta".to_string())
        );
    }

    #[test]
    fn json_flag_becomes_meta() {
        assert_eq!(run("/foo?json"), Decision::Redirect("/foo?meta".to_string()));
        assert_eq!(
            run("/foo?main=es&json=1"),
            Decision::Redirect("/foo?main=es&meta".to_string())
        );
    }

    #[test]
    fn unknown_params_are_stripped() {
        assert_eq!(run("/foo?evil=1"), Decision::Redirect("/foo".to_string()));
        assert_eq!(
            run("/foo?module&evil=1"),
            Decision::Redirect("/foo?module".to_string())
        );
    }

    #[test]
    fn unparseable_urls_are_rejected() {
        let raw = "not a valid url %%";
        let req = RawRequest {
            path: raw.to_string(),
            query: QueryMap::new(),
            raw_url: raw.to_string(),
        };
        assert_eq!(
            normalize(&req, &RegistryNameRules),
            Decision::Reject(
                StatusCode::FORBIDDEN,
                "Invalid URL: not a valid url %%".to_string()
            )
        );
    }

    #[test]
    fn invalid_names_are_rejected_with_reasons() {
        assert_eq!(
            run("/React"),
            Decision::Reject(
                StatusCode::FORBIDDEN,
                "Invalid package name \"React\" (name can no longer contain capital letters)"
                    .to_string()
            )
        );
        assert_eq!(
            run("/.Bad"),
            Decision::Reject(
                StatusCode::FORBIDDEN,
                "Invalid package name \".Bad\" (name cannot start with a period, \
                 name can no longer contain capital letters)"
                    .to_string()
            )
        );
    }

    #[test]
    fn valid_requests_forward_with_context_attached() {
        match run("/lodash@4.17.21/map.js?module") {
            Decision::Forward(ctx) => {
                assert_eq!(ctx.package_name, "lodash");
                assert_eq!(ctx.package_version, "4.17.21");
                assert_eq!(ctx.package_spec, "lodash@4.17.21");
                assert_eq!(ctx.pathname, "/map.js");
                assert_eq!(ctx.filename, "map.js");
                assert_eq!(ctx.search, "?module");
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn version_defaults_to_latest() {
        match run("/preact") {
            Decision::Forward(ctx) => assert_eq!(ctx.package_spec, "preact@latest"),
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn rules_fire_in_table_order() {
        // A request can match several predicates; the earliest wins.
        assert_eq!(first_rule("/_meta/foo?json&evil=1"), "legacy-meta-prefix");
        assert_eq!(first_rule("/foo?json&evil=1"), "legacy-json-flag");
        assert_eq!(first_rule("/React?evil=1"), "non-canonical-query");
        assert_eq!(first_rule("/@scope"), "malformed-url");
        assert_eq!(first_rule("/React"), "invalid-package-name");
        assert_eq!(first_rule("/react"), "forward");
    }
}
