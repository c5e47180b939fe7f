/// Package-name validation.
///
/// The normalizer treats this as an opaque predicate: a list of reasons,
/// empty when the name is acceptable. Reasons are joined verbatim into the
/// rejection body, so their wording is part of the response contract.
pub trait PackageNameValidator: Send + Sync {
    /// The violated rules for `name`, in rule order; empty means valid.
    fn validate(&self, name: &str) -> Vec<String>;
}

/// The npm registry naming ruleset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryNameRules;

const MAX_NAME_LENGTH: usize = 214;

impl PackageNameValidator for RegistryNameRules {
    fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if name.is_empty() {
            errors.push("name length must be greater than zero".to_string());
            return errors;
        }
        if parts(name).any(|part| part.starts_with('.')) {
            errors.push("name cannot start with a period".to_string());
        }
        if parts(name).any(|part| part.starts_with('_')) {
            errors.push("name cannot start with an underscore".to_string());
        }
        if name.trim() != name {
            errors.push("name cannot contain leading or trailing spaces".to_string());
        }
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            errors.push("name can no longer contain capital letters".to_string());
        }
        if !parts(name).all(url_friendly) {
            errors.push("name can only contain URL-friendly characters".to_string());
        }
        if name.len() > MAX_NAME_LENGTH {
            errors.push("name cannot contain more than 214 characters".to_string());
        }

        errors
    }
}

/// The scope (without its `@`) and name parts of a scoped name, or the
/// whole name when unscoped. Segment-level rules apply to each part.
fn parts(name: &str) -> impl Iterator<Item = &str> {
    match name.strip_prefix('@').and_then(|rest| rest.split_once('/')) {
        Some((scope, inner)) => vec![scope, inner].into_iter(),
        None => vec![name].into_iter(),
    }
}

/// Characters that survive URL encoding unchanged.
fn url_friendly(part: &str) -> bool {
    part.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '!' | '*' | '\'' | '(' | ')')
    })
}
