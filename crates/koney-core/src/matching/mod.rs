//! Resource and container matching.
//!
//! The planner and the captor generator both ask the same two
//! questions: does this filter select this workload, and does this
//! container-selector select this container name. Filters in the `any`
//! list are a disjunction; inside one filter, namespaces and the label
//! selector are AND-ed. Container matching is evaluated separately per
//! container and composed by the caller.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

use crate::api::{
    LabelSelector, LabelSelectorOperator, ResourceFilter, ResourceFilters,
};
use crate::cluster::Workload;

/// Prefix selecting full-regex container matching.
const REGEX_PREFIX: &str = "regex:";

/// Prefix selecting shell-glob container matching.
const GLOB_PREFIX: &str = "glob:";

/// Matching errors.
#[derive(Debug, Error)]
pub enum MatchError {
    /// A container-selector pattern failed to compile.
    #[error("failed to compile container pattern {pattern:?}: {reason}")]
    PatternCompile {
        /// The offending pattern, including its mode prefix.
        pattern: String,
        /// Why compilation failed.
        reason: String,
    },
}

/// Whether a container selector is the match-all sentinel (empty string
/// or a literal `*`).
#[must_use]
pub fn selects_all_containers(pattern: &str) -> bool {
    pattern.is_empty() || pattern == "*"
}

/// Evaluate a container-selector pattern against a container name.
///
/// The mode is inferred from the pattern prefix: `regex:` compiles the
/// remainder as a full regex, `glob:` as a shell glob (`*`, `?`, `[]`),
/// anything else compares literally. The empty pattern matches every
/// container.
///
/// # Errors
///
/// Returns [`MatchError::PatternCompile`] when the regex or glob does
/// not compile.
pub fn container_matches(pattern: &str, container_name: &str) -> Result<bool, MatchError> {
    if pattern.is_empty() {
        return Ok(true);
    }

    if let Some(expr) = pattern.strip_prefix(REGEX_PREFIX) {
        let compiled = Regex::new(expr).map_err(|err| MatchError::PatternCompile {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        return Ok(compiled.is_match(container_name));
    }

    if let Some(glob) = pattern.strip_prefix(GLOB_PREFIX) {
        let expr = glob_to_regex(glob).map_err(|reason| MatchError::PatternCompile {
            pattern: pattern.to_string(),
            reason,
        })?;
        let compiled = Regex::new(&expr).map_err(|err| MatchError::PatternCompile {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        return Ok(compiled.is_match(container_name));
    }

    Ok(pattern == container_name)
}

/// Check that a container-selector pattern compiles, without matching.
///
/// # Errors
///
/// Returns [`MatchError::PatternCompile`] for invalid regex or glob
/// patterns.
pub fn check_container_pattern(pattern: &str) -> Result<(), MatchError> {
    container_matches(pattern, "").map(|_| ())
}

/// Translate a shell glob (`*`, `?`, `[...]`) into an anchored regex.
fn glob_to_regex(glob: &str) -> Result<String, String> {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                // Leading negation: shell uses both `!` and `^`.
                if matches!(chars.peek(), Some('!' | '^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    match inner {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' => out.push_str("\\\\"),
                        other => out.push(other),
                    }
                }
                if !closed {
                    return Err("unterminated character class".to_string());
                }
                out.push(']');
            }
            other => {
                if regex_syntax_char(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }

    out.push('$');
    Ok(out)
}

/// Characters that must be escaped when embedded literally in a regex.
const fn regex_syntax_char(ch: char) -> bool {
    matches!(
        ch,
        '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' | ']'
    )
}

/// Whether any filter in the disjunction selects the workload.
#[must_use]
pub fn workload_matches(workload: &Workload, filters: &ResourceFilters) -> bool {
    filters
        .any
        .iter()
        .any(|filter| filter_matches(workload, filter))
}

/// Whether one filter's conjunction of fields selects the workload.
#[must_use]
pub fn filter_matches(workload: &Workload, filter: &ResourceFilter) -> bool {
    if !filter.namespaces.is_empty()
        && !filter
            .namespaces
            .iter()
            .any(|ns| *ns == workload.meta.namespace)
    {
        return false;
    }

    match &filter.selector {
        Some(selector) => label_selector_matches(selector, &workload.meta.labels),
        None => true,
    }
}

/// Evaluate a label selector against a label map. An empty selector
/// matches everything.
#[must_use]
pub fn label_selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }

    for requirement in &selector.match_expressions {
        let actual = labels.get(&requirement.key);
        let holds = match requirement.operator {
            LabelSelectorOperator::In => {
                actual.is_some_and(|v| requirement.values.iter().any(|want| want == v))
            }
            LabelSelectorOperator::NotIn => {
                actual.is_none_or(|v| !requirement.values.iter().any(|want| want == v))
            }
            LabelSelectorOperator::Exists => actual.is_some(),
            LabelSelectorOperator::DoesNotExist => actual.is_none(),
        };
        if !holds {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LabelSelectorRequirement;
    use crate::cluster::{ObjectMeta, PodTemplate, Workload, WorkloadKind};

    fn workload(namespace: &str, labels: &[(&str, &str)]) -> Workload {
        let mut meta = ObjectMeta::namespaced(namespace, "w1");
        for (k, v) in labels {
            meta.labels.insert((*k).to_string(), (*v).to_string());
        }
        Workload {
            meta,
            kind: WorkloadKind::Deployment,
            replicas: 1,
            template: PodTemplate::default(),
        }
    }

    #[test]
    fn test_empty_and_star_match_any_container() {
        assert!(container_matches("", "nginx").unwrap());
        assert!(selects_all_containers(""));
        assert!(selects_all_containers("*"));
    }

    #[test]
    fn test_literal_container_match() {
        assert!(container_matches("nginx", "nginx").unwrap());
        assert!(!container_matches("nginx", "redis").unwrap());
    }

    #[test]
    fn test_glob_container_match() {
        assert!(container_matches("glob:ng*", "nginx").unwrap());
        assert!(!container_matches("glob:ng*", "redis").unwrap());
        assert!(container_matches("glob:db-?", "db-1").unwrap());
        assert!(!container_matches("glob:db-?", "db-12").unwrap());
        assert!(container_matches("glob:db[0-9]", "db3").unwrap());
        assert!(!container_matches("glob:db[!0-9]", "db3").unwrap());
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        assert!(container_matches("glob:app.v1", "app.v1").unwrap());
        assert!(!container_matches("glob:app.v1", "appxv1").unwrap());
    }

    #[test]
    fn test_regex_container_match() {
        assert!(container_matches("regex:^db[0-9]+$", "db12").unwrap());
        assert!(!container_matches("regex:^db[0-9]+$", "db").unwrap());
    }

    #[test]
    fn test_invalid_patterns_error() {
        assert!(matches!(
            container_matches("regex:[unterminated", "x"),
            Err(MatchError::PatternCompile { .. })
        ));
        assert!(matches!(
            container_matches("glob:data[0-9", "data1"),
            Err(MatchError::PatternCompile { .. })
        ));
    }

    #[test]
    fn test_filter_namespaces_are_literal() {
        let filter = ResourceFilter {
            namespaces: vec!["prod".to_string()],
            ..ResourceFilter::default()
        };
        assert!(filter_matches(&workload("prod", &[]), &filter));
        assert!(!filter_matches(&workload("dev", &[]), &filter));
    }

    #[test]
    fn test_any_is_a_disjunction() {
        let filters = ResourceFilters {
            any: vec![
                ResourceFilter {
                    namespaces: vec!["prod".to_string()],
                    ..ResourceFilter::default()
                },
                ResourceFilter {
                    namespaces: vec!["dev".to_string()],
                    ..ResourceFilter::default()
                },
            ],
        };
        assert!(workload_matches(&workload("dev", &[]), &filters));
        assert!(!workload_matches(&workload("stage", &[]), &filters));
    }

    #[test]
    fn test_label_selector_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: LabelSelectorOperator::In,
                    values: vec!["web".to_string(), "api".to_string()],
                },
                LabelSelectorRequirement {
                    key: "canary".to_string(),
                    operator: LabelSelectorOperator::DoesNotExist,
                    values: Vec::new(),
                },
            ],
        };

        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        assert!(label_selector_matches(&selector, &labels));

        labels.insert("canary".to_string(), "true".to_string());
        assert!(!label_selector_matches(&selector, &labels));
    }

    #[test]
    fn test_match_labels_and_namespace_compose() {
        let filter = ResourceFilter {
            namespaces: vec!["prod".to_string()],
            selector: Some(LabelSelector {
                match_labels: [("app".to_string(), "shop".to_string())].into(),
                match_expressions: Vec::new(),
            }),
            container_selector: String::new(),
        };

        assert!(filter_matches(&workload("prod", &[("app", "shop")]), &filter));
        assert!(!filter_matches(&workload("prod", &[("app", "blog")]), &filter));
        assert!(!filter_matches(&workload("dev", &[("app", "shop")]), &filter));
    }
}
