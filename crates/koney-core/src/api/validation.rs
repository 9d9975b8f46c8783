//! Semantic validation of traps.
//!
//! Schema-level problems (unknown strategy names, missing required
//! fields) are already rejected at deserialization; what remains here
//! are the semantic checks: exactly one trap kind, implementable kind,
//! absolute file path, compilable container selectors.

use thiserror::Error;

use super::{DeceptionPolicySpec, Trap, TrapKind};
use crate::matching::{self, MatchError};

/// Why a trap was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// No kind field was set on the trap.
    #[error("trap declares no kind")]
    MissingKind,

    /// More than one kind field was set.
    #[error("trap declares more than one kind")]
    AmbiguousKind,

    /// The kind is reserved but not implemented.
    #[error("trap kind {0} is not implemented")]
    UnimplementedKind(TrapKind),

    /// The honeytoken file path is empty.
    #[error("filesystem honeytoken has no filePath")]
    MissingFilePath,

    /// The honeytoken file path is not absolute.
    #[error("filesystem honeytoken filePath {0:?} is not absolute")]
    RelativeFilePath(String),

    /// A container selector failed to compile.
    #[error(transparent)]
    Pattern(#[from] MatchError),
}

/// A rejected trap: its index in the spec and the reason.
#[derive(Debug)]
pub struct TrapRejection {
    /// Position of the trap in `spec.traps`.
    pub index: usize,
    /// Why it was rejected.
    pub error: ValidationError,
}

impl std::fmt::Display for TrapRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trap[{}]: {}", self.index, self.error)
    }
}

/// Validate a single trap.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered.
pub fn validate_trap(trap: &Trap) -> Result<(), ValidationError> {
    let kinds_set = usize::from(trap.filesystem_honeytoken.is_some())
        + usize::from(trap.http_endpoint.is_some())
        + usize::from(trap.http_payload.is_some());
    match kinds_set {
        0 => return Err(ValidationError::MissingKind),
        1 => {}
        _ => return Err(ValidationError::AmbiguousKind),
    }

    match trap.kind() {
        TrapKind::FilesystemHoneytoken => {
            // Checked above: the kind field is present.
            if let Some(token) = &trap.filesystem_honeytoken {
                if token.file_path.is_empty() {
                    return Err(ValidationError::MissingFilePath);
                }
                if !token.file_path.starts_with('/') {
                    return Err(ValidationError::RelativeFilePath(token.file_path.clone()));
                }
            }
        }
        kind => return Err(ValidationError::UnimplementedKind(kind)),
    }

    for filter in &trap.match_resources.any {
        matching::check_container_pattern(&filter.container_selector)?;
    }

    Ok(())
}

/// Validate every trap in a policy spec, collecting rejections.
#[must_use]
pub fn validate_policy(spec: &DeceptionPolicySpec) -> Vec<TrapRejection> {
    spec.traps
        .iter()
        .enumerate()
        .filter_map(|(index, trap)| {
            validate_trap(trap)
                .err()
                .map(|error| TrapRejection { index, error })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ResourceFilter, ResourceFilters};

    #[test]
    fn test_valid_filesystem_trap() {
        let trap = Trap::filesystem_honeytoken("/tmp/auth_token.json", "{}", true);
        assert!(validate_trap(&trap).is_ok());
    }

    #[test]
    fn test_empty_trap_rejected() {
        let trap = Trap {
            filesystem_honeytoken: None,
            ..Trap::filesystem_honeytoken("/x", "", true)
        };
        assert!(matches!(
            validate_trap(&trap),
            Err(ValidationError::MissingKind)
        ));
    }

    #[test]
    fn test_reserved_kind_rejected() {
        let trap = Trap {
            filesystem_honeytoken: None,
            http_endpoint: Some(crate::api::HttpEndpoint::default()),
            ..Trap::filesystem_honeytoken("/x", "", true)
        };
        assert!(matches!(
            validate_trap(&trap),
            Err(ValidationError::UnimplementedKind(TrapKind::HttpEndpoint))
        ));
    }

    #[test]
    fn test_relative_path_rejected() {
        let trap = Trap::filesystem_honeytoken("tmp/token", "{}", true);
        assert!(matches!(
            validate_trap(&trap),
            Err(ValidationError::RelativeFilePath(_))
        ));
    }

    #[test]
    fn test_bad_selector_pattern_rejected() {
        let mut trap = Trap::filesystem_honeytoken("/tmp/token", "{}", true);
        trap.match_resources = ResourceFilters {
            any: vec![ResourceFilter {
                container_selector: "regex:[unterminated".to_string(),
                ..ResourceFilter::default()
            }],
        };
        assert!(matches!(
            validate_trap(&trap),
            Err(ValidationError::Pattern(_))
        ));
    }

    #[test]
    fn test_validate_policy_collects_indices() {
        let spec = DeceptionPolicySpec {
            strict_validation: true,
            mutate_existing: true,
            traps: vec![
                Trap::filesystem_honeytoken("/tmp/a", "{}", true),
                Trap::filesystem_honeytoken("", "{}", true),
            ],
        };
        let rejections = validate_policy(&spec);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].index, 1);
    }
}
