//! Incoming run requests and their validation
//!
//! Validation happens before any executor or database interaction, and
//! every rejection names the offending field and value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Component;
use std::path::Path;
use thiserror::Error;

/// Rejections raised while validating a run request
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is empty
    #[error("Field '{field}' must not be empty")]
    MissingField {
        /// Name of the empty field
        field: &'static str,
    },

    /// The workflow URL escapes the run's directory tree
    #[error("Workflow URL '{url}' contains a path traversal")]
    PathTraversal {
        /// The rejected URL
        url: String,
    },

    /// The workflow URL must be relative to the run's directory
    #[error("Workflow URL '{url}' must be a relative path")]
    AbsoluteWorkflowUrl {
        /// The rejected URL
        url: String,
    },

    /// A field contains a character with shell or filesystem meaning
    #[error("Field '{field}' contains forbidden character {character:?}")]
    ForbiddenCharacter {
        /// Name of the offending field
        field: &'static str,
        /// The rejected character
        character: char,
    },

    /// The requested workflow type is not configured
    #[error("Unsupported workflow type '{workflow_type}'; supported: {supported:?}")]
    UnsupportedWorkflowType {
        /// The rejected workflow type
        workflow_type: String,
        /// The configured whitelist
        supported: Vec<String>,
    },
}

/// Characters never allowed in fields that end up in file paths or shell
/// command lines
const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '$', '`', '\'', '"', '<', '>', '\n', '\r', '\0',
];

fn check_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    if let Some(character) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(ValidationError::ForbiddenCharacter { field, character });
    }
    Ok(())
}

/// One workflow-run request as accepted from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Path of the workflow entry file, relative to the run directory
    pub workflow_url: String,
    /// Workflow engine identifier, e.g. `SMK` or `NFL`
    pub workflow_type: String,
    /// Requested engine version
    pub workflow_type_version: String,
    /// Engine-specific run parameters
    pub workflow_params: serde_json::Value,
    /// Free-form tags attached by the client
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl RunRequest {
    /// Validate the request against the configured workflow-type
    /// whitelist. Returns the first violation found.
    pub fn validate(&self, supported_workflow_types: &[String]) -> Result<(), ValidationError> {
        check_field("workflow_url", &self.workflow_url)?;
        check_field("workflow_type", &self.workflow_type)?;
        check_field("workflow_type_version", &self.workflow_type_version)?;

        let url_path = Path::new(&self.workflow_url);
        if url_path.is_absolute() {
            return Err(ValidationError::AbsoluteWorkflowUrl {
                url: self.workflow_url.clone(),
            });
        }
        if url_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ValidationError::PathTraversal {
                url: self.workflow_url.clone(),
            });
        }

        if !supported_workflow_types
            .iter()
            .any(|t| t == &self.workflow_type)
        {
            return Err(ValidationError::UnsupportedWorkflowType {
                workflow_type: self.workflow_type.clone(),
                supported: supported_workflow_types.to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn supported() -> Vec<String> {
        vec!["SMK".to_string(), "NFL".to_string()]
    }

    fn request(url: &str) -> RunRequest {
        RunRequest {
            workflow_url: url.to_string(),
            workflow_type: "SMK".to_string(),
            workflow_type_version: "7.30.2".to_string(),
            workflow_params: json!({"sample": "A"}),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_valid_request_passes() {
        request("workflows/Snakefile").validate(&supported()).unwrap();
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let err = request("../../etc/passwd").validate(&supported()).unwrap_err();
        assert!(matches!(err, ValidationError::PathTraversal { .. }));
        let err = request("workflows/../../other").validate(&supported()).unwrap_err();
        assert!(matches!(err, ValidationError::PathTraversal { .. }));
    }

    #[test]
    fn test_absolute_url_is_rejected() {
        let err = request("/etc/passwd").validate(&supported()).unwrap_err();
        assert!(matches!(err, ValidationError::AbsoluteWorkflowUrl { .. }));
    }

    #[test]
    fn test_forbidden_characters_are_rejected_with_detail() {
        let err = request("Snakefile; rm -rf /").validate(&supported()).unwrap_err();
        match err {
            ValidationError::ForbiddenCharacter { field, character } => {
                assert_eq!(field, "workflow_url");
                assert_eq!(character, ';');
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_workflow_type_is_rejected() {
        let mut req = request("Snakefile");
        req.workflow_type = "CWL".to_string();
        let err = req.validate(&supported()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("CWL"));
        assert!(message.contains("SMK"));
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let mut req = request("Snakefile");
        req.workflow_type_version = "  ".to_string();
        let err = req.validate(&supported()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingField {
                field: "workflow_type_version"
            }
        ));
    }
}
