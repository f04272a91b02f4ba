//! Translation between domain execution plans and remote activity options.
//!
//! The [`SchemaMapper`] is pure and stateless. It owns three fixed tables:
//! the job-type to activity-name lookup, the per-activity option schemas,
//! and the remote status word mapping. Validation reports problems in a
//! [`ValidationReport`] instead of failing; unknown activity names pass
//! through unvalidated so unregistered controllers keep working.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::correlation::ActivityStatus;
use crate::task::ActivityOption;

/// A domain execution plan handed in by the workflow layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Equipment identifier, e.g. `printer-a3` or `sinter-b1`.
    pub equipment_id: String,
    /// Domain job type, e.g. `print` or `measure`.
    pub job_type: String,
    /// Job parameters. Keys map one-to-one onto option keys.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Input file references, forwarded as repeated `file` options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_refs: Vec<String>,
    /// Estimated duration in seconds, when the planner knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_s: Option<u64>,
}

/// Outcome of validating an option list against an activity schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when every check passed.
    pub valid: bool,
    /// Human-readable description of each failed check.
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Expected primitive type of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    Text,
    Number,
    Boolean,
}

impl OptionKind {
    fn accepts(self, value: &str) -> bool {
        match self {
            Self::Text => true,
            Self::Number => value.parse::<f64>().is_ok(),
            Self::Boolean => matches!(value, "true" | "false"),
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

/// One field of an activity option schema.
#[derive(Debug, Clone, Copy)]
struct OptionField {
    key: &'static str,
    kind: OptionKind,
    required: bool,
}

const fn field(key: &'static str, kind: OptionKind, required: bool) -> OptionField {
    OptionField {
        key,
        kind,
        required,
    }
}

/// Option schemas for the activities this deployment registers.
const SCHEMAS: &[(&str, &[OptionField])] = &[
    (
        "print_job",
        &[
            field("file", OptionKind::Text, true),
            field("material", OptionKind::Text, true),
            field("layer_height_mm", OptionKind::Number, false),
            field("supports", OptionKind::Boolean, false),
        ],
    ),
    (
        "sinter_cycle",
        &[
            field("profile", OptionKind::Text, true),
            field("peak_temperature_c", OptionKind::Number, true),
            field("hold_minutes", OptionKind::Number, false),
        ],
    ),
    (
        "quality_inspection",
        &[
            field("target", OptionKind::Text, true),
            field("tolerance_mm", OptionKind::Number, false),
            field("capture_images", OptionKind::Boolean, false),
        ],
    ),
];

/// Pure translation between domain plans and remote activity options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaMapper;

impl SchemaMapper {
    /// Creates a mapper.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Maps a domain job type to a remote activity name.
    ///
    /// Returns `None` for job types this core does not know how to run.
    #[must_use]
    pub fn activity_name_for_job(&self, job_type: &str) -> Option<&'static str> {
        match job_type {
            "print" => Some("print_job"),
            "sinter" => Some("sinter_cycle"),
            "measure" | "analyze" => Some("quality_inspection"),
            _ => None,
        }
    }

    /// Converts a plan's parameters into an ordered option list.
    ///
    /// Parameters appear first in key order, then one `file` option per
    /// file reference, then the estimated duration when present. Scalar
    /// JSON values are rendered without quotes.
    #[must_use]
    pub fn plan_to_options(&self, plan: &ExecutionPlan) -> Vec<ActivityOption> {
        let mut options: Vec<ActivityOption> = plan
            .parameters
            .iter()
            .map(|(key, value)| ActivityOption::new(key.clone(), render_value(value)))
            .collect();
        for file_ref in &plan.file_refs {
            options.push(ActivityOption::new("file", file_ref.clone()));
        }
        if let Some(duration) = plan.estimated_duration_s {
            options.push(ActivityOption::new(
                "estimated_duration_s",
                duration.to_string(),
            ));
        }
        options
    }

    /// Validates an option list against the schema for an activity name.
    ///
    /// Unknown activity names validate as a pass-through.
    #[must_use]
    pub fn validate_options(
        &self,
        activity_name: &str,
        options: &[ActivityOption],
    ) -> ValidationReport {
        let Some((_, fields)) = SCHEMAS.iter().find(|(name, _)| *name == activity_name) else {
            return ValidationReport::ok();
        };

        let mut errors = Vec::new();
        for schema_field in *fields {
            let supplied: Vec<&ActivityOption> = options
                .iter()
                .filter(|o| o.key == schema_field.key)
                .collect();

            if supplied.is_empty() {
                if schema_field.required {
                    errors.push(format!("missing required option '{}'", schema_field.key));
                }
                continue;
            }

            for option in supplied {
                if !schema_field.kind.accepts(&option.value) {
                    errors.push(format!(
                        "option '{}' expects a {} value, got '{}'",
                        schema_field.key,
                        schema_field.kind.label(),
                        option.value,
                    ));
                }
            }
        }

        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::failed(errors)
        }
    }

    /// Maps a remote status word to a domain activity status.
    ///
    /// Returns `None` for words outside the controller contract.
    #[must_use]
    pub fn map_remote_status(&self, word: &str) -> Option<ActivityStatus> {
        match word {
            "ACTIVITY_PENDING" => Some(ActivityStatus::Pending),
            "ACTIVITY_IN_PROGRESS" => Some(ActivityStatus::Running),
            "ACTIVITY_COMPLETED" => Some(ActivityStatus::Completed),
            "ACTIVITY_FAILED" => Some(ActivityStatus::Failed),
            "ACTIVITY_CANCELED" => Some(ActivityStatus::Cancelled),
            _ => None,
        }
    }

    /// Maps a remote action status word to a success flag.
    #[must_use]
    pub fn map_action_status(&self, word: &str) -> Option<bool> {
        match word {
            "ACTION_SUCCESS" => Some(true),
            "ACTION_FAILURE" => Some(false),
            _ => None,
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> SchemaMapper {
        SchemaMapper::new()
    }

    #[test]
    fn job_type_lookup_table() {
        let m = mapper();
        assert_eq!(m.activity_name_for_job("print"), Some("print_job"));
        assert_eq!(m.activity_name_for_job("sinter"), Some("sinter_cycle"));
        assert_eq!(m.activity_name_for_job("measure"), Some("quality_inspection"));
        assert_eq!(m.activity_name_for_job("analyze"), Some("quality_inspection"));
        assert_eq!(m.activity_name_for_job("teleport"), None);
    }

    #[test]
    fn plan_options_preserve_order() {
        let mut parameters = BTreeMap::new();
        parameters.insert("material".to_string(), serde_json::json!("ti64"));
        parameters.insert("supports".to_string(), serde_json::json!(true));
        let plan = ExecutionPlan {
            equipment_id: "printer-a3".to_string(),
            job_type: "print".to_string(),
            parameters,
            file_refs: vec!["bucket/part.stl".to_string()],
            estimated_duration_s: Some(5400),
        };

        let options = mapper().plan_to_options(&plan);
        let keys: Vec<&str> = options.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["material", "supports", "file", "estimated_duration_s"]
        );
        assert_eq!(options[1].value, "true");
        assert_eq!(options[3].value, "5400");
    }

    #[test]
    fn validation_reports_missing_required_fields() {
        let report = mapper().validate_options(
            "print_job",
            &[ActivityOption::new("material", "ti64")],
        );
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["missing required option 'file'"]);
    }

    #[test]
    fn validation_checks_number_and_boolean_coercion() {
        let report = mapper().validate_options(
            "sinter_cycle",
            &[
                ActivityOption::new("profile", "fast"),
                ActivityOption::new("peak_temperature_c", "very hot"),
            ],
        );
        assert!(!report.valid);
        assert!(report.errors[0].contains("number"));

        let report = mapper().validate_options(
            "print_job",
            &[
                ActivityOption::new("file", "bucket/part.stl"),
                ActivityOption::new("material", "ti64"),
                ActivityOption::new("supports", "yes"),
            ],
        );
        assert!(!report.valid);
        assert!(report.errors[0].contains("boolean"));
    }

    #[test]
    fn valid_options_pass() {
        let report = mapper().validate_options(
            "quality_inspection",
            &[
                ActivityOption::new("target", "layer-adhesion"),
                ActivityOption::new("tolerance_mm", "0.05"),
                ActivityOption::new("capture_images", "true"),
            ],
        );
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn unknown_activity_passes_through() {
        let report = mapper().validate_options(
            "plasma_etch",
            &[ActivityOption::new("anything", "goes")],
        );
        assert!(report.valid);
    }

    #[test]
    fn remote_status_words_map_to_domain_statuses() {
        let m = mapper();
        assert_eq!(
            m.map_remote_status("ACTIVITY_IN_PROGRESS"),
            Some(ActivityStatus::Running)
        );
        assert_eq!(
            m.map_remote_status("ACTIVITY_CANCELED"),
            Some(ActivityStatus::Cancelled)
        );
        assert_eq!(m.map_remote_status("ACTIVITY_EXPLODED"), None);

        assert_eq!(m.map_action_status("ACTION_SUCCESS"), Some(true));
        assert_eq!(m.map_action_status("ACTION_FAILURE"), Some(false));
        assert_eq!(m.map_action_status("ACTION_MAYBE"), None);
    }
}
