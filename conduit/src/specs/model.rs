//! Pipeline definition types.
//!
//! [`PipelineDetails`] is the schema of one entry in a definition file.
//! Discovery turns it into a [`SpecOutcome`]: either a fully resolved
//! [`PipelineSpec`] or an [`InvalidSpec`] carrying the reasons it cannot run.

use crate::errors::SpecError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// One entry of a `pipeline-spec.yaml` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDetails {
    /// Ordered steps.
    pub pipeline: Vec<StepDef>,
    /// Other pipelines or external artifacts this one reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyDef>,
    /// Optional cron schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleDef>,
    /// Webhook URLs notified on transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<String>,
    /// Free-form keys (title, description, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A step as written in a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    /// Dotted executable reference.
    pub run: String,
    /// Parameters handed to the executable.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Whether the step's output may be cached.
    #[serde(default)]
    pub cache: bool,
    /// Named runner; the default runner when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyDef {
    /// Another pipeline, by id.
    Pipeline {
        /// Pipeline id.
        pipeline: String,
    },
    /// An external package descriptor, by path.
    Artifact {
        /// Descriptor path, relative to the pipeline directory.
        datapackage: String,
    },
    /// Anything else; reported as a validation error.
    Unknown(Value),
}

/// Cron-like schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDef {
    /// Five whitespace-separated cron fields.
    pub crontab: String,
}

static CRON_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z*/,?\-]+$").expect("valid cron field regex"));

impl ScheduleDef {
    /// The five cron fields, if well formed.
    #[must_use]
    pub fn fields(&self) -> Option<[&str; 5]> {
        let parts: Vec<&str> = self.crontab.split_whitespace().collect();
        let fields: [&str; 5] = parts.try_into().ok()?;
        fields
            .iter()
            .all(|f| CRON_FIELD_RE.is_match(f))
            .then_some(fields)
    }

    /// Validation error for a malformed crontab.
    #[must_use]
    pub fn validate(&self) -> Option<SpecError> {
        if self.fields().is_some() {
            None
        } else {
            Some(SpecError::new(
                "Invalid Schedule",
                format!("Expected five cron fields, got {:?}", self.crontab),
            ))
        }
    }
}

/// A step after resolution and hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Reference as written.
    pub run: String,
    /// Resolved absolute executable path.
    pub executable: PathBuf,
    /// Parameters handed to the executable.
    pub parameters: Map<String, Value>,
    /// Whether the step's output may be cached.
    pub cache: bool,
    /// Named runner.
    pub runner: Option<String>,
    /// Chained hash of this step and everything before it.
    pub cache_hash: String,
}

/// A pipeline ready to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Path-like unique id (`./dir/name`).
    pub pipeline_id: String,
    /// Directory the definition lives in; the working directory of steps.
    pub path: PathBuf,
    /// Parsed details.
    pub details: PipelineDetails,
    /// Details as written, persisted on the status record.
    pub raw_details: Value,
    /// Source document for generated pipelines.
    pub source_details: Value,
    /// Resolved steps.
    pub steps: Vec<Step>,
    /// Pipeline ids this one depends on.
    pub dependencies: Vec<String>,
    /// Hash of the last step.
    pub cache_hash: String,
    /// Whether the hash differs from the last recorded execution.
    pub dirty: bool,
}

/// A pipeline that cannot run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidSpec {
    /// Path-like unique id.
    pub pipeline_id: String,
    /// Directory the definition lives in.
    pub path: PathBuf,
    /// Details as written.
    pub raw_details: Value,
    /// Source document for generated pipelines.
    pub source_details: Value,
    /// Declared pipeline dependencies, kept so dependency edges survive.
    pub dependencies: Vec<String>,
    /// Why it cannot run. Never empty.
    pub errors: Vec<SpecError>,
}

/// Result of resolving one pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpecOutcome {
    /// Resolved and hashed.
    Valid(PipelineSpec),
    /// Blocked by validation errors.
    Invalid(InvalidSpec),
}

impl SpecOutcome {
    /// Pipeline id.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        match self {
            Self::Valid(spec) => &spec.pipeline_id,
            Self::Invalid(spec) => &spec.pipeline_id,
        }
    }

    /// Definition directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Valid(spec) => &spec.path,
            Self::Invalid(spec) => &spec.path,
        }
    }

    /// Details as written.
    #[must_use]
    pub fn raw_details(&self) -> &Value {
        match self {
            Self::Valid(spec) => &spec.raw_details,
            Self::Invalid(spec) => &spec.raw_details,
        }
    }

    /// Source document, `Null` for plain definitions.
    #[must_use]
    pub fn source_details(&self) -> &Value {
        match self {
            Self::Valid(spec) => &spec.source_details,
            Self::Invalid(spec) => &spec.source_details,
        }
    }

    /// Pipeline dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        match self {
            Self::Valid(spec) => &spec.dependencies,
            Self::Invalid(spec) => &spec.dependencies,
        }
    }

    /// Validation errors; empty for valid specs.
    #[must_use]
    pub fn errors(&self) -> &[SpecError] {
        match self {
            Self::Valid(_) => &[],
            Self::Invalid(spec) => &spec.errors,
        }
    }

    /// Chained hash; empty for invalid specs.
    #[must_use]
    pub fn cache_hash(&self) -> &str {
        match self {
            Self::Valid(spec) => &spec.cache_hash,
            Self::Invalid(_) => "",
        }
    }

    /// Dirtiness; invalid specs are never dirty.
    #[must_use]
    pub const fn dirty(&self) -> bool {
        match self {
            Self::Valid(spec) => spec.dirty,
            Self::Invalid(_) => false,
        }
    }

    /// Cron schedule, if declared and valid.
    #[must_use]
    pub fn schedule(&self) -> Option<&ScheduleDef> {
        match self {
            Self::Valid(spec) => spec.details.schedule.as_ref(),
            Self::Invalid(_) => None,
        }
    }

    /// The runnable spec, if any.
    #[must_use]
    pub const fn as_valid(&self) -> Option<&PipelineSpec> {
        match self {
            Self::Valid(spec) => Some(spec),
            Self::Invalid(_) => None,
        }
    }

    /// Returns true for [`SpecOutcome::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}
