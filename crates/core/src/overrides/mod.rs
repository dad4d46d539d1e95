//! Manual code overrides.
//!
//! Reviewers may replace the generated code of one logic component (a population definition, a
//! predicate CTE, a population view) with hand-written code. Each override is keyed by
//! `(measure id, component id, format)`, carries an append-only history of edit notes and is
//! re-applied by the [`inject`] pass every time the measure is regenerated while it stays
//! locked.

mod injector;
mod store;

pub use injector::inject;
pub use store::OverrideStore;

use crate::error::{CoreError, CoreResult};
use crate::format::OutputFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ums_types::NonEmptyText;
use uuid::Uuid;

/// Why a reviewer changed generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    LogicFix,
    Performance,
    Formatting,
    Clarification,
    Other,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogicFix => "logic_fix",
            Self::Performance => "performance",
            Self::Formatting => "formatting",
            Self::Clarification => "clarification",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "logic_fix" => Ok(Self::LogicFix),
            "performance" => Ok(Self::Performance),
            "formatting" => Ok(Self::Formatting),
            "clarification" => Ok(Self::Clarification),
            "other" => Ok(Self::Other),
            other => Err(CoreError::UnknownChangeType(other.to_string())),
        }
    }
}

/// One entry of an override's edit history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditNote {
    pub id: Uuid,
    pub format: OutputFormat,
    pub text: NonEmptyText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    pub created_at: DateTime<Utc>,
    /// Store-wide sequence number; orders notes saved within the same instant.
    pub sequence: u64,
}

/// Hand-written code replacing one generated component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeOverride {
    pub measure_id: String,
    pub component_id: String,
    pub format: OutputFormat,
    pub code: String,
    /// Only locked overrides are re-applied on regeneration.
    pub locked: bool,
    /// Generated code the reviewer started from, captured on the first save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_code: Option<String>,
    /// Edit history, oldest first. Never truncated, also not by revert.
    #[serde(default)]
    pub notes: Vec<EditNote>,
    pub updated_at: DateTime<Utc>,
}

impl CodeOverride {
    pub fn key(&self) -> OverrideKey {
        OverrideKey::new(&self.measure_id, &self.component_id, self.format)
    }
}

/// Compound key of an override record. Ids match exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverrideKey {
    pub measure_id: String,
    pub component_id: String,
    pub format: OutputFormat,
}

impl OverrideKey {
    pub fn new(measure_id: &str, component_id: &str, format: OutputFormat) -> Self {
        Self {
            measure_id: measure_id.to_string(),
            component_id: component_id.to_string(),
            format,
        }
    }
}

/// Input of [`OverrideStore::save`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub measure_id: String,
    pub component_id: String,
    pub format: OutputFormat,
    pub code: String,
    pub note: String,
    #[serde(default)]
    pub change_type: Option<ChangeType>,
    #[serde(default)]
    pub original_code: Option<String>,
}

/// How a locked override was placed into a generated document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOverride {
    pub component_id: String,
    /// False when no anchor was found and the code was appended at the end of the document.
    pub anchored: bool,
}
