//! # UMS Core
//!
//! Compilation, validation, override and diff logic for Universal Measure Specification
//! measures:
//! - Clinical-query (CQL) and T-SQL generation from the criteria tree ([`cql`], [`sql`])
//! - Structural validators with a 0-100 compliance score ([`validation`])
//! - Per-component manual overrides that survive regeneration ([`overrides`])
//! - Structural and textual diffs between measure versions ([`diff`])
//!
//! [`MeasureService`] ties these together behind one facade.
//!
//! **No API concerns**: HTTP servers, request DTOs and CLI parsing belong in `api-rest`,
//! `api-shared` and `cli`.

pub mod config;
pub mod constants;
pub mod cql;
pub mod diff;
pub mod error;
pub mod format;
pub mod generation;
pub mod overrides;
pub mod service;
pub mod sql;
pub mod validation;

pub use config::{GenerationConfig, SqlDialect, ValidationConfig};
pub use cql::{BundleRegistry, CqlGenerator};
pub use diff::MeasureDiff;
pub use error::{CoreError, CoreResult};
pub use format::OutputFormat;
pub use generation::{GenerationResult, GenerationWarning, WarningCode};
pub use overrides::{ChangeType, CodeOverride, EditNote, OverrideRequest, OverrideStore};
pub use service::MeasureService;
pub use sql::SqlGenerator;
pub use validation::{ValidationIssue, ValidationResult, Validator};
