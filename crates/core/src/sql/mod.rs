//! Tabular (T-SQL) generation.
//!
//! The script is a chain of named CTEs inside a `PredicateFlags` view (`ONT`, then `DEMOG`,
//! then one `PRED_*` CTE per clinical data element) followed by one view per population and a
//! `FinalResults` view, each batch terminated by `GO`.

mod condition;
mod generator;
mod predicate;

pub use generator::SqlGenerator;
