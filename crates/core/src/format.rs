//! Output formats produced by the generators.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target grammar of generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Clinical Quality Language.
    Cql,
    /// CTE-based T-SQL script.
    Sql,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cql => "cql",
            Self::Sql => "sql",
        }
    }

    /// Line-comment prefix of the grammar.
    pub fn comment_prefix(&self) -> &'static str {
        match self {
            Self::Cql => "//",
            Self::Sql => "--",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "cql" => Ok(Self::Cql),
            "sql" | "tsql" | "t-sql" => Ok(Self::Sql),
            other => Err(CoreError::UnknownFormat(other.to_string())),
        }
    }
}
