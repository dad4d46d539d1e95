//! Value set references.
//!
//! A value set is a named collection of clinical codes representing one clinical concept
//! (for example "Office Visit"). Measures declare the value sets they use and data elements
//! point at them by id or OID.

use crate::measure::Confidence;
use serde::{Deserialize, Serialize};

/// A single code drawn from a code system.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeReference {
    /// The code value (e.g. `Z12.11`).
    pub code: String,

    /// The code system the code belongs to (e.g. `ICD10CM`).
    pub system: String,

    /// Optional human-readable display text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// A reference to a value set, as carried by a measure or a data element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetReference {
    /// Measure-scoped identifier of the value set.
    #[serde(default)]
    pub id: String,

    /// Human-readable name, used as the value set identifier in generated code.
    #[serde(default)]
    pub name: String,

    /// Object identifier (e.g. `2.16.840.1.113883.3.464.1003.101.12.1001`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,

    /// Canonical URL; takes precedence over a URL synthesised from the OID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Ordered list of member codes.
    #[serde(default)]
    pub codes: Vec<CodeReference>,

    #[serde(default)]
    pub confidence: Confidence,

    /// Whether a reviewer has confirmed the value set against a terminology service.
    #[serde(default)]
    pub verified: bool,
}

impl ValueSetReference {
    /// Returns the OID when present and non-blank.
    pub fn oid(&self) -> Option<&str> {
        self.oid.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Returns the canonical URL when present and non-blank.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// A value set is resolvable when generated code can refer to it: it needs a name and
    /// something to declare it by (a URL or an OID).
    pub fn is_resolvable(&self) -> bool {
        !self.name.trim().is_empty() && (self.url().is_some() || self.oid().is_some())
    }

    /// True when `other` refers to the same value set by id or by OID.
    pub fn same_identity(&self, other: &ValueSetReference) -> bool {
        let same_id = !self.id.is_empty() && self.id == other.id;
        let same_oid = matches!((self.oid(), other.oid()), (Some(a), Some(b)) if a == b);
        same_id || same_oid
    }

    /// Key used when matching value sets across two measure versions.
    pub fn match_key(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}
