//! Constants used throughout the UMS core crate.
//!
//! Names that generated code and the structural validators must agree on live here, so the
//! two sides cannot drift apart.

/// Terminology service URL template for value sets that only carry an OID.
pub const VALUE_SET_URL_PREFIX: &str = "http://cts.nlm.nih.gov/fhir/ValueSet/";

/// Data model the clinical-query output is written against.
pub const QICORE_VERSION: &str = "4.1.1";

/// Neutral literal a clause reduces to when it constrains nothing.
pub const NEUTRAL_LITERAL: &str = "true";

/// Marker opening the component anchor comment written before each generated block.
pub const COMPONENT_MARKER: &str = "[component:";

/// Prefix of the single timestamp line embedded in generated output.
pub const GENERATED_PREFIX: &str = "Generated: ";

/// Name of the ontology/terminology-resolution CTE.
pub const ONTOLOGY_CTE: &str = "ONT";

/// Name of the demographics CTE.
pub const DEMOGRAPHICS_CTE: &str = "DEMOG";

/// Prefix every clinical-predicate CTE must carry.
pub const PREDICATE_CTE_PREFIX: &str = "PRED_";

/// Columns every predicate CTE must select.
pub const REQUIRED_PREDICATE_COLUMNS: [&str; 3] = ["person_id", "population_id", "service_date"];

/// Table holding persons excluded from a population.
pub const PERSON_EXCLUSION_TABLE: &str = "dbo.PERSON_EXCLUSION";

/// Placeholder used when no literal population id is configured.
pub const POPULATION_ID_PLACEHOLDER: &str = "{{population_id}}";

/// Ontology contexts joined into the demographics CTE when none are configured.
pub const DEFAULT_ONTOLOGY_CONTEXTS: [&str; 3] = ["GENDER", "RACE", "ETHNICITY"];

/// T-SQL batch separator.
pub const BATCH_SEPARATOR: &str = "GO";

/// Minimum length of an override edit note, in characters, after trimming.
pub const MIN_NOTE_LENGTH: usize = 10;
