//! Measure-family boilerplate bundles.
//!
//! A [`BoilerplateBundle`] is a static library of extra definitions (plus the value sets they
//! retrieve, the exclusions they contribute and optionally a fixed numerator) that applies to a
//! family of measures. The [`BundleRegistry`] pairs each bundle with a predicate over measure
//! metadata; the first bundle whose predicate accepts the measure is used. New measure families
//! are added by registering another bundle, without touching the generator walk.

use std::fmt;
use std::sync::Arc;
use ums::Measure;

/// Predicate deciding whether a bundle applies to a measure.
pub type MeasurePredicate = Arc<dyn Fn(&Measure) -> bool + Send + Sync>;

/// A value set declared by a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleValueSet {
    pub name: String,
    pub oid: String,
}

/// A named definition contributed by a bundle. The body may span several lines but must not
/// contain blank lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleDefinition {
    pub name: String,
    pub body: String,
}

#[derive(Clone)]
pub struct BoilerplateBundle {
    name: String,
    predicate: MeasurePredicate,
    pub value_sets: Vec<BundleValueSet>,
    pub definitions: Vec<BundleDefinition>,
    /// Expressions OR-joined into the Denominator Exclusion.
    pub exclusions: Vec<String>,
    /// Replaces the authored numerator tree when set.
    pub numerator: Option<String>,
}

impl fmt::Debug for BoilerplateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoilerplateBundle")
            .field("name", &self.name)
            .field("definitions", &self.definitions.len())
            .field("exclusions", &self.exclusions)
            .field("numerator", &self.numerator)
            .finish()
    }
}

impl BoilerplateBundle {
    /// Creates an empty bundle that never matches until a predicate is set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(|_| false),
            value_sets: Vec::new(),
            definitions: Vec::new(),
            exclusions: Vec::new(),
            numerator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Measure) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Matches when the lower-cased title or id contains any of `keywords`.
    pub fn with_keywords(self, keywords: &[&str]) -> Self {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        self.with_predicate(move |measure| {
            let haystack = format!("{} {}", measure.title, measure.id).to_lowercase();
            keywords.iter().any(|k| haystack.contains(k.as_str()))
        })
    }

    pub fn value_set(mut self, name: &str, oid: &str) -> Self {
        self.value_sets.push(BundleValueSet {
            name: name.into(),
            oid: oid.into(),
        });
        self
    }

    pub fn definition(mut self, name: &str, body: &str) -> Self {
        self.definitions.push(BundleDefinition {
            name: name.into(),
            body: body.trim_matches('\n').into(),
        });
        self
    }

    pub fn exclusion(mut self, expression: &str) -> Self {
        self.exclusions.push(expression.into());
        self
    }

    pub fn numerator(mut self, expression: &str) -> Self {
        self.numerator = Some(expression.into());
        self
    }

    pub fn matches(&self, measure: &Measure) -> bool {
        (self.predicate)(measure)
    }
}

/// Ordered collection of bundles; the first match wins.
#[derive(Clone, Debug)]
pub struct BundleRegistry {
    bundles: Vec<BoilerplateBundle>,
}

impl Default for BundleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl BundleRegistry {
    pub fn empty() -> Self {
        Self {
            bundles: Vec::new(),
        }
    }

    /// Registry holding the colorectal, cervical and breast cancer screening bundles.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(colorectal_screening());
        registry.register(cervical_screening());
        registry.register(breast_screening());
        registry
    }

    pub fn register(&mut self, bundle: BoilerplateBundle) {
        self.bundles.push(bundle);
    }

    pub fn select(&self, measure: &Measure) -> Option<&BoilerplateBundle> {
        self.bundles.iter().find(|bundle| bundle.matches(measure))
    }

    pub fn names(&self) -> Vec<&str> {
        self.bundles.iter().map(BoilerplateBundle::name).collect()
    }
}

// ============================================================================
// Standard bundles
// ============================================================================

fn colorectal_screening() -> BoilerplateBundle {
    BoilerplateBundle::new("colorectal-cancer-screening")
        .with_keywords(&["colorectal", "colon cancer", "cms130"])
        .value_set("Colonoscopy", "2.16.840.1.113883.3.464.1003.108.12.1020")
        .value_set(
            "Fecal Occult Blood Test (FOBT)",
            "2.16.840.1.113883.3.464.1003.198.12.1011",
        )
        .value_set("CT Colonography", "2.16.840.1.113883.3.464.1003.108.12.1038")
        .value_set(
            "Malignant Neoplasm of Colon",
            "2.16.840.1.113883.3.464.1003.108.12.1001",
        )
        .value_set("Total Colectomy", "2.16.840.1.113883.3.464.1003.198.12.1019")
        .definition(
            "Colonoscopy Performed",
            r#"
  [Procedure: "Colonoscopy"] Colonoscopy
    where Colonoscopy.status = 'completed'
      and Colonoscopy.performed.toInterval() ends 10 years or less on or before end of "Measurement Period"
"#,
        )
        .definition(
            "Fecal Occult Blood Test Performed",
            r#"
  [Observation: "Fecal Occult Blood Test (FOBT)"] FecalOccult
    where FecalOccult.status in { 'final', 'amended', 'corrected' }
      and FecalOccult.value is not null
      and FecalOccult.effective.toInterval() during "Measurement Period"
"#,
        )
        .definition(
            "CT Colonography Performed",
            r#"
  [Observation: "CT Colonography"] Colonography
    where Colonography.status in { 'final', 'amended', 'corrected' }
      and Colonography.effective.toInterval() ends 5 years or less on or before end of "Measurement Period"
"#,
        )
        .definition(
            "Malignant Neoplasm",
            r#"
  [Condition: "Malignant Neoplasm of Colon"] ColorectalCancer
    where ColorectalCancer.prevalenceInterval() starts on or before end of "Measurement Period"
"#,
        )
        .definition(
            "Total Colectomy Performed",
            r#"
  [Procedure: "Total Colectomy"] Colectomy
    where Colectomy.status = 'completed'
      and Colectomy.performed.toInterval() starts on or before end of "Measurement Period"
"#,
        )
        .exclusion("exists \"Malignant Neoplasm\"")
        .exclusion("exists \"Total Colectomy Performed\"")
        .numerator(
            "exists \"Colonoscopy Performed\" or exists \"Fecal Occult Blood Test Performed\" or exists \"CT Colonography Performed\"",
        )
}

fn cervical_screening() -> BoilerplateBundle {
    BoilerplateBundle::new("cervical-cancer-screening")
        .with_keywords(&["cervical", "cms124"])
        .value_set("Pap Test", "2.16.840.1.113883.3.464.1003.108.12.1017")
        .value_set("HPV Test", "2.16.840.1.113883.3.464.1003.110.12.1059")
        .value_set(
            "Hysterectomy with No Residual Cervix",
            "2.16.840.1.113883.3.464.1003.198.12.1014",
        )
        .definition(
            "Cervical Cytology Within 3 Years",
            r#"
  [Observation: "Pap Test"] CervicalCytology
    where CervicalCytology.status in { 'final', 'amended', 'corrected' }
      and CervicalCytology.value is not null
      and CervicalCytology.effective.toInterval() ends 3 years or less on or before end of "Measurement Period"
"#,
        )
        .definition(
            "HPV Test Within 5 Years For Women Age 30 and Older",
            r#"
  [Observation: "HPV Test"] HPVTest
    where HPVTest.status in { 'final', 'amended', 'corrected' }
      and HPVTest.value is not null
      and AgeInYearsAt(date from start of HPVTest.effective.toInterval()) >= 30
      and HPVTest.effective.toInterval() ends 5 years or less on or before end of "Measurement Period"
"#,
        )
        .definition(
            "Absence of Cervix",
            r#"
  [Procedure: "Hysterectomy with No Residual Cervix"] NoCervixProcedure
    where NoCervixProcedure.status = 'completed'
      and NoCervixProcedure.performed.toInterval() ends on or before end of "Measurement Period"
"#,
        )
        .exclusion("exists \"Absence of Cervix\"")
        .numerator(
            "exists \"Cervical Cytology Within 3 Years\" or exists \"HPV Test Within 5 Years For Women Age 30 and Older\"",
        )
}

fn breast_screening() -> BoilerplateBundle {
    BoilerplateBundle::new("breast-cancer-screening")
        .with_keywords(&["breast cancer", "mammogra", "cms125"])
        .value_set("Mammography", "2.16.840.1.113883.3.464.1003.108.12.1018")
        .value_set(
            "Bilateral Mastectomy",
            "2.16.840.1.113883.3.464.1003.198.12.1005",
        )
        .definition(
            "Mammography Performed",
            r#"
  [Observation: "Mammography"] Mammogram
    where Mammogram.status in { 'final', 'amended', 'corrected' }
      and Mammogram.effective.toInterval() ends during Interval[start of "Measurement Period" - 27 months, end of "Measurement Period"]
"#,
        )
        .definition(
            "Bilateral Mastectomy Performed",
            r#"
  [Procedure: "Bilateral Mastectomy"] Mastectomy
    where Mastectomy.status = 'completed'
      and Mastectomy.performed.toInterval() ends on or before end of "Measurement Period"
"#,
        )
        .exclusion("exists \"Bilateral Mastectomy Performed\"")
        .numerator("exists \"Mammography Performed\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure(id: &str, title: &str) -> Measure {
        serde_json::from_value(serde_json::json!({ "id": id, "title": title })).unwrap()
    }

    #[test]
    fn test_standard_registry_selects_by_title_or_id() {
        let registry = BundleRegistry::standard();
        assert_eq!(
            registry
                .select(&measure("CMS130v12", "Screening"))
                .map(BoilerplateBundle::name),
            Some("colorectal-cancer-screening")
        );
        assert_eq!(
            registry
                .select(&measure("X1", "Cervical Cancer Screening"))
                .map(BoilerplateBundle::name),
            Some("cervical-cancer-screening")
        );
        assert_eq!(
            registry
                .select(&measure("X2", "Mammography follow-up"))
                .map(BoilerplateBundle::name),
            Some("breast-cancer-screening")
        );
        assert!(registry.select(&measure("CMS165", "Controlling High Blood Pressure")).is_none());
    }

    #[test]
    fn test_custom_bundle_registration() {
        let mut registry = BundleRegistry::empty();
        registry.register(
            BoilerplateBundle::new("diabetes")
                .with_predicate(|m| m.id.starts_with("CMS122"))
                .definition("HbA1c Test", "  [Observation: \"HbA1c\"] A1c")
                .numerator("exists \"HbA1c Test\""),
        );
        let bundle = registry.select(&measure("CMS122v12", "")).unwrap();
        assert_eq!(bundle.definitions[0].name, "HbA1c Test");
        assert_eq!(registry.names(), vec!["diabetes"]);
    }

    #[test]
    fn test_first_matching_bundle_wins() {
        let mut registry = BundleRegistry::empty();
        registry.register(BoilerplateBundle::new("first").with_keywords(&["screening"]));
        registry.register(BoilerplateBundle::new("second").with_keywords(&["screening"]));
        assert_eq!(
            registry.select(&measure("M", "Screening")).unwrap().name(),
            "first"
        );
    }

    #[test]
    fn test_bundle_definitions_have_no_blank_lines() {
        for bundle in BundleRegistry::standard().bundles {
            for definition in &bundle.definitions {
                assert!(
                    !definition.body.lines().any(|l| l.trim().is_empty()),
                    "{}",
                    definition.name
                );
            }
        }
    }
}
