//! Clinical-query (CQL) generation.
//!
//! [`CqlGenerator`] walks a measure's populations in a fixed order and emits a complete
//! library: preamble, value set declarations, the measurement period parameter, helper
//! definitions, one definition per population and the supplemental data elements footer.
//! Measure-family boilerplate comes from a [`BundleRegistry`].

mod bundles;
mod expression;
mod generator;

pub use bundles::{
    BoilerplateBundle, BundleDefinition, BundleRegistry, BundleValueSet, MeasurePredicate,
};
pub use generator::{library_name, CqlGenerator};
pub(crate) use generator::population_default_id;
