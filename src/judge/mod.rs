//! Language runtime registry.
//!
//! Core runtime stays language-agnostic. Profiles define compile/run command
//! templates and quota envelopes for each language.

pub mod languages;
pub mod profile;
pub mod registry;

pub use profile::{CommandTemplate, LanguageProfile, StepPaths, STDIN_FILE};
pub use registry::LanguageRegistry;
