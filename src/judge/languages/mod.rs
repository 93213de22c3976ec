//! Builtin language profiles.

pub mod cpp;
pub mod java;
pub mod javascript;
pub mod python;

use crate::judge::profile::LanguageProfile;

/// Profiles served when no registry file is configured.
pub fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        cpp::cpp(),
        cpp::c(),
        java::java(),
        python::python(),
        javascript::javascript(),
    ]
}
