// Startup validation for registry entries and quota sets.
// Fails fast with every problem listed, not just the first.

use crate::config::types::{ResourceLimits, Result, RunnerError};

/// Accumulated validation problems for one config object
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log warnings and turn errors into a single config error.
    pub fn into_result(self, subject: &str) -> Result<()> {
        for warning in &self.warnings {
            log::warn!("{}: {}", subject, warning);
        }
        if self.is_valid() {
            Ok(())
        } else {
            Err(RunnerError::Config(format!(
                "{} is invalid: {}",
                subject,
                self.errors.join("; ")
            )))
        }
    }
}

/// Reject zero budgets; warn on values that are legal but suspicious.
pub fn check_limits(label: &str, limits: &ResourceLimits, result: &mut ValidationResult) {
    if limits.cpu_ms == 0 {
        result.add_error(format!("{label}.cpu_ms cannot be zero"));
    }
    if limits.memory_mb == 0 {
        result.add_error(format!("{label}.memory_mb cannot be zero"));
    }
    if limits.max_processes == 0 {
        result.add_error(format!("{label}.max_processes cannot be zero"));
    }
    if limits.timeout_ms == 0 {
        result.add_error(format!("{label}.timeout_ms cannot be zero"));
    }
    if limits.open_files < 8 {
        result.add_error(format!(
            "{label}.open_files {} leaves no room for stdio",
            limits.open_files
        ));
    }
    if limits.memory_mb < 8 {
        result.add_warning(format!(
            "{label}.memory_mb {} is very low, most runtimes will not start",
            limits.memory_mb
        ));
    }
    if limits.cpu_ms > limits.timeout_ms.saturating_mul(16) {
        result.add_warning(format!(
            "{label}.cpu_ms {} can never be reached within timeout_ms {}",
            limits.cpu_ms, limits.timeout_ms
        ));
    }
}

pub fn validate_limits(label: &str, limits: &ResourceLimits) -> Result<()> {
    let mut result = ValidationResult::new();
    check_limits(label, limits, &mut result);
    result.into_result(label)
}

/// Source and binary names must be plain file names inside the scope.
pub fn check_file_name(label: &str, name: &str, result: &mut ValidationResult) {
    if name.is_empty() {
        result.add_error(format!("{label} cannot be empty"));
        return;
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        result.add_error(format!("{label} must be a plain file name: {name:?}"));
    }
    if name.starts_with('-') {
        result.add_error(format!("{label} cannot start with '-': {name:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_pass() {
        assert!(validate_limits("limits", &ResourceLimits::default()).is_ok());
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let limits = ResourceLimits {
            cpu_ms: 0,
            timeout_ms: 0,
            ..ResourceLimits::default()
        };
        let message = validate_limits("limits", &limits).unwrap_err().to_string();
        assert!(message.contains("limits.cpu_ms"));
        assert!(message.contains("limits.timeout_ms"));
    }

    #[test]
    fn test_low_memory_is_only_a_warning() {
        let limits = ResourceLimits {
            memory_mb: 4,
            ..ResourceLimits::default()
        };
        let mut result = ValidationResult::new();
        check_limits("limits", &limits, &mut result);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_file_names() {
        let mut result = ValidationResult::new();
        check_file_name("source_file", "Main.java", &mut result);
        assert!(result.is_valid());

        for bad in ["", "..", "src/main.c", "-rf"] {
            let mut result = ValidationResult::new();
            check_file_name("source_file", bad, &mut result);
            assert!(!result.is_valid(), "{bad:?} should be rejected");
        }
    }
}
