use crate::config::settings::ServiceConfig;
use crate::config::types::{ResourceLimits, Result, RunnerError};
use crate::judge::languages::builtin_profiles;
use crate::judge::profile::{CommandTemplate, LanguageProfile};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Registry file entry. Quotas may be omitted and are filled from the
/// service defaults.
#[derive(Debug, Deserialize)]
struct ProfileEntry {
    id: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    display_name: Option<String>,
    image: String,
    source_file: String,
    #[serde(default)]
    binary_file: Option<String>,
    #[serde(default)]
    compile: Option<CommandTemplate>,
    run: CommandTemplate,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    limits: Option<ResourceLimits>,
    #[serde(default)]
    compile_limits: Option<ResourceLimits>,
    #[serde(default)]
    max_limits: Option<ResourceLimits>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    limit_address_space: Option<bool>,
}

impl ProfileEntry {
    fn into_profile(self, defaults: &ResourceLimits) -> LanguageProfile {
        let limits = self.limits.unwrap_or_else(|| defaults.clone());
        let compile_limits = self.compile_limits.unwrap_or_else(|| limits.clone());
        let max_limits = self.max_limits.unwrap_or_else(|| limits.scaled(2));
        LanguageProfile {
            display_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            aliases: self.aliases,
            image: self.image,
            source_file: self.source_file,
            binary_file: self.binary_file,
            compile: self.compile,
            run: self.run,
            extensions: self.extensions,
            limits,
            compile_limits,
            max_limits,
            environment: self.environment,
            limit_address_space: self.limit_address_space.unwrap_or(true),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    languages: Vec<ProfileEntry>,
}

/// Process-wide, read-only map from language name to profile.
///
/// Built once at startup; lookups need no locking.
#[derive(Debug)]
pub struct LanguageRegistry {
    profiles: Vec<Arc<LanguageProfile>>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_profiles(builtin_profiles())
    }

    /// Validate every profile and index ids and aliases. Duplicate names are
    /// rejected rather than shadowed.
    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(RunnerError::Config("registry has no languages".to_string()));
        }

        let mut index = HashMap::new();
        let mut stored = Vec::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            let slot = stored.len();
            for name in profile.names() {
                if let Some(previous) = index.insert(name.clone(), slot) {
                    let owner = stored
                        .get(previous)
                        .map(|p: &Arc<LanguageProfile>| p.id.as_str())
                        .unwrap_or(profile.id.as_str());
                    return Err(RunnerError::Config(format!(
                        "language name '{}' is claimed by both '{}' and '{}'",
                        name, owner, profile.id
                    )));
                }
            }
            log::debug!(
                "registered language {} (compiled: {})",
                profile.id,
                profile.is_compiled()
            );
            stored.push(Arc::new(profile));
        }

        Ok(Self {
            profiles: stored,
            index,
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, defaults: &ResourceLimits) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("failed to read registry {}: {}", path.display(), e))
        })?;
        let file: RegistryFile = serde_json::from_str(&content).map_err(|e| {
            RunnerError::Config(format!("failed to parse registry {}: {}", path.display(), e))
        })?;
        let registry = Self::from_profiles(
            file.languages
                .into_iter()
                .map(|entry| entry.into_profile(defaults))
                .collect(),
        )?;
        log::info!(
            "loaded {} language profiles from {}",
            registry.profiles.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn load(config: &ServiceConfig) -> Result<Self> {
        match &config.registry_path {
            Some(path) => Self::load_from_file(path, &config.default_limits),
            None => Self::builtin(),
        }
    }

    /// Look up a profile by id or alias, ignoring case and surrounding space.
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>> {
        let key = language.trim().to_lowercase();
        self.index
            .get(&key)
            .map(|&slot| Arc::clone(&self.profiles[slot]))
            .ok_or_else(|| RunnerError::UnsupportedLanguage(language.to_string()))
    }

    pub fn profiles(&self) -> &[Arc<LanguageProfile>] {
        &self.profiles
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_resolves_with_templates() {
        let registry = LanguageRegistry::builtin().unwrap();
        for id in ["cpp", "c", "java", "python", "javascript"] {
            let profile = registry.resolve(id).unwrap();
            assert_eq!(profile.id, id);
            assert!(!profile.run.args().is_empty());
            match id {
                "python" | "javascript" => assert!(profile.compile.is_none()),
                _ => assert!(!profile.compile.as_ref().unwrap().args().is_empty()),
            }
        }
    }

    #[test]
    fn test_aliases_and_case() {
        let registry = LanguageRegistry::builtin().unwrap();
        assert_eq!(registry.resolve("C++").unwrap().id, "cpp");
        assert_eq!(registry.resolve(" py ").unwrap().id, "python");
        assert_eq!(registry.resolve("node").unwrap().id, "javascript");
    }

    #[test]
    fn test_unknown_language() {
        let registry = LanguageRegistry::builtin().unwrap();
        let err = registry.resolve("cobol").unwrap_err();
        assert!(matches!(err, RunnerError::UnsupportedLanguage(ref l) if l == "cobol"));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut shadow = crate::judge::languages::python::python();
        shadow.id = "python2".to_string();
        let err = LanguageRegistry::from_profiles(vec![
            crate::judge::languages::python::python(),
            shadow,
        ])
        .unwrap_err();
        assert!(err.to_string().contains("claimed by both"));
    }

    #[test]
    fn test_file_entries_take_defaults() {
        let json = r#"{"languages": [
            {"id": "sh", "image": "busybox", "source_file": "main.sh",
             "run": ["/bin/sh", "{source}"]}
        ]}"#;
        let file: RegistryFile = serde_json::from_str(json).unwrap();
        let defaults = ResourceLimits::default();
        let profiles: Vec<_> = file
            .languages
            .into_iter()
            .map(|e| e.into_profile(&defaults))
            .collect();
        let registry = LanguageRegistry::from_profiles(profiles).unwrap();
        let profile = registry.resolve("sh").unwrap();
        assert_eq!(profile.limits, defaults);
        assert_eq!(profile.compile_limits, defaults);
        assert_eq!(profile.max_limits, defaults.scaled(2));
        assert!(profile.limit_address_space);
    }

    #[test]
    fn test_injection_placeholder_rejected_at_load() {
        let json = r#"{"languages": [
            {"id": "sh", "image": "busybox", "source_file": "main.sh",
             "run": ["/bin/sh", "-c", "{user_input}"]}
        ]}"#;
        let file: RegistryFile = serde_json::from_str(json).unwrap();
        let profiles: Vec<_> = file
            .languages
            .into_iter()
            .map(|e| e.into_profile(&ResourceLimits::default()))
            .collect();
        let err = LanguageRegistry::from_profiles(profiles).unwrap_err();
        assert!(matches!(err, RunnerError::Template(_)));
    }
}
