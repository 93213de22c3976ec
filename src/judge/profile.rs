//! Language profiles and their command templates.
//!
//! A template is an argv vector, never a shell string. The only substitutions
//! are the three scope paths below, so a submission can never inject arguments
//! or shell syntax into the command line.

use crate::config::types::{ResourceLimits, Result, RunnerError};
use crate::config::validator::{check_file_name, check_limits, ValidationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Scope file holding the submission's stdin.
pub const STDIN_FILE: &str = "stdin.txt";

/// Fixed placeholder set a template may reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    Source,
    Binary,
    Stdin,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "source" => Some(Placeholder::Source),
            "binary" => Some(Placeholder::Binary),
            "stdin" => Some(Placeholder::Stdin),
            _ => None,
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placeholder::Source => write!(f, "{{source}}"),
            Placeholder::Binary => write!(f, "{{binary}}"),
            Placeholder::Stdin => write!(f, "{{stdin}}"),
        }
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Slot(Placeholder),
}

fn parse_arg(arg: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = arg;
    while !rest.is_empty() {
        match (rest.find('{'), rest.find('}')) {
            (None, None) => {
                segments.push(Segment::Literal(rest));
                break;
            }
            (Some(open), close) if close.map_or(true, |c| c > open) => {
                if open > 0 {
                    segments.push(Segment::Literal(&rest[..open]));
                }
                let after = &rest[open + 1..];
                let end = after.find('}').ok_or_else(|| {
                    RunnerError::Template(format!("unbalanced '{{' in argument {arg:?}"))
                })?;
                let name = &after[..end];
                if name.contains('{') {
                    return Err(RunnerError::Template(format!(
                        "nested '{{' in argument {arg:?}"
                    )));
                }
                let slot = Placeholder::parse(name).ok_or_else(|| {
                    RunnerError::Template(format!(
                        "unknown placeholder {{{name}}} in argument {arg:?}"
                    ))
                })?;
                segments.push(Segment::Slot(slot));
                rest = &after[end + 1..];
            }
            _ => {
                return Err(RunnerError::Template(format!(
                    "unbalanced '}}' in argument {arg:?}"
                )))
            }
        }
    }
    Ok(segments)
}

/// Concrete scope paths substituted into a template.
#[derive(Clone, Debug)]
pub struct StepPaths {
    pub source: PathBuf,
    pub binary: Option<PathBuf>,
    pub stdin: PathBuf,
}

impl StepPaths {
    fn lookup(&self, slot: Placeholder) -> Result<&str> {
        let path = match slot {
            Placeholder::Source => Some(&self.source),
            Placeholder::Binary => self.binary.as_ref(),
            Placeholder::Stdin => Some(&self.stdin),
        }
        .ok_or_else(|| RunnerError::Template(format!("{slot} has no value for this profile")))?;
        path.to_str()
            .ok_or_else(|| RunnerError::Template(format!("{slot} path is not UTF-8: {}", path.display())))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandTemplate(argv.into_iter().map(Into::into).collect())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Literal program name, when argv[0] is not itself a placeholder.
    pub fn program(&self) -> Option<&str> {
        self.0
            .first()
            .map(String::as_str)
            .filter(|p| !p.contains('{'))
    }

    pub fn placeholders(&self) -> Result<Vec<Placeholder>> {
        let mut found = Vec::new();
        for arg in &self.0 {
            for segment in parse_arg(arg)? {
                if let Segment::Slot(slot) = segment {
                    found.push(slot);
                }
            }
        }
        Ok(found)
    }

    pub fn validate(&self, has_binary: bool) -> Result<()> {
        if self.0.is_empty() || self.0[0].trim().is_empty() {
            return Err(RunnerError::Template("command template is empty".to_string()));
        }
        let slots = self.placeholders()?;
        if !has_binary && slots.contains(&Placeholder::Binary) {
            return Err(RunnerError::Template(
                "{binary} used but the profile declares no binary_file".to_string(),
            ));
        }
        Ok(())
    }

    pub fn render(&self, paths: &StepPaths) -> Result<Vec<String>> {
        self.0
            .iter()
            .map(|arg| {
                let mut out = String::with_capacity(arg.len());
                for segment in parse_arg(arg)? {
                    match segment {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Slot(slot) => out.push_str(paths.lookup(slot)?),
                    }
                }
                Ok(out)
            })
            .collect()
    }
}

/// How to compile and run one language. Immutable once the registry is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub display_name: String,
    /// Base image reference for the docker backend
    pub image: String,
    /// File name the submission is written to inside the scope
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_file: Option<String>,
    /// None for interpreted languages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub limits: ResourceLimits,
    pub compile_limits: ResourceLimits,
    /// Ceiling for per-request overrides
    pub max_limits: ResourceLimits,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Cap virtual address space at the memory quota. Runtimes that reserve
    /// large heaps up front (JVM, V8) turn this off and rely on their own
    /// heap flags plus the cgroup.
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
}

fn default_true() -> bool {
    true
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Every name `resolve` accepts for this profile, lowercased.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.id.to_lowercase()).chain(self.aliases.iter().map(|a| a.to_lowercase()))
    }

    pub fn step_paths(&self, root: &Path, stdin_file: &str) -> StepPaths {
        StepPaths {
            source: root.join(&self.source_file),
            binary: self.binary_file.as_ref().map(|b| root.join(b)),
            stdin: root.join(stdin_file),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_binary = self.binary_file.is_some();
        if let Some(compile) = &self.compile {
            compile
                .validate(has_binary)
                .map_err(|e| RunnerError::Template(format!("{}: compile: {}", self.id, e)))?;
        }
        self.run
            .validate(has_binary)
            .map_err(|e| RunnerError::Template(format!("{}: run: {}", self.id, e)))?;

        let mut result = ValidationResult::new();
        if self.id.trim().is_empty() || self.id.chars().any(char::is_whitespace) {
            result.add_error(format!("id {:?} must be a non-empty token", self.id));
        }
        if self.image.trim().is_empty() {
            result.add_error("image cannot be empty".to_string());
        }
        check_file_name("source_file", &self.source_file, &mut result);
        if self.source_file == STDIN_FILE {
            result.add_error(format!("source_file cannot be {}", STDIN_FILE));
        }
        if let Some(binary) = &self.binary_file {
            check_file_name("binary_file", binary, &mut result);
            if binary == &self.source_file {
                result.add_error("binary_file cannot overwrite source_file".to_string());
            }
            if binary == STDIN_FILE {
                result.add_error(format!("binary_file cannot be {}", STDIN_FILE));
            }
        }
        check_limits("limits", &self.limits, &mut result);
        check_limits("compile_limits", &self.compile_limits, &mut result);
        check_limits("max_limits", &self.max_limits, &mut result);
        if !self.limits.fits_within(&self.max_limits) {
            result.add_error("limits exceed max_limits".to_string());
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.starts_with("LD_") {
                result.add_error(format!("environment key {key:?} is not allowed"));
            }
        }
        result.into_result(&format!("language profile '{}'", self.id))
    }
}
