//! Command definitions: external programs the registry may run on request.
//!
//! Definitions are loaded from a JSON file:
//!
//! ```json
//! {
//!   "commands": [
//!     {
//!       "name": "open-folder",
//!       "exec": "xdg-open",
//!       "args": [ { "param": "path", "required": true } ]
//!     },
//!     {
//!       "name": "grep",
//!       "exec": "/usr/bin/grep",
//!       "workdir": "data",
//!       "args": [ "-n", { "value": "--regexp={{pattern}}", "params": ["pattern"] }, "notes.txt" ]
//!     }
//!   ]
//! }
//! ```
//!
//! Each argument is a literal, a single parameter (`param`), or a `value` with `{{name}}`
//! placeholders for the parameters it lists.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern"));

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid command definition file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    /// Falls back to the argument's `required`, then to optional.
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParameterRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        required: Option<bool>,
    },
}

impl From<ParameterRepr> for ParameterSpec {
    fn from(repr: ParameterRepr) -> Self {
        match repr {
            ParameterRepr::Name(name) => ParameterSpec { name, required: None },
            ParameterRepr::Full { name, required } => ParameterSpec { name, required },
        }
    }
}

/// One entry of a definition's argument list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "ArgumentRepr")]
pub struct ArgumentTemplate {
    pub value: Option<String>,
    pub params: Vec<ParameterSpec>,
    pub required: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgumentRepr {
    Literal(String),
    Full {
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        param: Option<String>,
        #[serde(default)]
        params: Vec<ParameterRepr>,
        #[serde(default)]
        required: Option<bool>,
    },
}

impl From<ArgumentRepr> for ArgumentTemplate {
    fn from(repr: ArgumentRepr) -> Self {
        match repr {
            ArgumentRepr::Literal(value) => ArgumentTemplate::literal(value),
            ArgumentRepr::Full {
                value,
                param,
                params,
                required,
            } => {
                let mut specs: Vec<ParameterSpec> = param
                    .map(|name| ParameterSpec { name, required: None })
                    .into_iter()
                    .collect();
                specs.extend(params.into_iter().map(ParameterSpec::from));
                ArgumentTemplate {
                    value,
                    params: specs,
                    required,
                }
            }
        }
    }
}

impl ArgumentTemplate {
    pub fn literal(value: impl Into<String>) -> Self {
        ArgumentTemplate {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// An argument that is exactly the value of one parameter.
    pub fn parameter(name: impl Into<String>, required: bool) -> Self {
        ArgumentTemplate {
            value: None,
            params: vec![ParameterSpec {
                name: name.into(),
                required: Some(required),
            }],
            required: None,
        }
    }

    /// A `value` containing `{{name}}` placeholders for `params`.
    pub fn template(value: impl Into<String>, params: &[&str]) -> Self {
        ArgumentTemplate {
            value: Some(value.into()),
            params: params
                .iter()
                .map(|name| ParameterSpec {
                    name: name.to_string(),
                    required: None,
                })
                .collect(),
            required: None,
        }
    }

    pub fn is_required(&self, spec: &ParameterSpec) -> bool {
        spec.required.or(self.required).unwrap_or(false)
    }

    fn validate(&self) -> Result<(), String> {
        let Some(value) = &self.value else {
            if self.params.len() != 1 {
                return Err("Without explicit `value`, exactly one `param` must be specified".into());
            }
            return Ok(());
        };
        let mut referenced = HashSet::new();
        for capture in PLACEHOLDER.captures_iter(value) {
            let name = capture[1].to_lowercase();
            if !self.params.iter().any(|p| p.name.to_lowercase() == name) {
                return Err(format!("Parameter `{}` referenced but not listed", &capture[1]));
            }
            referenced.insert(name);
        }
        for spec in &self.params {
            if spec.name.trim().is_empty() {
                return Err("You cannot list a parameter without a name".into());
            }
            if !referenced.contains(&spec.name.to_lowercase()) {
                return Err(format!("Parameter `{}` listed but not referenced", spec.name));
            }
        }
        Ok(())
    }

    /// Expands the template. `values` is keyed by lowercased parameter name.
    ///
    /// Returns `None` for a lone parameter that was not supplied.
    pub fn interpolate(&self, values: &BTreeMap<String, String>) -> Option<String> {
        match &self.value {
            None => {
                let spec = self.params.first()?;
                values.get(&spec.name.trim().to_lowercase()).cloned()
            }
            Some(value) => Some(
                PLACEHOLDER
                    .replace_all(value, |capture: &regex::Captures<'_>| {
                        values
                            .get(&capture[1].to_lowercase())
                            .cloned()
                            .unwrap_or_default()
                    })
                    .into_owned(),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandDefinition {
    #[serde(default)]
    pub name: String,
    /// As written; resolved by [`CommandDefinition::validate`].
    pub exec: PathBuf,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<ArgumentTemplate>,
    #[serde(skip)]
    resolved: Option<Resolved>,
    #[serde(skip)]
    validation_error: Option<String>,
}

#[derive(Debug, Clone)]
struct Resolved {
    exec: PathBuf,
    workdir: PathBuf,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, exec: impl Into<PathBuf>, args: Vec<ArgumentTemplate>) -> Self {
        CommandDefinition {
            name: name.into(),
            exec: exec.into(),
            workdir: None,
            args,
            resolved: None,
            validation_error: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Resolves paths against `base_dir` and checks the argument templates.
    ///
    /// Only the first problem is recorded. Returns whether the definition may run.
    pub fn validate(&mut self, base_dir: &Path) -> bool {
        self.resolved = None;
        self.validation_error = self.check(base_dir).err();
        self.validation_error.is_none()
    }

    fn check(&mut self, base_dir: &Path) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Command must specify its `name`".into());
        }
        let exec = find_executable(&self.exec, base_dir)
            .ok_or_else(|| format!("Executable `exec:` {} not found", self.exec.display()))?;
        let workdir = match &self.workdir {
            None => default_workdir()?,
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base_dir.join(dir),
        };
        if !workdir.is_dir() {
            return Err(format!("Working Directory {} not found", workdir.display()));
        }
        for (i, arg) in self.args.iter().enumerate() {
            arg.validate().map_err(|e| format!("Invalid argument {i}: {e}"))?;
        }
        self.resolved = Some(Resolved { exec, workdir });
        Ok(())
    }

    /// Why the definition may not run, if it failed validation.
    pub fn validation_error(&self) -> Option<&str> {
        self.validation_error.as_deref()
    }

    pub fn resolved_exec(&self) -> Option<&Path> {
        self.resolved.as_ref().map(|r| r.exec.as_path())
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.resolved.as_ref().map(|r| r.workdir.as_path())
    }

    /// Collects the parameter values the arguments reference.
    ///
    /// Names match case-insensitively; the result is keyed by lowercased name.
    pub fn collect_parameters(
        &self,
        supplied: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, String> {
        let mut values = BTreeMap::new();
        for arg in &self.args {
            for spec in &arg.params {
                let key = spec.name.trim().to_lowercase();
                if key.is_empty() || values.contains_key(&key) {
                    continue;
                }
                let found = supplied
                    .iter()
                    .find(|(name, _)| name.to_lowercase() == key)
                    .map(|(_, value)| value.clone());
                match found {
                    Some(value) => {
                        values.insert(key, value);
                    }
                    None if arg.is_required(spec) => {
                        return Err(format!("Required argument {} not provided", spec.name.trim()));
                    }
                    None => {}
                }
            }
        }
        Ok(values)
    }

    /// The process argument list for `supplied` parameters.
    pub fn arguments(&self, supplied: &BTreeMap<String, String>) -> Result<Vec<String>, String> {
        let values = self.collect_parameters(supplied)?;
        Ok(self.args.iter().filter_map(|arg| arg.interpolate(&values)).collect())
    }
}

/// The user's home directory, or the current one where there is no home.
fn default_workdir() -> Result<PathBuf, String> {
    match std::env::home_dir().filter(|home| home.is_dir()) {
        Some(home) => Ok(home),
        None => std::env::current_dir().map_err(|e| format!("No working directory: {e}")),
    }
}

fn find_executable(exec: &Path, base_dir: &Path) -> Option<PathBuf> {
    if exec.as_os_str().is_empty() {
        return None;
    }
    if exec.is_absolute() {
        return exec.is_file().then(|| exec.to_path_buf());
    }
    let local = base_dir.join(exec);
    if local.is_file() {
        return Some(local);
    }
    if exec.components().count() > 1 {
        return None;
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exec))
        .find(|candidate| candidate.is_file())
}

#[derive(Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    commands: Vec<CommandDefinition>,
}

/// Loads and validates the definitions in `path`.
///
/// Relative paths inside the file resolve against its directory. Definitions that fail
/// validation are returned too, so requests naming them fail with the reason.
pub fn load_file(path: &Path) -> Result<Vec<CommandDefinition>, Error> {
    let text = std::fs::read_to_string(path)?;
    let file: DefinitionFile = serde_json::from_str(&text)?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    let mut commands = file.commands;
    for command in &mut commands {
        if !command.validate(base_dir) {
            logwise::warn_sync!(
                "Command definition {name} is invalid: {reason}",
                name = command.name.as_str(),
                reason = command.validation_error().unwrap_or_default()
            );
        }
    }
    Ok(commands)
}
