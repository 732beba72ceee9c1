//! Static descriptors of how to invoke each agent CLI.

use crate::{BridgeError, ResumeToken};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

/// How the prompt reaches the agent process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Argument,
    Stdin,
    LineProtocol,
}

/// Which raw event vocabulary the agent writes on stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDialect {
    #[default]
    Claude,
    Droid,
}

/// On-disk descriptor, one JSON file per engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default)]
    pub dialect: EventDialect,
    #[serde(default)]
    pub prompt_flag: Option<String>,
    #[serde(default)]
    pub working_dir_flag: Option<String>,
    #[serde(default)]
    pub resume_flag: Option<String>,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub plan_mode_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A descriptor whose executable has been resolved on this host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub input_mode: InputMode,
    pub dialect: EventDialect,
    pub prompt_flag: Option<String>,
    pub working_dir_flag: Option<String>,
    pub resume_flag: Option<String>,
    pub model_flag: Option<String>,
    pub plan_mode_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Per-invocation inputs to [`Manifest::build_args`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationArgs<'a> {
    pub prompt: &'a str,
    pub working_dir: Option<&'a Path>,
    pub resume: Option<&'a ResumeToken>,
    pub model: Option<&'a str>,
    pub plan_mode: bool,
}

impl Manifest {
    pub fn from_descriptor(descriptor: ManifestDescriptor) -> Result<Self, String> {
        if descriptor.name.trim().is_empty() {
            return Err("name must be non-empty".to_string());
        }
        if descriptor.command.trim().is_empty() {
            return Err("command must be non-empty".to_string());
        }
        if let Some(template) = descriptor.resume_flag.as_deref() {
            shell_words::split(template)
                .map_err(|error| format!("resume_flag is not a valid template: {error}"))?;
        }
        let search_path = std::env::var_os("PATH");
        let executable = resolve_executable(&descriptor.command, search_path.as_deref())
            .ok_or_else(|| format!("command '{}' is not an executable", descriptor.command))?;

        Ok(Self {
            name: descriptor.name,
            executable,
            args: descriptor.args,
            input_mode: descriptor.input_mode,
            dialect: descriptor.dialect,
            prompt_flag: descriptor.prompt_flag,
            working_dir_flag: descriptor.working_dir_flag,
            resume_flag: descriptor.resume_flag,
            model_flag: descriptor.model_flag,
            plan_mode_args: descriptor.plan_mode_args,
            env: descriptor.env,
        })
    }

    /// Builds the argument vector: base args, working-dir flag, resume flag,
    /// model flag, plan-mode args, then the prompt when it travels as an argument.
    pub fn build_args(&self, invocation: &InvocationArgs<'_>) -> Vec<String> {
        let mut args = self.args.clone();

        if let (Some(flag), Some(dir)) = (self.working_dir_flag.as_ref(), invocation.working_dir) {
            args.push(flag.clone());
            args.push(dir.display().to_string());
        }

        if let (Some(template), Some(token)) = (self.resume_flag.as_deref(), invocation.resume) {
            args.extend(expand_resume_template(template, &token.session_id));
        }

        if let (Some(flag), Some(model)) = (self.model_flag.as_ref(), invocation.model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }

        if invocation.plan_mode {
            args.extend(self.plan_mode_args.iter().cloned());
        }

        if self.input_mode == InputMode::Argument {
            if let Some(flag) = self.prompt_flag.as_ref() {
                args.push(flag.clone());
            }
            args.push(invocation.prompt.to_string());
        }

        args
    }
}

fn expand_resume_template(template: &str, session_id: &str) -> Vec<String> {
    let parts = shell_words::split(template).unwrap_or_default();
    let mut expanded: Vec<String> = parts
        .iter()
        .map(|part| part.replace(SESSION_ID_PLACEHOLDER, session_id))
        .collect();
    if !parts.iter().any(|part| part.contains(SESSION_ID_PLACEHOLDER)) {
        expanded.push(session_id.to_string());
    }
    expanded
}

/// Resolves `command` to an executable file, either as a path or via `search_path`.
pub fn resolve_executable(command: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }

    std::env::split_paths(search_path?)
        .map(|dir| dir.join(command))
        .find(|path| is_executable_file(path))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Engines available on this host, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct ManifestRegistry {
    manifests: BTreeMap<String, Arc<Manifest>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` descriptor in `dir`. Malformed or unresolvable
    /// descriptors are logged and skipped.
    pub fn load_dir(dir: &Path) -> Result<Self, BridgeError> {
        let pattern = dir.join("*.json");
        let pattern = pattern.to_str().ok_or_else(|| {
            BridgeError::InvalidConfiguration(format!(
                "manifest directory '{}' is not valid UTF-8",
                dir.display()
            ))
        })?;
        let paths = glob::glob(pattern).map_err(|error| {
            BridgeError::InvalidConfiguration(format!("invalid manifest pattern: {error}"))
        })?;

        let mut registry = Self::new();
        for path in paths.flatten() {
            match load_manifest_file(&path) {
                Ok(manifest) => {
                    info!(engine = %manifest.name, executable = %manifest.executable.display(), "loaded engine manifest");
                    registry.insert(manifest);
                }
                Err(error) => warn!(%error, "skipping engine manifest"),
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, manifest: Manifest) {
        self.manifests
            .insert(manifest.name.clone(), Arc::new(manifest));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Manifest>> {
        self.manifests.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.manifests.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.manifests.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

pub fn load_manifest_file(path: &Path) -> Result<Manifest, BridgeError> {
    let manifest_error = |reason: String| BridgeError::Manifest {
        path: path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|error| manifest_error(error.to_string()))?;
    let descriptor: ManifestDescriptor =
        serde_json::from_str(&raw).map_err(|error| manifest_error(error.to_string()))?;
    Manifest::from_descriptor(descriptor).map_err(manifest_error)
}
