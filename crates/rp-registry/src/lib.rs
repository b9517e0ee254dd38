// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Workflow template registry.
//!
//! Templates live on disk as `<name>.json` next to a generated
//! `<name>_overrides.json` that enumerates every mutable parameter. The
//! override file is the mutability contract: deleting a parameter entry
//! freezes that parameter, and the file is locked to the template by a
//! SHA-256 of the template's canonical JSON. When the template changes, the
//! stale override file is moved to `.bak` and regenerated; user-edited
//! descriptions and categories are carried over for parameters whose key
//! survived the change.

/// Parameter extraction and output detection.
pub mod extract;

pub use extract::{WorkflowOutput, WorkflowParameter};

use chrono::Utc;
use rp_core::canonical::template_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const OVERRIDE_SUFFIX: &str = "_overrides.json";
const BACKUP_SUFFIX: &str = ".bak";

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Filesystem trouble.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),

    /// A template or override file failed to parse.
    #[error("failed to parse {file}: {reason}")]
    Parse {
        /// Offending file.
        file: String,
        /// Parse error detail.
        reason: String,
    },

    /// More than one terminal save node; the template is refused.
    #[error("template '{template}' has multiple output nodes: {nodes:?}; split it into separate templates")]
    AmbiguousOutput {
        /// Template name.
        template: String,
        /// The competing node ids.
        nodes: Vec<String>,
    },

    /// No template registered under that name.
    #[error("workflow template '{0}' not found")]
    UnknownTemplate(String),

    /// `apply_overrides` was given keys outside the override file.
    #[error("parameters not overridable in '{template}': {keys:?}")]
    NotOverridable {
        /// Template name.
        template: String,
        /// Every offending key.
        keys: Vec<String>,
    },
}

/// On-disk shape of `<name>_overrides.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverrideFile {
    /// `sha256:<hex>` of the template's canonical JSON.
    pub workflow_hash: String,
    /// Generation timestamp, RFC 3339.
    pub generated_at: String,
    /// Template name.
    pub workflow_name: String,
    /// File-level description (user-editable).
    #[serde(default)]
    pub description: String,
    /// The mutable parameters.
    #[serde(default)]
    pub parameters: Vec<WorkflowParameter>,
}

/// One discovered template.
#[derive(Clone, Debug)]
pub struct TemplateInfo {
    /// Template name (file stem).
    pub name: String,
    /// Parsed template document.
    pub template: Value,
    /// `sha256:<hex>` of the canonical template.
    pub hash: String,
    /// Mutable parameters, per the override file.
    pub parameters: Vec<WorkflowParameter>,
    /// Terminal save node, when the template has one.
    pub output: Option<WorkflowOutput>,
    /// Description from the override file.
    pub description: String,
}

/// What discovery did, per the startup log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    /// Templates seen.
    pub discovered: usize,
    /// Override files created fresh.
    pub generated: usize,
    /// Override files loaded as-is (hash matched).
    pub loaded: usize,
    /// Override files regenerated after a hash mismatch.
    pub regenerated: usize,
    /// Per-template failures; the rest of the directory still loads.
    pub errors: Vec<String>,
}

/// The registry: an explicit value constructed at startup and passed to the
/// worker and HTTP surface.
pub struct TemplateRegistry {
    templates: HashMap<String, TemplateInfo>,
}

impl TemplateRegistry {
    /// Scan `dir`, generating/validating override files, and build the
    /// registry. Individual template failures land in the summary; the rest
    /// of the directory still loads.
    pub async fn discover(dir: impl AsRef<Path>) -> Result<(Self, DiscoverySummary), RegistryError> {
        let dir = dir.as_ref();
        let mut templates = HashMap::new();
        let mut summary = DiscoverySummary::default();

        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.ends_with(OVERRIDE_SUFFIX) {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            summary.discovered += 1;
            match process_template(&path).await {
                Ok((info, outcome)) => {
                    match outcome {
                        ProcessOutcome::Generated => summary.generated += 1,
                        ProcessOutcome::Loaded => summary.loaded += 1,
                        ProcessOutcome::Regenerated => summary.regenerated += 1,
                    }
                    templates.insert(info.name.clone(), info);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "template failed to load");
                    summary.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }

        info!(
            discovered = summary.discovered,
            generated = summary.generated,
            loaded = summary.loaded,
            regenerated = summary.regenerated,
            errors = summary.errors.len(),
            "template discovery complete"
        );
        Ok((Self { templates }, summary))
    }

    /// An empty registry (tests, templateless deployments).
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Full info for one template.
    pub fn get(&self, name: &str) -> Option<&TemplateInfo> {
        self.templates.get(name)
    }

    /// The mutable parameters of a template.
    pub fn parameters(&self, name: &str) -> Option<&[WorkflowParameter]> {
        self.templates.get(name).map(|t| t.parameters.as_slice())
    }

    /// The output descriptor of a template.
    pub fn output(&self, name: &str) -> Option<&WorkflowOutput> {
        self.templates.get(name).and_then(|t| t.output.as_ref())
    }

    /// Bind overrides into a deep copy of the template. Unknown keys are a
    /// validation error listing every offender; applying the same overrides
    /// twice produces the same document.
    pub fn apply_overrides(
        &self,
        name: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Value, RegistryError> {
        let info = self
            .templates
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTemplate(name.to_string()))?;

        let allowed: HashMap<&str, &WorkflowParameter> = info
            .parameters
            .iter()
            .map(|p| (p.key.as_str(), p))
            .collect();

        let unknown: Vec<String> = overrides
            .keys()
            .filter(|k| !allowed.contains_key(k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(RegistryError::NotOverridable {
                template: name.to_string(),
                keys: unknown,
            });
        }

        let mut bound = info.template.clone();
        for (key, value) in overrides {
            let param = allowed[key.as_str()];
            if let Some(input) = bound
                .get_mut(&param.node_id)
                .and_then(|n| n.get_mut("inputs"))
                .and_then(|i| i.get_mut(&param.input_key))
            {
                *input = value.clone();
            }
        }
        Ok(bound)
    }
}

enum ProcessOutcome {
    Generated,
    Loaded,
    Regenerated,
}

async fn process_template(path: &Path) -> Result<(TemplateInfo, ProcessOutcome), RegistryError> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let raw = tokio::fs::read_to_string(path).await?;
    let template: Value = serde_json::from_str(&raw).map_err(|e| RegistryError::Parse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let hash = template_hash(&template);
    let output = extract::detect_output(&name, &template)?;
    let override_path = path.with_file_name(format!("{name}{OVERRIDE_SUFFIX}"));

    if override_path.exists() {
        let override_raw = tokio::fs::read_to_string(&override_path).await?;
        let existing: OverrideFile =
            serde_json::from_str(&override_raw).map_err(|e| RegistryError::Parse {
                file: override_path.display().to_string(),
                reason: e.to_string(),
            })?;

        if existing.workflow_hash == hash {
            // Hash matches: the file is the contract, user edits included.
            return Ok((
                TemplateInfo {
                    name: existing.workflow_name.clone(),
                    template,
                    hash,
                    parameters: existing.parameters,
                    output,
                    description: existing.description,
                },
                ProcessOutcome::Loaded,
            ));
        }

        // Stale: move aside, regenerate, carry curated text forward.
        let backup = override_path.with_file_name(format!("{name}{OVERRIDE_SUFFIX}{BACKUP_SUFFIX}"));
        tokio::fs::rename(&override_path, &backup).await?;
        warn!(template = %name, backup = %backup.display(), "template changed; overrides regenerated");

        let mut parameters = extract::extract_parameters(&template);
        merge_curated(&mut parameters, &existing.parameters);
        let file = write_override_file(&override_path, &name, &hash, &parameters).await?;
        return Ok((
            TemplateInfo {
                name,
                template,
                hash,
                parameters: file.parameters,
                output,
                description: file.description,
            },
            ProcessOutcome::Regenerated,
        ));
    }

    let parameters = extract::extract_parameters(&template);
    let file = write_override_file(&override_path, &name, &hash, &parameters).await?;
    Ok((
        TemplateInfo {
            name,
            template,
            hash,
            parameters: file.parameters,
            output,
            description: file.description,
        },
        ProcessOutcome::Generated,
    ))
}

/// Carry user-edited `description`/`category` from the stale file onto
/// regenerated parameters with the same key.
fn merge_curated(fresh: &mut [WorkflowParameter], stale: &[WorkflowParameter]) {
    let curated: HashMap<&str, &WorkflowParameter> =
        stale.iter().map(|p| (p.key.as_str(), p)).collect();
    for param in fresh.iter_mut() {
        if let Some(old) = curated.get(param.key.as_str()) {
            param.description = old.description.clone();
            param.category = old.category.clone();
        }
    }
}

async fn write_override_file(
    path: &Path,
    name: &str,
    hash: &str,
    parameters: &[WorkflowParameter],
) -> Result<OverrideFile, RegistryError> {
    let file = OverrideFile {
        workflow_hash: hash.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        workflow_name: name.to_string(),
        description: "Auto-generated parameter overrides. Edit descriptions, remove \
                      parameters to freeze them, or adjust categories."
            .to_string(),
        parameters: parameters.to_vec(),
    };
    let pretty = serde_json::to_string_pretty(&file).map_err(|e| RegistryError::Parse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;
    tokio::fs::write(path, pretty).await?;
    info!(file = %path.display(), parameters = parameters.len(), "override file written");
    Ok(file)
}
