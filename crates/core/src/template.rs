//! Job templates (ComfyUI API-format workflows) and the style catalog.
//!
//! A profile directory holds one `<style>.json` workflow per style plus
//! an optional `default.json`. The style catalog maps each style name to
//! the prompt text injected into the workflow's text node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::NodeId;

/// File name of the profile used when no style-specific profile exists.
pub const DEFAULT_PROFILE_FILE: &str = "default.json";

/// Input key holding a node's step count.
pub const STEPS_INPUT: &str = "steps";

// ---------------------------------------------------------------------------
// JobTemplate
// ---------------------------------------------------------------------------

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    /// ComfyUI class type (e.g. "KSampler", "LoadImage").
    #[serde(default)]
    pub class_type: String,
    /// Literal values and links feeding this node.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Any other node keys (`_meta`, ...), carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TemplateNode {
    /// The numeric `steps` input, if this node declares one.
    pub fn declared_steps(&self) -> Option<f64> {
        self.inputs.get(STEPS_INPUT).and_then(serde_json::Value::as_f64)
    }
}

/// An immutable node graph loaded from a profile.
///
/// Replaced wholesale on style change; never edited in place. Use
/// [`crate::builder::build`] to derive a submittable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTemplate {
    nodes: BTreeMap<NodeId, TemplateNode>,
}

impl JobTemplate {
    /// Parse a template from API-format workflow JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read and parse a template file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        Self::from_json(&raw).map_err(|source| CoreError::InvalidTemplate {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn node(&self, id: &str) -> Option<&TemplateNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &TemplateNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deep copy of the node map, used as the starting point of a job.
    pub(crate) fn to_nodes(&self) -> BTreeMap<NodeId, TemplateNode> {
        self.nodes.clone()
    }
}

// ---------------------------------------------------------------------------
// Profile storage
// ---------------------------------------------------------------------------

/// A directory of named job-template files.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve the profile file for `style`.
    ///
    /// Exact `<style>.json` first, then `default.json`, otherwise
    /// [`CoreError::TemplateNotFound`].
    pub fn resolve(&self, style: &str) -> Result<PathBuf, CoreError> {
        let target = format!("{style}.json");
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.not_found(style));
            }
            Err(e) => return Err(CoreError::io(&self.dir, e)),
        };

        let mut default = None;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == target {
                tracing::debug!(style, path = %entry.path().display(), "Resolved style profile");
                return Ok(entry.path());
            }
            if name == DEFAULT_PROFILE_FILE {
                default = Some(entry.path());
            }
        }

        match default {
            Some(path) => {
                tracing::info!(style, path = %path.display(), "No profile for style, using default");
                Ok(path)
            }
            None => Err(self.not_found(style)),
        }
    }

    /// Resolve and load the template for `style`.
    pub fn load(&self, style: &str) -> Result<JobTemplate, CoreError> {
        let path = self.resolve(style)?;
        JobTemplate::load(&path)
    }

    fn not_found(&self, style: &str) -> CoreError {
        CoreError::TemplateNotFound {
            style: style.to_string(),
            dir: self.dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Style catalog
// ---------------------------------------------------------------------------

/// A selectable style and the prompt text it injects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleEntry {
    pub name: String,
    pub prompt: String,
}

/// Ordered list of styles. The first entry is the fallback style, so a
/// catalog is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StyleEntry>", into = "Vec<StyleEntry>")]
pub struct StyleCatalog {
    entries: Vec<StyleEntry>,
}

impl TryFrom<Vec<StyleEntry>> for StyleCatalog {
    type Error = CoreError;

    fn try_from(entries: Vec<StyleEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<StyleCatalog> for Vec<StyleEntry> {
    fn from(catalog: StyleCatalog) -> Self {
        catalog.entries
    }
}

impl StyleCatalog {
    pub fn new(entries: Vec<StyleEntry>) -> Result<Self, CoreError> {
        if entries.is_empty() {
            return Err(CoreError::EmptyCatalog);
        }
        Ok(Self { entries })
    }

    /// Load a catalog from a JSON array of `{"name", "prompt"}` objects.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let entries: Vec<StyleEntry> =
            serde_json::from_str(&raw).map_err(|source| CoreError::InvalidTemplate {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(entries)
    }

    /// Strict lookup, used when the user picks a style.
    pub fn get(&self, name: &str) -> Result<&StyleEntry, CoreError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CoreError::UnknownStyle(name.to_string()))
    }

    /// Lenient lookup: unknown styles fall back to the first entry.
    pub fn get_or_default(&self, name: &str) -> &StyleEntry {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .unwrap_or(&self.entries[0])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}
