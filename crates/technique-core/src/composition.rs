//! Composition file parsing and discovery.
//!
//! A composition file holds a `Composition` plus the `Primitive`
//! definitions it references, in YAML or JSON. Files are parsed into a
//! JSON value first so disallowed keys can be rejected before
//! deserialization.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use technique_types::composition::{Composition, Primitive};
use thiserror::Error;

use crate::compiler::{CompileError, validate_composition};
use crate::sanitize::find_disallowed_key;
use crate::semantics::SemanticsRegistry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompositionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("disallowed key at '{0}'")]
    DisallowedKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Invalid(#[from] CompileError),
}

impl CompositionError {
    pub fn code(&self) -> &'static str {
        match self {
            CompositionError::Parse(_) => "composition_parse_failed",
            CompositionError::DisallowedKey(_) => "composition_input_forbidden_key",
            CompositionError::Io(_) => "composition_io_failed",
            CompositionError::Invalid(e) => e.code(),
        }
    }
}

// ---------------------------------------------------------------------------
// File model
// ---------------------------------------------------------------------------

/// A composition together with its primitive definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionFile {
    #[serde(flatten)]
    pub composition: Composition,
    #[serde(default)]
    pub primitives: Vec<Primitive>,
}

impl CompositionFile {
    /// Structural validation against a semantics registry.
    pub fn validate(&self, registry: &SemanticsRegistry) -> Result<(), CompositionError> {
        validate_composition(&self.composition, &self.primitives, registry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn from_value(value: Value) -> Result<CompositionFile, CompositionError> {
    if let Some(finding) = find_disallowed_key(&value) {
        return Err(CompositionError::DisallowedKey(finding.path));
    }
    serde_json::from_value(value).map_err(|e| CompositionError::Parse(e.to_string()))
}

pub fn parse_composition_yaml(yaml: &str) -> Result<CompositionFile, CompositionError> {
    let value: Value = serde_yaml_ng::from_str(yaml).map_err(|e| CompositionError::Parse(e.to_string()))?;
    from_value(value)
}

pub fn parse_composition_json(json: &str) -> Result<CompositionFile, CompositionError> {
    let value: Value = serde_json::from_str(json).map_err(|e| CompositionError::Parse(e.to_string()))?;
    from_value(value)
}

pub fn serialize_composition_yaml(file: &CompositionFile) -> Result<String, CompositionError> {
    serde_yaml_ng::to_string(file).map_err(|e| CompositionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn is_composition_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "yaml" | "yml" | "json"))
}

/// Load a composition file; `.json` files are parsed as JSON, anything
/// else as YAML.
pub fn load_composition_file(path: &Path) -> Result<CompositionFile, CompositionError> {
    let content = std::fs::read_to_string(path)?;
    if is_json(path) {
        parse_composition_json(&content)
    } else {
        parse_composition_yaml(&content)
    }
}

pub fn save_composition_file(path: &Path, file: &CompositionFile) -> Result<(), CompositionError> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(file).map_err(|e| CompositionError::Parse(e.to_string()))?
    } else {
        serialize_composition_yaml(file)?
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Find composition files under `dir`, sorted by path. A missing directory
/// yields an empty list.
pub fn discover_compositions(dir: &Path) -> Result<Vec<PathBuf>, CompositionError> {
    let mut found = Vec::new();
    if dir.is_dir() {
        discover_recursive(dir, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn discover_recursive(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), CompositionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, found)?;
        } else if is_composition_file(&path) {
            found.push(path);
        }
    }
    Ok(())
}
