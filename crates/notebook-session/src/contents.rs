//! Persisted notebook document shape.
//!
//! ```json
//! {"metadata": {"kernelspec": {..}, "language_info": {..}},
//!  "nbformat": 4, "nbformat_minor": 2,
//!  "cells": [{"cell_type": "code", "source": [..], "metadata": {"language": "sql"},
//!             "outputs": [..], "execution_count": 1}]}
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kernel_messages::Output;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::kernel::{ContentManager, KernelSpec};

pub const NBFORMAT_MAJOR: u32 = 4;
pub const NBFORMAT_MINOR: u32 = 2;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookContents {
    #[serde(default)]
    pub metadata: NotebookMetadata,
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    #[serde(default = "default_nbformat_minor")]
    pub nbformat_minor: u32,
    #[serde(default)]
    pub cells: Vec<CellContents>,
}

fn default_nbformat() -> u32 {
    NBFORMAT_MAJOR
}

fn default_nbformat_minor() -> u32 {
    NBFORMAT_MINOR
}

impl Default for NotebookContents {
    fn default() -> Self {
        NotebookContents {
            metadata: NotebookMetadata::default(),
            nbformat: NBFORMAT_MAJOR,
            nbformat_minor: NBFORMAT_MINOR,
            cells: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelspec: Option<KernelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_info: Option<LanguageInfo>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    /// Either a mode name or an object with a `name` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codemirror_mode: Option<Value>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

impl LanguageInfo {
    pub fn new(name: impl Into<String>) -> Self {
        LanguageInfo {
            name: name.into(),
            ..Default::default()
        }
    }

    fn codemirror_name(&self) -> Option<&str> {
        match self.codemirror_mode.as_ref()? {
            Value::String(name) => Some(name.as_str()),
            Value::Object(mode) => mode.get("name").and_then(Value::as_str),
            _ => None,
        }
    }

    /// The editor language this info describes: codemirror mode first, then
    /// `name`, then `mimetype`, normalized with [`normalize_language`].
    pub fn language(&self) -> Option<String> {
        [
            self.codemirror_name(),
            Some(self.name.as_str()),
            self.mimetype.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|candidate| !candidate.is_empty())
        .map(normalize_language)
    }
}

/// `text/x-python` and `x-python` become `python`; `ipython` becomes `python`.
pub fn normalize_language(language: &str) -> String {
    let language = language.rsplit('/').next().unwrap_or(language);
    let language = language.strip_prefix("x-").unwrap_or(language);
    if language.eq_ignore_ascii_case("ipython") {
        "python".to_string()
    } else {
        language.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellContents {
    pub cell_type: CellType,
    #[serde(
        default,
        serialize_with = "serialize_source",
        deserialize_with = "deserialize_source"
    )]
    pub source: String,
    #[serde(default)]
    pub metadata: CellMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Output>>,
    /// Outer `None`: field absent (markdown). `Some(None)`: `null`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub execution_count: Option<Option<i64>>,
}

impl CellContents {
    pub fn new(cell_type: CellType, source: impl Into<String>) -> Self {
        CellContents {
            cell_type,
            source: source.into(),
            metadata: CellMetadata::default(),
            outputs: None,
            execution_count: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(
        rename = "azdata_cell_guid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cell_guid: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// Split source into lines that keep their trailing newline.
pub fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

fn serialize_source<S>(source: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    source_to_lines(source).serialize(serializer)
}

fn deserialize_source<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Source {
        Text(String),
        Lines(Vec<String>),
    }

    Ok(match Option::<Source>::deserialize(deserializer)? {
        Some(Source::Text(text)) => text,
        Some(Source::Lines(lines)) => lines.concat(),
        None => String::new(),
    })
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

pub fn parse_notebook(json: &str) -> Result<NotebookContents> {
    serde_json::from_str(json).context("Failed to parse notebook JSON")
}

pub fn serialize_notebook(contents: &NotebookContents) -> Result<String> {
    let mut json = serde_json::to_string_pretty(contents)?;
    json.push('\n');
    Ok(json)
}

/// Reads and writes notebooks on the local filesystem. Accepts plain paths
/// and `file://` URIs.
#[derive(Debug, Clone, Default)]
pub struct FileContentManager;

impl FileContentManager {
    pub fn path_for(uri: &str) -> PathBuf {
        url::Url::parse(uri)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(uri))
    }

    pub async fn load(path: &Path) -> Result<NotebookContents> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_notebook(&content)
    }

    pub async fn store(path: &Path, contents: &NotebookContents) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialize_notebook(contents)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[async_trait]
impl ContentManager for FileContentManager {
    async fn get_notebook_contents(&self, uri: &str) -> Result<NotebookContents> {
        Self::load(&Self::path_for(uri)).await
    }

    async fn save(&self, uri: &str, contents: &NotebookContents) -> Result<()> {
        Self::store(&Self::path_for(uri), contents).await
    }
}
