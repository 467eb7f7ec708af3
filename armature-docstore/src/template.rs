//! Template and index bootstrap.
//!
//! Reads component templates from `<template_path>/ecs`, index templates
//! from `<template_path>/index`, and a manifest of data streams and indices,
//! then creates whatever the cluster is missing. Existing resources are
//! left untouched, so running the bootstrap twice is harmless.

use crate::config::MappingConfig;
use crate::error::{RepositoryError, Result};
use crate::executor::{BackendRequest, Executor};
use crate::repository::classify;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory holding component templates.
pub const TEMPLATE_DIR_ECS: &str = "ecs";

/// Directory holding index templates.
pub const TEMPLATE_DIR_INDEX: &str = "index";

/// A template file read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    content: Value,
    ecs_version: String,
    path: PathBuf,
    version: u64,
}

impl Template {
    /// Read and parse a template file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let content: Value =
            serde_json::from_slice(&raw).map_err(|e| RepositoryError::decode("template file", e))?;

        let ecs_version = content["_meta"]["ecs_version"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let version = content["version"].as_u64().unwrap_or_default();

        Ok(Self {
            content,
            ecs_version,
            path: path.to_path_buf(),
            version,
        })
    }

    /// Template name: the file stem, prefixed with `ecs_<version>_` when the
    /// template declares an ECS version.
    pub fn name(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.ecs_version.is_empty() {
            stem
        } else {
            format!("{}_{}_{}", TEMPLATE_DIR_ECS, self.ecs_version, stem)
        }
    }

    /// ECS version from `_meta.ecs_version`, empty if absent.
    pub fn ecs_version(&self) -> &str {
        &self.ecs_version
    }

    /// Template version, `0` if absent.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed template body.
    pub fn content(&self) -> &Value {
        &self.content
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = Map::new();
        if !self.ecs_version.is_empty() {
            rendered.insert("ecs_version".into(), json!(self.ecs_version));
        }
        rendered.insert("name".into(), json!(self.name()));
        rendered.insert("path".into(), json!(self.path.display().to_string()));
        if self.version > 0 {
            rendered.insert("version".into(), json!(self.version));
        }
        let out = serde_json::to_string_pretty(&rendered).map_err(|_| fmt::Error)?;
        f.write_str(&out)
    }
}

/// Read every `*.json` template in `dir`, ordered by file name.
pub fn read_templates(dir: impl AsRef<Path>) -> Result<Vec<Template>> {
    let mut paths = std::fs::read_dir(dir.as_ref())?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"));
    paths.sort();

    paths.iter().map(Template::read).collect()
}

/// Data streams and indices that must exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicesManifest {
    /// Data stream names.
    #[serde(default)]
    pub data_streams: Vec<String>,
    /// Index names.
    #[serde(default)]
    pub indices: Vec<String>,
}

impl IndicesManifest {
    /// Read a manifest file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&raw).map_err(|e| RepositoryError::decode("indices manifest", e))
    }
}

/// Idempotent provisioning of templates, data streams and indices.
pub struct Bootstrap<'a> {
    executor: &'a dyn Executor,
}

impl<'a> Bootstrap<'a> {
    /// Create a bootstrap over an executor.
    pub fn new(executor: &'a dyn Executor) -> Self {
        Self { executor }
    }

    /// Apply everything described by `mapping`. Does nothing unless
    /// `mapping.create` is set.
    pub async fn run(&self, mapping: &MappingConfig) -> Result<()> {
        if !mapping.create {
            debug!("Mapping creation disabled, skipping bootstrap");
            return Ok(());
        }

        let components = read_templates(mapping.template_path.join(TEMPLATE_DIR_ECS))?;
        self.apply_component_templates(&components).await?;

        let index_templates = read_templates(mapping.template_path.join(TEMPLATE_DIR_INDEX))?;
        self.apply_index_templates(&index_templates).await?;

        let manifest = IndicesManifest::read(&mapping.indices_path)?;
        self.apply_manifest(&manifest).await?;

        info!(
            component_templates = components.len(),
            index_templates = index_templates.len(),
            data_streams = manifest.data_streams.len(),
            indices = manifest.indices.len(),
            "Bootstrap complete"
        );
        Ok(())
    }

    /// Create missing component templates.
    pub async fn apply_component_templates(&self, templates: &[Template]) -> Result<()> {
        for template in templates {
            let name = template.name();
            self.ensure(
                BackendRequest::ComponentTemplateExists { name: name.clone() },
                BackendRequest::PutComponentTemplate {
                    name: name.clone(),
                    body: template.content().clone(),
                },
                "component template",
                &name,
            )
            .await?;
        }
        Ok(())
    }

    /// Create missing index templates.
    pub async fn apply_index_templates(&self, templates: &[Template]) -> Result<()> {
        for template in templates {
            let name = template.name();
            self.ensure(
                BackendRequest::IndexTemplateExists { name: name.clone() },
                BackendRequest::PutIndexTemplate {
                    name: name.clone(),
                    body: template.content().clone(),
                },
                "index template",
                &name,
            )
            .await?;
        }
        Ok(())
    }

    /// Create missing data streams, then missing indices.
    pub async fn apply_manifest(&self, manifest: &IndicesManifest) -> Result<()> {
        for name in &manifest.data_streams {
            self.ensure(
                BackendRequest::DataStreamExists { name: name.clone() },
                BackendRequest::CreateDataStream { name: name.clone() },
                "data stream",
                name,
            )
            .await?;
        }

        for name in &manifest.indices {
            self.ensure(
                BackendRequest::IndexExists { name: name.clone() },
                BackendRequest::CreateIndex { name: name.clone() },
                "index",
                name,
            )
            .await?;
        }
        Ok(())
    }

    async fn ensure(
        &self,
        exists: BackendRequest,
        create: BackendRequest,
        resource: &'static str,
        name: &str,
    ) -> Result<()> {
        let response = self.executor.execute(exists).await?;
        if response.status == 200 {
            debug!(resource, name, "Resource exists, skipping creation");
            return Ok(());
        }

        debug!(resource, name, "Creating resource");
        let kind = create.kind();
        let response = self.executor.execute(create).await?;
        if !response.is_success() {
            return Err(classify(kind, &response));
        }
        Ok(())
    }
}
