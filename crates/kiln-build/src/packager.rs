//! Image manifest packaging.
//!
//! The manifest carries no timestamps and serializes maps in key order, so
//! identical inputs always give byte-identical JSON and the same digest.

use std::collections::BTreeMap;

use kiln_common::{Digest, KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::cache::Layer;
use crate::executor::StageConfig;
use crate::instruction::{Command, Healthcheck};

/// Manifest media type.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.kiln.image.manifest.v1+json";

/// Layer media type (uncompressed tar).
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// CPU architecture (OCI naming).
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Runtime configuration.
    pub config: ImageConfig,
    /// Layers, bottom first.
    pub layers: Vec<LayerDescriptor>,
}

/// Layer descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Content size.
    pub size: u64,
    /// Instruction that produced the layer.
    #[serde(rename = "createdBy")]
    pub created_by: String,
}

/// Container configuration, using OCI field names.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Health check in OCI/Docker form. Durations are nanoseconds.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(rename = "Test")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(rename = "StartPeriod", default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<u64>,
    #[serde(rename = "Retries", default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl From<&Healthcheck> for HealthcheckConfig {
    fn from(check: &Healthcheck) -> Self {
        let nanos = |d: std::time::Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        match check {
            Healthcheck::Disabled => Self {
                test: vec!["NONE".to_string()],
                interval: None,
                timeout: None,
                start_period: None,
                retries: None,
            },
            Healthcheck::Check(spec) => {
                let test = match &spec.command {
                    Command::Shell(line) => vec!["CMD-SHELL".to_string(), line.clone()],
                    Command::Exec(args) => std::iter::once("CMD".to_string())
                        .chain(args.iter().cloned())
                        .collect(),
                };
                Self {
                    test,
                    interval: Some(nanos(spec.interval)),
                    timeout: Some(nanos(spec.timeout)),
                    start_period: Some(nanos(spec.start_period)),
                    retries: Some(spec.retries),
                }
            }
        }
    }
}

impl ImageManifest {
    /// Compact JSON with a fixed field order.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_canonical_json(&self) -> KilnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 of the canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn digest(&self) -> KilnResult<Digest> {
        Ok(Digest::of(self.to_canonical_json()?))
    }

    /// Total size of all layers.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Builds image manifests.
#[derive(Debug, Clone)]
pub struct ImagePackager {
    architecture: String,
    os: String,
}

impl Default for ImagePackager {
    fn default() -> Self {
        Self {
            architecture: oci_architecture(std::env::consts::ARCH).to_string(),
            os: "linux".to_string(),
        }
    }
}

impl ImagePackager {
    /// Packager for the host architecture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Packager for an explicit platform.
    #[must_use]
    pub fn for_platform(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
        }
    }

    /// Assemble the manifest for a target stage's config and its layers.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::IncompleteImage`] if no entrypoint is set.
    pub fn package(&self, config: &StageConfig, layers: &[Layer]) -> KilnResult<ImageManifest> {
        let entrypoint = config
            .entrypoint
            .clone()
            .ok_or_else(|| KilnError::IncompleteImage {
                missing: "entrypoint".to_string(),
            })?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: ImageConfig {
                entrypoint,
                cmd: config.cmd.clone(),
                env: config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
                exposed_ports: config
                    .exposed_ports
                    .iter()
                    .map(|p| (p.to_string(), EmptyObject {}))
                    .collect(),
                healthcheck: config.healthcheck.as_ref().map(HealthcheckConfig::from),
                working_dir: config.workdir.clone(),
                user: config.user.clone(),
                labels: config.labels.clone(),
            },
            layers: layers
                .iter()
                .map(|layer| LayerDescriptor {
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    digest: layer.digest.clone(),
                    size: layer.size,
                    created_by: layer.created_by.clone(),
                })
                .collect(),
        };

        tracing::debug!(layers = manifest.layers.len(), "Packaged image manifest");
        Ok(manifest)
    }
}

fn oci_architecture(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
