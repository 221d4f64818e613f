//! OCI image config and manifest construction from accumulated layers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dockerfile::{Command, HealthcheckSpec};
use crate::llb::ImageConfig;

use super::assembler::LayerDescriptor;

const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HealthcheckConfig {
    #[serde(rename = "Test")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(rename = "Timeout", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(rename = "StartPeriod", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    #[serde(rename = "Retries", skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ImageConfigBody {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "String::is_empty", default)]
    pub working_dir: String,
    #[serde(rename = "User", skip_serializing_if = "String::is_empty", default)]
    pub user: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Volumes", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub volumes: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "StopSignal", skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(rename = "Healthcheck", skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageConfigFile {
    pub architecture: String,
    pub os: String,
    pub config: ImageConfigBody,
    pub rootfs: RootFs,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: ContentDescriptor,
    pub layers: Vec<ContentDescriptor>,
}

fn command_to_argv(command: &Command) -> Vec<String> {
    match command {
        Command::Exec(argv) => argv.clone(),
        Command::Shell(s) => vec!["/bin/sh".to_owned(), "-c".to_owned(), s.clone()],
    }
}

/// `Test` follows the image-spec convention: `["CMD", ...argv]` for exec
/// form, `["CMD-SHELL", command]` for shell form.
fn healthcheck_to_config(spec: &HealthcheckSpec) -> HealthcheckConfig {
    let test = match &spec.command {
        Command::Exec(argv) => std::iter::once("CMD".to_owned()).chain(argv.iter().cloned()).collect(),
        Command::Shell(s) => vec!["CMD-SHELL".to_owned(), s.clone()],
    };
    HealthcheckConfig {
        test,
        interval: spec.interval.clone(),
        timeout: spec.timeout.clone(),
        start_period: spec.start_period.clone(),
        retries: spec.retries,
    }
}

pub fn build_config(
    image_config: &ImageConfig,
    layers: &[LayerDescriptor],
    platform: (&str, &str),
    created: DateTime<Utc>,
) -> ImageConfigFile {
    let (os, architecture) = platform;
    let body = ImageConfigBody {
        env: image_config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        entrypoint: image_config.entrypoint.as_ref().map(command_to_argv),
        cmd: image_config.cmd.as_ref().map(command_to_argv),
        working_dir: image_config.workdir.clone().unwrap_or_default(),
        user: image_config.user.clone().unwrap_or_default(),
        labels: image_config.labels.clone(),
        exposed_ports: image_config.exposed_ports.iter().map(|p| (p.clone(), serde_json::json!({}))).collect(),
        volumes: image_config.volumes.iter().map(|v| (v.clone(), serde_json::json!({}))).collect(),
        stop_signal: image_config.stop_signal.clone(),
        healthcheck: image_config.healthcheck.as_ref().map(healthcheck_to_config),
    };

    let history = layers
        .iter()
        .map(|_| HistoryEntry { created, created_by: "kiln".to_owned(), empty_layer: None })
        .collect();

    ImageConfigFile {
        architecture: architecture.to_owned(),
        os: os.to_owned(),
        config: body,
        rootfs: RootFs { kind: "layers".to_owned(), diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect() },
        history,
    }
}

pub fn build_manifest(config_digest: &str, config_size: u64, layers: &[LayerDescriptor]) -> ImageManifest {
    ImageManifest {
        schema_version: 2,
        media_type: MANIFEST_MEDIA_TYPE.to_owned(),
        config: ContentDescriptor { media_type: CONFIG_MEDIA_TYPE.to_owned(), digest: config_digest.to_owned(), size: config_size },
        layers: layers
            .iter()
            .map(|l| ContentDescriptor { media_type: l.media_type.clone(), digest: l.digest.clone(), size: l.size })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompressionKind;

    fn layer(digest: &str) -> LayerDescriptor {
        LayerDescriptor {
            diff_id: format!("sha256:{digest}"),
            digest: format!("sha256:{digest}"),
            size: 42,
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_owned(),
            compression: CompressionKind::Gzip,
        }
    }

    #[test]
    fn config_rootfs_diff_ids_follow_layer_order() {
        let image = ImageConfig::default();
        let layers = vec![layer("a"), layer("b")];
        let created = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let config = build_config(&image, &layers, ("linux", "amd64"), created);
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:a".to_owned(), "sha256:b".to_owned()]);
        assert_eq!(config.history.len(), 2);
    }

    #[test]
    fn manifest_lists_layers_and_config_descriptor() {
        let layers = vec![layer("a")];
        let manifest = build_manifest("sha256:cfg", 10, &layers);
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.config.digest, "sha256:cfg");
        assert_eq!(manifest.layers.len(), 1);
    }

    #[test]
    fn healthcheck_is_carried_into_the_emitted_config() {
        let image = ImageConfig {
            healthcheck: Some(HealthcheckSpec {
                command: Command::Shell("curl -f http://localhost/ || exit 1".to_owned()),
                interval: Some("30s".to_owned()),
                timeout: Some("5s".to_owned()),
                start_period: None,
                retries: Some(3),
            }),
            ..ImageConfig::default()
        };
        let created = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let config = build_config(&image, &[], ("linux", "amd64"), created);

        let hc = config.config.healthcheck.expect("healthcheck must survive into the config body");
        assert_eq!(hc.test, vec!["CMD-SHELL".to_owned(), "curl -f http://localhost/ || exit 1".to_owned()]);
        assert_eq!(hc.retries, Some(3));
        assert_eq!(hc.interval.as_deref(), Some("30s"));
    }

    #[test]
    fn no_healthcheck_omits_the_field_from_serialized_config() {
        let image = ImageConfig::default();
        let created = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let config = build_config(&image, &[], ("linux", "amd64"), created);
        let json = serde_json::to_value(&config.config).unwrap();
        assert!(json.get("Healthcheck").is_none());
    }
}
