use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to decode {kind} object: {source}")]
pub struct DecodeError {
    pub kind: ResourceKind,
    #[source]
    pub source: serde_json::Error,
}

/// Resource kinds the label policy knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Deployment,
}

impl ResourceKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(ResourceKind::Pod),
            "Deployment" => Some(ResourceKind::Deployment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Deployment => "Deployment",
        }
    }

    fn decode_metadata(self, raw: &Value) -> Result<ObjectMeta, DecodeError> {
        let decoded = match self {
            ResourceKind::Pod => Pod::deserialize(raw).map(|pod| pod.metadata),
            ResourceKind::Deployment => Deployment::deserialize(raw).map(|d| d.metadata),
        };
        decoded.map_err(|source| DecodeError { kind: self, source })
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized metadata of an admitted object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMetadataView {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMetadataView {
    fn from_meta(meta: ObjectMeta, request_namespace: Option<&str>) -> Self {
        let namespace = meta
            .namespace
            .filter(|ns| !ns.is_empty())
            .or_else(|| request_namespace.map(str::to_string))
            .unwrap_or_default();
        let name = meta
            .name
            .filter(|n| !n.is_empty())
            .or(meta.generate_name)
            .unwrap_or_default();

        Self {
            namespace,
            name,
            labels: meta.labels.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
        }
    }
}

/// Detaches the embedded objects from an admission review body.
///
/// The envelope is then deserialized without touching the object schema, and
/// the returned `request.object` goes to [`classify`] as raw JSON. `oldObject`
/// is dropped since no decision reads it.
pub fn take_raw_object(review: &mut Value) -> Option<Value> {
    let request = review.get_mut("request")?.as_object_mut()?;
    request.remove("oldObject");
    request.remove("object").filter(|object| !object.is_null())
}

/// Decodes `raw` as the schema named by `kind` and projects its metadata.
///
/// Returns `Ok(None)` for kinds outside [`ResourceKind`]; those carry no
/// policy opinion. `request_namespace` fills in the namespace when the object
/// itself omits it, which is common on CREATE.
pub fn classify(
    kind: &str,
    raw: &Value,
    request_namespace: Option<&str>,
) -> Result<Option<(ResourceKind, ObjectMetadataView)>, DecodeError> {
    let Some(resource_kind) = ResourceKind::from_kind(kind) else {
        return Ok(None);
    };

    let meta = resource_kind.decode_metadata(raw)?;
    Ok(Some((
        resource_kind,
        ObjectMetadataView::from_meta(meta, request_namespace),
    )))
}
