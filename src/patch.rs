use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use serde_json::{Map, Value};

const ANNOTATIONS: &str = "annotations";
const LABELS: &str = "labels";

fn container_path(container: &str) -> PointerBuf {
    PointerBuf::from_tokens(["metadata", container])
}

fn key_path(container: &str, key: &str) -> PointerBuf {
    PointerBuf::from_tokens(["metadata", container, key])
}

fn is_unset(current: Option<&BTreeMap<String, String>>, key: &str) -> bool {
    current
        .and_then(|m| m.get(key))
        .is_none_or(|v| v.is_empty())
}

fn single_entry(key: &str, value: &str) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::String(value.to_string()));
    Value::Object(map)
}

/// Edits that set every desired annotation.
///
/// A missing or empty container is created by the first `add`; later keys are
/// added or replaced individually so existing annotations survive.
fn annotation_edits(
    current: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let mut container_exists = current.is_some_and(|m| !m.is_empty());
    let mut edits = Vec::new();

    for (key, value) in desired {
        if is_unset(current, key) {
            if container_exists {
                edits.push(PatchOperation::Add(AddOperation {
                    path: key_path(ANNOTATIONS, key),
                    value: Value::String(value.clone()),
                }));
            } else {
                edits.push(PatchOperation::Add(AddOperation {
                    path: container_path(ANNOTATIONS),
                    value: single_entry(key, value),
                }));
                container_exists = true;
            }
        } else if current.and_then(|m| m.get(key)) != Some(value) {
            edits.push(PatchOperation::Replace(ReplaceOperation {
                path: key_path(ANNOTATIONS, key),
                value: Value::String(value.clone()),
            }));
        }
    }

    edits
}

/// Edits that fill in missing labels. Labels that are already set are never
/// replaced.
fn label_edits(
    current: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let missing: Vec<(&String, &String)> = desired
        .iter()
        .filter(|(key, _)| is_unset(current, key))
        .collect();

    if missing.is_empty() {
        return Vec::new();
    }

    if current.is_some_and(|m| !m.is_empty()) {
        missing
            .into_iter()
            .map(|(key, value)| {
                PatchOperation::Add(AddOperation {
                    path: key_path(LABELS, key),
                    value: Value::String(value.clone()),
                })
            })
            .collect()
    } else {
        let values: Map<String, Value> = missing
            .into_iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        vec![PatchOperation::Add(AddOperation {
            path: container_path(LABELS),
            value: Value::Object(values),
        })]
    }
}

/// Builds the JSON patch that brings an object's annotations and labels up to
/// the desired state. Annotation edits come first. The result depends only on
/// the inputs and is empty once the desired state is reached.
pub fn build_patch(
    current_annotations: Option<&BTreeMap<String, String>>,
    desired_annotations: &BTreeMap<String, String>,
    current_labels: Option<&BTreeMap<String, String>>,
    desired_labels: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    let mut edits = annotation_edits(current_annotations, desired_annotations);
    edits.extend(label_edits(current_labels, desired_labels));
    edits
}
