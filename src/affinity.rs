//! Node affinity evaluation for PersistentVolumes
//!
//! A local volume is pinned to its node through
//! `spec.nodeAffinity.required`. The volume is orphaned when no node in a
//! given node list satisfies that selector. Matching follows the Kubernetes
//! rules: terms are ORed, requirements within a term are ANDed, and
//! `matchFields` supports only `metadata.name`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSelector, NodeSelectorRequirement, PersistentVolume};
use kube::ResourceExt;

use crate::Error;

const FIELD_METADATA_NAME: &str = "metadata.name";

/// Returns true if `pv` is pinned to nodes and none of `nodes` satisfies it
///
/// Volumes without a required node affinity, or with an empty term list, are
/// not pinned anywhere and are never orphaned. A selector that cannot be
/// evaluated is an error even when `nodes` is empty.
pub fn is_orphaned<'a, I>(pv: &PersistentVolume, nodes: I) -> Result<bool, Error>
where
    I: IntoIterator<Item = &'a Node>,
{
    let Some(selector) = required_selector(pv) else {
        return Ok(false);
    };

    let volume = pv.name_any();
    validate_selector(&volume, selector)?;
    for node in nodes {
        if selector_matches(&volume, selector, node)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn required_selector(pv: &PersistentVolume) -> Option<&NodeSelector> {
    pv.spec
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required
        .as_ref()
        .filter(|s| !s.node_selector_terms.is_empty())
}

/// Reject requirements this evaluator cannot decide, independent of any node
fn validate_selector(volume: &str, selector: &NodeSelector) -> Result<(), Error> {
    let no_labels = BTreeMap::new();
    for term in &selector.node_selector_terms {
        for req in term.match_expressions.as_deref().unwrap_or_default() {
            label_requirement_matches(volume, req, &no_labels)?;
        }
        for req in term.match_fields.as_deref().unwrap_or_default() {
            field_requirement_matches(volume, req, "")?;
        }
    }
    Ok(())
}

fn selector_matches(volume: &str, selector: &NodeSelector, node: &Node) -> Result<bool, Error> {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let node_name = node.name_any();

    for term in &selector.node_selector_terms {
        let expressions = term.match_expressions.as_deref().unwrap_or_default();
        let fields = term.match_fields.as_deref().unwrap_or_default();

        // A term with no requirements selects nothing.
        if expressions.is_empty() && fields.is_empty() {
            continue;
        }

        let mut term_matches = true;
        for req in expressions {
            if !label_requirement_matches(volume, req, labels)? {
                term_matches = false;
                break;
            }
        }
        if term_matches {
            for req in fields {
                if !field_requirement_matches(volume, req, &node_name)? {
                    term_matches = false;
                    break;
                }
            }
        }
        if term_matches {
            return Ok(true);
        }
    }
    Ok(false)
}

fn label_requirement_matches(
    volume: &str,
    req: &NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    let values = req.values.as_deref().unwrap_or_default();
    let actual = labels.get(&req.key);

    match req.operator.as_str() {
        "In" => Ok(actual.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(actual.map_or(true, |v| !values.contains(v))),
        "Exists" => Ok(actual.is_some()),
        "DoesNotExist" => Ok(actual.is_none()),
        "Gt" | "Lt" => {
            let [bound] = values else {
                return Err(Error::affinity(
                    volume,
                    format!(
                        "operator {} on key {} needs exactly one value",
                        req.operator, req.key
                    ),
                ));
            };
            let bound: i64 = bound.parse().map_err(|_| {
                Error::affinity(
                    volume,
                    format!("value '{bound}' for key {} is not an integer", req.key),
                )
            })?;
            // A label that is missing or not an integer never satisfies Gt/Lt.
            let Some(actual) = actual.and_then(|v| v.parse::<i64>().ok()) else {
                return Ok(false);
            };
            Ok(if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            })
        }
        other => Err(Error::affinity(
            volume,
            format!("unsupported operator {other} on key {}", req.key),
        )),
    }
}

fn field_requirement_matches(
    volume: &str,
    req: &NodeSelectorRequirement,
    node_name: &str,
) -> Result<bool, Error> {
    if req.key != FIELD_METADATA_NAME {
        return Err(Error::affinity(
            volume,
            format!("unsupported field selector key {}", req.key),
        ));
    }
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => Ok(values.iter().any(|v| v == node_name)),
        "NotIn" => Ok(!values.iter().any(|v| v == node_name)),
        other => Err(Error::affinity(
            volume,
            format!("unsupported field selector operator {other}"),
        )),
    }
}
