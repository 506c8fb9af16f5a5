//! Node Selector Matching
//!
//! Evaluates a core/v1 `NodeSelector` against a node's name and labels.
//! Terms are ORed, requirements inside a term are ANDed, and a term with
//! no requirements matches nothing.

use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use std::collections::BTreeMap;

/// Whether a node matches the selector; an absent selector matches every node
pub fn node_selector_matches(
    selector: Option<&NodeSelector>,
    node_name: &str,
    labels: &BTreeMap<String, String>,
) -> bool {
    match selector {
        None => true,
        Some(selector) => selector
            .node_selector_terms
            .iter()
            .any(|term| term_matches(term, node_name, labels)),
    }
}

fn term_matches(term: &NodeSelectorTerm, node_name: &str, labels: &BTreeMap<String, String>) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    let labels_ok = expressions
        .iter()
        .all(|req| requirement_matches(req, labels.get(&req.key).map(String::as_str)));

    let fields_ok = fields.iter().all(|req| {
        let value = match req.key.as_str() {
            "metadata.name" => Some(node_name),
            _ => None,
        };
        requirement_matches(req, value)
    });

    labels_ok && fields_ok
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.map_or(false, |v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        _ => false,
    }
}

/// Selector matching a single node by hostname label
pub fn hostname_selector(hostname: &str) -> NodeSelector {
    NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: super::labels::HOSTNAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![hostname.to_string()]),
            }]),
            match_fields: None,
        }],
    }
}
