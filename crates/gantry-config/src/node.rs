//! Helper functions for extracting values from KDL nodes.

use gantry_core::environment::EnvironmentVariable;
use kdl::KdlNode;
use std::collections::BTreeMap;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

pub(crate) fn require_string_prop(node: &KdlNode, name: &str) -> ConfigResult<String> {
    get_string_prop(node, name).ok_or_else(|| {
        ConfigError::MissingField(format!("{} on '{}'", name, node.name().value()))
    })
}

/// Child nodes of the form `key "value"` collected into a map.
pub(crate) fn get_children_map(node: &KdlNode) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if let Some(val) = get_first_string_arg(child) {
                map.insert(child.name().value().to_string(), val);
            }
        }
    }
    map
}

pub(crate) fn positive(field: &str, value: i128) -> ConfigResult<u64> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a positive integer, got {}", value),
        })
}

/// Variables of an `env { NAME "value" secure=#true }` block, in declared order.
pub(crate) fn get_env_vars(node: &KdlNode) -> Vec<EnvironmentVariable> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .map(|child| {
            let name = child.name().value().to_string();
            let value = get_first_string_arg(child).unwrap_or_default();
            if get_bool_prop(child, "secure").unwrap_or(false) {
                EnvironmentVariable::secure(name, value)
            } else {
                EnvironmentVariable::plain(name, value)
            }
        })
        .collect()
}
