//! Helpers for reading values out of KDL nodes.
//!
//! Settings are written as child nodes with a single argument, e.g.
//! `issuance { max-attempts 4 }`.

use ::kdl::{KdlNode, KdlValue};

/// First argument of a child node with the given name.
fn child_value<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
        .and_then(|child| child.entries().iter().find(|e| e.name().is_none()))
        .map(|entry| entry.value())
}

/// First positional argument of the node itself as a string.
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child_value(node, name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child_value(node, name).and_then(|v| v.as_integer())
}

/// Float entry. Integer literals are accepted too.
pub fn get_float_entry(node: &KdlNode, name: &str) -> Option<f64> {
    child_value(node, name).and_then(|v| {
        v.as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
    })
}

/// Boolean entry. Accepts `#true` as well as the quoted `"true"`.
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    child_value(node, name).and_then(|v| {
        v.as_bool().or_else(|| match v.as_string() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        })
    })
}

/// All string arguments of every child node with the given name.
///
/// `denied-suffixes ".corp" ".lan"` and repeated `trust-anchor "..."`
/// lines both collect into one list.
pub fn get_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|child| child.name().value() == name)
        .flat_map(|child| child.entries().iter())
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string().map(|s| s.to_string()))
        .collect()
}

