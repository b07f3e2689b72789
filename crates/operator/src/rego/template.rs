//! Renders labels and selectors as policy source

use std::collections::BTreeMap;

use super::ast::is_identifier;
use super::{LabelSet, MATCH_HELPER_PATH, SELECTOR_RULE, SYSTEM_TYPE_LABEL};

/// Package path such as `metadata.<id>.labels`, with the id bracketed when it
/// is not a plain identifier.
#[must_use]
pub fn package_path(prefix: &str, id: &str, suffix: &str) -> String {
    if is_identifier(id) {
        format!("{prefix}.{id}.{suffix}")
    } else {
        format!("{prefix}[{}].{suffix}", quote(id))
    }
}

/// Query for the value of the labels rule of system `id`.
#[must_use]
pub fn labels_query(id: &str) -> String {
    format!("data.{}.labels", package_path("metadata", id, "labels"))
}

/// Policy string literal for `value`.
fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Merges the reserved `system-type` label into `labels`. The reserved key
/// always reflects `system_type`.
#[must_use]
pub fn desired_labels(system_type: &str, labels: &BTreeMap<String, String>) -> LabelSet {
    let mut desired = labels.clone();
    desired.insert(SYSTEM_TYPE_LABEL.to_string(), system_type.to_string());
    desired
}

/// Renders the `labels.rego` module of system `id`.
#[must_use]
pub fn render_labels(id: &str, labels: &LabelSet) -> String {
    let entries: String = labels
        .iter()
        .map(|(key, value)| format!("    {}: {},\n", quote(key), quote(value)))
        .collect();

    format!(
        "package {}\n\nimport rego.v1\n\nlabels := {{\n{entries}}}\n",
        package_path("metadata", id, "labels")
    )
}

/// Renders the `selector.rego` module of stack `id`.
///
/// Values are written in the given order, duplicates included; an empty list
/// becomes `set()` since `{}` is an empty object.
#[must_use]
pub fn render_selectors(
    id: &str,
    include: &BTreeMap<String, Vec<String>>,
    exclude: &BTreeMap<String, Vec<String>>,
) -> String {
    format!(
        "package {package}

import {MATCH_HELPER_PATH} as match
import rego.v1

{SELECTOR_RULE} contains system_id if {{
{include}
{exclude}
    metadata := data.metadata[system_id]
    match.all(metadata.labels.labels, include, exclude)
}}
",
        package = package_path("stacks", id, "selectors"),
        include = selector_binding("include", include),
        exclude = selector_binding("exclude", exclude),
    )
}

fn selector_binding(name: &str, selector: &BTreeMap<String, Vec<String>>) -> String {
    let entries: String = selector
        .iter()
        .map(|(key, values)| {
            if values.is_empty() {
                return format!("        {}: set(),\n", quote(key));
            }
            let members: String = values
                .iter()
                .map(|value| format!("            {},\n", quote(value)))
                .collect();
            format!("        {}: {{\n{members}        }},\n", quote(key))
        })
        .collect();

    format!("    {name} := {{\n{entries}    }}\n")
}
