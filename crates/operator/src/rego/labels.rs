//! Recovers the label set of a system by evaluating its `labels` rule.

use regorus::Value;
use tracing::debug;

use super::compiler::CompiledModule;
use super::template::labels_query;
use super::{LabelSet, PolicyError};

/// Evaluates the labels rule of system `id`. Non-string values are dropped and
/// a module that does not define the rule yields an empty set.
///
/// # Errors
///
/// Returns [`PolicyError::Evaluation`] when the engine fails to evaluate.
pub fn extract_labels(compiled: &mut CompiledModule, id: &str) -> Result<LabelSet, PolicyError> {
    let package = ["metadata", id, "labels"].map(String::from);
    if !compiled.defines(&package, "labels") {
        debug!(system_id = id, "labels rule not found");
        return Ok(LabelSet::new());
    }

    let results = compiled.eval_query(&labels_query(id))?;

    let mut labels = LabelSet::new();
    for result in &results.result {
        let Some(expression) = result.expressions.first() else {
            continue;
        };
        let Value::Object(fields) = &expression.value else {
            continue;
        };
        for (key, value) in fields.iter() {
            if let (Value::String(key), Value::String(value)) = (key, value) {
                labels.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(labels)
}
