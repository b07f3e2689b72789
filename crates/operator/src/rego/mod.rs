// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Labels and selectors stored as generated policy source.
//!
//! The remote side has no structured field for either, so they are written as
//! small policy modules and read back by compiling the stored text.

pub mod ast;
pub mod compiler;
pub mod equivalence;
pub mod labels;
pub mod selectors;
pub mod template;

use std::collections::BTreeMap;

use tracing::instrument;

pub use compiler::{CompiledModule, RewrittenVars, compile_modules};
pub use equivalence::{labels_equal, selectors_equal};
pub use template::{desired_labels, render_labels, render_selectors};

/// File name of the generated labels module
pub const LABELS_MODULE: &str = "labels.rego";
/// File name of the generated selectors module
pub const SELECTORS_MODULE: &str = "selector.rego";
/// Rule holding the selectors
pub const SELECTOR_RULE: &str = "systems";
/// Label recording the type of a system
pub const SYSTEM_TYPE_LABEL: &str = "system-type";
/// Package providing the selector matching helper on the remote side
pub const MATCH_HELPER_PATH: &str = "data.library.v1.utils.labels.match.v1";

/// Label key → label value
pub type LabelSet = BTreeMap<String, String>;

/// Selector key → accepted values, compared as a set
pub type Selector = BTreeMap<String, Vec<String>>;

/// Include and exclude groups of a stack
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selectors {
    /// Labels a system must match
    pub include: Selector,
    /// Labels that exclude a system
    pub exclude: Selector,
}

/// Errors raised while reading policy source
#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    /// Source is not valid policy text
    #[error("cannot compile {module}: {message}")]
    Syntax {
        /// Fragment name
        module: String,
        /// Parser message, position included
        message: String,
    },

    /// The policy engine refused the source
    #[error("cannot compile {module}: {message}")]
    Rejected {
        /// Fragment name
        module: String,
        /// Engine message
        message: String,
    },

    /// A call through `data` does not resolve
    #[error("cannot compile {module}: undefined function {function}")]
    UndefinedFunction {
        /// Fragment name
        module: String,
        /// Called reference
        function: String,
    },

    /// Query evaluation failed
    #[error("cannot evaluate {query}: {message}")]
    Evaluation {
        /// Evaluated query
        query: String,
        /// Engine message
        message: String,
    },
}

impl PolicyError {
    /// Whether the error was raised while compiling, as opposed to evaluating.
    #[must_use]
    pub fn is_compile_error(&self) -> bool {
        !matches!(self, PolicyError::Evaluation { .. })
    }
}

/// Decodes the labels of system `id` from its stored `labels.rego`.
///
/// # Errors
///
/// Fails when the source does not compile or cannot be evaluated.
#[instrument(skip(source))]
pub fn decode_labels(id: &str, source: &str) -> Result<LabelSet, PolicyError> {
    let mut compiled = compile_modules([(LABELS_MODULE, source)])?;
    labels::extract_labels(&mut compiled, id)
}

/// Decodes the selectors from a stored `selector.rego`.
///
/// # Errors
///
/// Fails when the source does not compile.
#[instrument(skip(source))]
pub fn decode_selectors(source: &str) -> Result<Selectors, PolicyError> {
    let compiled = compile_modules([
        (SELECTORS_MODULE, source),
        (
            compiler::MATCH_HELPER_STUB_MODULE,
            compiler::MATCH_HELPER_STUB_V1,
        ),
    ])?;
    Ok(selectors::extract_selectors(&compiled))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn labels_round_trip_with_system_type() {
        let desired = desired_labels("custom", &LabelSet::from([("env".into(), "prod".into())]));
        let decoded = decode_labels("sys1", &render_labels("sys1", &desired)).unwrap();

        assert_eq!(
            decoded,
            LabelSet::from([
                ("env".into(), "prod".into()),
                ("system-type".into(), "custom".into()),
            ])
        );
        assert!(labels_equal(&desired, &decoded));
    }

    #[test]
    fn labels_round_trip_escapes() {
        let desired = desired_labels(
            "custom",
            &LabelSet::from([
                ("owner".into(), "\"ops\" \\ team".into()),
                ("note".into(), "multi\nline\ttext é".into()),
            ]),
        );
        let decoded = decode_labels("sys_2", &render_labels("sys_2", &desired)).unwrap();
        assert_eq!(decoded, desired);
    }

    #[test]
    fn selectors_round_trip_as_sets() {
        let desired = Selectors {
            include: Selector::from([("team".into(), strings(&["a", "b"]))]),
            exclude: Selector::new(),
        };
        let source = render_selectors("web", &desired.include, &desired.exclude);
        let decoded = decode_selectors(&source).unwrap();

        let mut team = decoded.include["team"].clone();
        team.sort();
        assert_eq!(team, strings(&["a", "b"]));
        assert!(decoded.exclude.is_empty());

        let reordered = Selectors {
            include: Selector::from([("team".into(), strings(&["b", "a"]))]),
            exclude: Selector::new(),
        };
        assert!(selectors_equal(&reordered, &decoded));

        let narrowed = Selectors {
            include: Selector::from([("team".into(), strings(&["a"]))]),
            exclude: Selector::new(),
        };
        assert!(!selectors_equal(&narrowed, &decoded));
    }

    #[test]
    fn duplicated_values_render_differently_but_decode_equal() {
        let plain = Selector::from([("team".into(), strings(&["a", "b"]))]);
        let noisy = Selector::from([("team".into(), strings(&["b", "a", "b"]))]);
        let exclude = Selector::from([("zone".into(), Vec::new())]);

        let plain_source = render_selectors("web", &plain, &exclude);
        let noisy_source = render_selectors("web", &noisy, &exclude);
        assert_ne!(plain_source, noisy_source);

        let expected = Selectors {
            include: plain,
            exclude,
        };
        assert!(selectors_equal(&expected, &decode_selectors(&plain_source).unwrap()));
        assert!(selectors_equal(&expected, &decode_selectors(&noisy_source).unwrap()));
    }

    #[test]
    fn missing_rule_decodes_empty() {
        let selectors = decode_selectors("package stacks.web.selectors\n\nallow := true\n").unwrap();
        assert_eq!(selectors, Selectors::default());

        let labels = decode_labels("sys1", "package metadata.sys1.labels\n\nother := 1\n").unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn invalid_source_is_a_compile_error() {
        let err = decode_selectors("package stacks.web.selectors\n\nsystems contains x if {\n")
            .unwrap_err();
        assert!(err.is_compile_error());

        let err = decode_labels("sys1", "labels := {}").unwrap_err();
        assert!(matches!(err, PolicyError::Syntax { .. }));
    }

    #[test]
    fn non_identifier_ids_round_trip() {
        for id in ["1f2e3d", "a-b"] {
            let desired = desired_labels("custom", &LabelSet::from([("env".into(), "prod".into())]));
            let source = render_labels(id, &desired);
            assert!(source.starts_with(&format!("package metadata[\"{id}\"].labels")));
            assert_eq!(decode_labels(id, &source).unwrap(), desired);

            let include = Selector::from([("team".into(), strings(&["a"]))]);
            let source = render_selectors(id, &include, &Selector::new());
            let decoded = decode_selectors(&source).unwrap();
            assert_eq!(decoded.include, include);
        }
    }

    #[test]
    fn labels_of_another_id_are_not_read() {
        let source = render_labels("1f2e3d", &desired_labels("custom", &LabelSet::new()));
        assert!(decode_labels("a-b", &source).unwrap().is_empty());
    }

    const LEGACY_LABELS: &str = r#"
package metadata.sys1.labels

labels := {
    "system-type": "custom",
    "env": "prod",
}
"#;

    const LEGACY_SELECTORS: &str = r#"
package stacks.web.selectors
import data.library.v1.utils.labels.match.v1 as match

systems[system_id] {
  include := {
    "team": {
      "a",
      "b",
    },
  }

  exclude := {
  }

  metadata := data.metadata[system_id]
  match.all(metadata.labels.labels, include, exclude)
}
"#;

    #[test]
    fn decodes_modules_written_with_v0_syntax() {
        let labels = decode_labels("sys1", LEGACY_LABELS).unwrap();
        assert!(labels_equal(
            &desired_labels("custom", &LabelSet::from([("env".into(), "prod".into())])),
            &labels
        ));

        let selectors = decode_selectors(LEGACY_SELECTORS).unwrap();
        let expected = Selectors {
            include: Selector::from([("team".into(), strings(&["b", "a"]))]),
            exclude: Selector::new(),
        };
        assert!(selectors_equal(&expected, &selectors));
    }
}
