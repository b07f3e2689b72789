//! Recovers selector groups from a compiled `selector.rego` module.
//!
//! The selectors are only present as the object literals bound to `include`
//! and `exclude` inside the `systems` rule, so they are read off the syntax
//! tree instead of being evaluated. Entries that do not have the rendered
//! shape are skipped, which lets foreign modules at the same path decode to an
//! empty result rather than an error.

use tracing::debug;

use super::ast::{Expr, Rule, Term, Terms};
use super::compiler::{CompiledModule, RewrittenVars};
use super::{SELECTOR_RULE, SELECTORS_MODULE, Selector, Selectors};

/// Extracts the include and exclude groups. A missing `systems` rule yields
/// empty groups.
#[must_use]
pub fn extract_selectors(compiled: &CompiledModule) -> Selectors {
    let Some(rule) = compiled.rule(SELECTORS_MODULE, SELECTOR_RULE) else {
        debug!(
            module = SELECTORS_MODULE,
            rule = SELECTOR_RULE,
            "rule not found, no selectors configured"
        );
        return Selectors::default();
    };

    let rewritten = compiled.rewritten_vars();
    Selectors {
        include: extract_selector(rule, rewritten, "include"),
        exclude: extract_selector(rule, rewritten, "exclude"),
    }
}

/// Values bound to the local variable `name` in the body of `rule`.
#[must_use]
pub fn extract_selector(rule: &Rule, rewritten: &RewrittenVars, name: &str) -> Selector {
    rule.bodies
        .iter()
        .flatten()
        .find_map(|expr| selector_values(expr, rewritten, name))
        .unwrap_or_default()
}

/// Matches `<op>(<var>, {<key>: {<value>, ..}, ..})` where `<var>` was written
/// as `name` in the source.
fn selector_values(expr: &Expr, rewritten: &RewrittenVars, name: &str) -> Option<Selector> {
    let Terms::Call(terms) = &expr.terms else {
        return None;
    };
    let [_, Term::Var(var), Term::Object(fields)] = terms.as_slice() else {
        return None;
    };
    if rewritten.resolve(var).as_str() != name {
        return None;
    }

    let selector = fields
        .iter()
        .filter_map(|(key, value)| {
            let (Term::String(key), Term::Set(items)) = (key, value) else {
                return None;
            };
            let values = items
                .iter()
                .filter_map(|item| match item {
                    Term::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Some((key.clone(), values))
        })
        .collect();

    Some(selector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rego::compiler::{MATCH_HELPER_STUB_MODULE, MATCH_HELPER_STUB_V1, compile_modules};

    fn compile(source: &str) -> CompiledModule {
        compile_modules([
            (SELECTORS_MODULE, source),
            (MATCH_HELPER_STUB_MODULE, MATCH_HELPER_STUB_V1),
        ])
        .unwrap()
    }

    #[test]
    fn reads_through_rewritten_names() {
        let compiled = compile(
            r#"package stacks.web.selectors

import data.library.v1.utils.labels.match.v1 as match
import rego.v1

systems contains system_id if {
    include := {"team": {"a", "b", "a"}, "tier": set()}
    exclude := {"zone": {`eu\1`}}
    metadata := data.metadata[system_id]
    match.all(metadata.labels.labels, include, exclude)
}
"#,
        );

        let selectors = extract_selectors(&compiled);
        assert_eq!(
            selectors.include,
            Selector::from([
                ("team".into(), vec!["a".into(), "b".into(), "a".into()]),
                ("tier".into(), Vec::new()),
            ])
        );
        assert_eq!(
            selectors.exclude,
            Selector::from([("zone".into(), vec!["eu\\1".into()])])
        );
    }

    #[test]
    fn skips_entries_of_foreign_shape() {
        let compiled = compile(
            r#"package stacks.web.selectors

import rego.v1

systems contains system_id if {
    include := {"team": {"a", 1}, "env": "prod", "zone": ["eu"], "ok": {"x"}}
    system_id := "s1"
}
"#,
        );

        let selectors = extract_selectors(&compiled);
        assert_eq!(
            selectors.include,
            Selector::from([
                ("team".into(), vec!["a".into()]),
                ("ok".into(), vec!["x".into()]),
            ])
        );
        assert!(selectors.exclude.is_empty());
    }

    #[test]
    fn missing_rule_is_empty() {
        let compiled = compile("package stacks.web.selectors\n\nallow := true\n");
        assert_eq!(extract_selectors(&compiled), Selectors::default());
    }
}
