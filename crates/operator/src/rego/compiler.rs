// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Compiles named policy fragments into a [`CompiledModule`].
//!
//! Fragments are parsed by `regorus` and loaded into a `regorus` engine. The
//! parsed modules are lowered into the [`ast`](super::ast) view, calls into
//! `data` are checked, and local variables are rewritten to unique names with
//! the mapping recorded in [`RewrittenVars`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regorus::unstable::{self as parsed, Parser, Source};
use regorus::{Engine, QueryResults, Value};
use tracing::{debug, instrument};

use super::PolicyError;
use super::ast::{Body, Expr, Import, Module, Ref, Rule, Term, Terms, Var, With};

/// File name of the helper stub compiled next to selector modules
pub const MATCH_HELPER_STUB_MODULE: &str = "mock.rego";

/// Always-true stand-in for `data.library.v1.utils.labels.match.v1.all`, which
/// only exists on the remote side at evaluation time.
pub const MATCH_HELPER_STUB_V1: &str = r"package library.v1.utils.labels.match.v1

import rego.v1

all(labels, incl, excl) if {
	true
}
";

/// Rewritten variable name → name written in the source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewrittenVars(BTreeMap<Var, Var>);

impl RewrittenVars {
    /// Source-level name of `var`, or `var` itself when it was never rewritten.
    #[must_use]
    pub fn resolve<'a>(&'a self, var: &'a Var) -> &'a Var {
        self.0.get(var).unwrap_or(var)
    }
}

/// Result of compiling a set of fragments together
pub struct CompiledModule {
    modules: BTreeMap<String, Module>,
    rewritten_vars: RewrittenVars,
    engine: Engine,
}

impl CompiledModule {
    /// Compiled module by fragment name
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// First rule named `rule` in fragment `module`
    #[must_use]
    pub fn rule(&self, module: &str, rule: &str) -> Option<&Rule> {
        self.module(module)?.rule(rule)
    }

    /// Whether any fragment declares `package` and defines `rule` in it.
    #[must_use]
    pub fn defines(&self, package: &[String], rule: &str) -> bool {
        self.modules.values().any(|module| {
            module.package_path().as_deref() == Some(package) && module.rule(rule).is_some()
        })
    }

    /// Read-only view of the variable rewrite table
    #[must_use]
    pub fn rewritten_vars(&self) -> &RewrittenVars {
        &self.rewritten_vars
    }

    /// Evaluates `query` against the compiled fragments.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Evaluation`] when the engine fails.
    pub fn eval_query(&mut self, query: &str) -> Result<QueryResults, PolicyError> {
        self.engine
            .eval_query(query.to_string(), false)
            .map_err(|e| PolicyError::Evaluation {
                query: query.to_string(),
                message: format!("{e:#}"),
            })
    }
}

/// Compiles `(file name, source)` fragments together.
///
/// Modules without `import rego.v1` are read with v0 syntax.
///
/// # Errors
///
/// Fails when a fragment is not valid policy source, or when a call through
/// `data` names a function none of the fragments define.
#[instrument(skip_all)]
pub fn compile_modules<'a>(
    fragments: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<CompiledModule, PolicyError> {
    let mut modules = BTreeMap::new();
    let mut engine = Engine::new();
    engine.set_rego_v0(true);

    for (name, source) in fragments {
        let parsed = parse_fragment(name, source)?;

        engine
            .add_policy(name.to_string(), source.to_string())
            .map_err(|e| PolicyError::Rejected {
                module: name.to_string(),
                message: format!("{e:#}"),
            })?;

        modules.insert(name.to_string(), lower_module(&parsed));
    }

    check_calls(&modules)?;

    let mut rewriter = Rewriter::default();
    for module in modules.values_mut() {
        for rule in &mut module.rules {
            rewriter.rule(rule);
        }
    }

    debug!(
        modules = modules.len(),
        rewritten_vars = rewriter.next,
        "compiled policy modules"
    );

    Ok(CompiledModule {
        modules,
        rewritten_vars: rewriter.table,
        engine,
    })
}

fn parse_fragment(name: &str, source: &str) -> Result<parsed::Module, PolicyError> {
    let syntax = |e: &dyn fmt::Display| PolicyError::Syntax {
        module: name.to_string(),
        message: format!("{e:#}"),
    };

    let source = Source::from_contents(name.to_string(), source.to_string())
        .map_err(|e| syntax(&e))?;
    let mut parser = Parser::new(&source).map_err(|e| syntax(&e))?;
    parser.parse().map_err(|e| syntax(&e))
}

fn lower_module(module: &parsed::Module) -> Module {
    Module {
        package: into_ref(lower_expr(&module.package.refr)),
        imports: module
            .imports
            .iter()
            .map(|import| Import {
                path: into_ref(lower_expr(&import.refr)),
                alias: import.r#as.as_ref().map(|alias| Var::new(alias.text())),
            })
            .collect(),
        rules: module.policy.iter().map(|rule| lower_rule(rule)).collect(),
    }
}

fn lower_rule(rule: &parsed::Rule) -> Rule {
    match rule {
        parsed::Rule::Spec { head, bodies, .. } => {
            let (reference, args, key, value) = match head {
                parsed::RuleHead::Compr { refr, assign, .. } => (
                    refr,
                    Vec::new(),
                    None,
                    assign.as_ref().map(|a| lower_expr(&a.value)),
                ),
                parsed::RuleHead::Set { refr, key, .. } => {
                    (refr, Vec::new(), key.as_ref().map(|k| lower_expr(k)), None)
                }
                parsed::RuleHead::Func {
                    refr, args, assign, ..
                } => (
                    refr,
                    args.iter().map(|a| lower_expr(a)).collect(),
                    None,
                    assign.as_ref().map(|a| lower_expr(&a.value)),
                ),
            };
            Rule {
                name: head_name(lower_expr(reference)),
                default: false,
                args,
                key,
                value,
                bodies: bodies.iter().map(|body| lower_query(&body.query)).collect(),
            }
        }
        parsed::Rule::Default {
            refr, args, value, ..
        } => Rule {
            name: head_name(lower_expr(refr)),
            default: true,
            args: args.iter().map(|a| lower_expr(a)).collect(),
            key: None,
            value: Some(lower_expr(value)),
            bodies: Vec::new(),
        },
    }
}

fn head_name(reference: Term) -> Var {
    match reference {
        Term::Var(var) => var,
        Term::Ref(Ref(terms)) => match terms.into_iter().next() {
            Some(Term::Var(var)) => var,
            _ => Var::new(""),
        },
        _ => Var::new(""),
    }
}

fn into_ref(term: Term) -> Ref {
    match term {
        Term::Ref(reference) => reference,
        other => Ref(vec![other]),
    }
}

fn lower_query(query: &parsed::Query) -> Body {
    query.stmts.iter().map(lower_stmt).collect()
}

fn lower_stmt(stmt: &parsed::LiteralStmt) -> Expr {
    let declared = |span: &parsed::Span| Term::Var(Var::new(span.text()));

    let (negated, terms): (bool, Terms) = match &stmt.literal {
        parsed::Literal::Expr { expr, .. } => (false, lower_expr(expr).into()),
        parsed::Literal::NotExpr { expr, .. } => (true, lower_expr(expr).into()),
        parsed::Literal::SomeVars { vars, .. } => (
            false,
            Terms::Some {
                vars: vars.iter().map(declared).collect(),
                domain: None,
            },
        ),
        parsed::Literal::SomeIn {
            key,
            value,
            collection,
            ..
        } => (
            false,
            Terms::Some {
                vars: key.iter().chain([value]).map(|e| lower_expr(e)).collect(),
                domain: Some(lower_expr(collection)),
            },
        ),
        parsed::Literal::Every {
            key,
            value,
            domain,
            query,
            ..
        } => (
            false,
            Terms::Every {
                key: key.as_ref().map(declared),
                value: declared(value),
                domain: lower_expr(domain),
                body: lower_query(query),
            },
        ),
    };

    Expr {
        negated,
        terms,
        with: stmt
            .with_mods
            .iter()
            .map(|modifier| With {
                target: lower_expr(&modifier.refr),
                value: lower_expr(&modifier.r#as),
            })
            .collect(),
    }
}

fn lower_expr(expr: &parsed::Expr) -> Term {
    match expr {
        parsed::Expr::String { value, .. } | parsed::Expr::RawString { value, .. } => {
            match value {
                Value::String(s) => Term::String(s.to_string()),
                _ => Term::Scalar(expr.span().text().to_string()),
            }
        }
        parsed::Expr::Var { span, .. } => Term::Var(Var::new(span.text())),
        parsed::Expr::Array { items, .. } => {
            Term::Array(items.iter().map(|e| lower_expr(e)).collect())
        }
        parsed::Expr::Set { items, .. } => Term::Set(items.iter().map(|e| lower_expr(e)).collect()),
        parsed::Expr::Object { fields, .. } => Term::Object(
            fields
                .iter()
                .map(|(_, key, value)| (lower_expr(key), lower_expr(value)))
                .collect(),
        ),
        parsed::Expr::ArrayCompr { term, query, .. } => {
            Term::ArrayComprehension(Box::new(lower_expr(term)), lower_query(query))
        }
        parsed::Expr::SetCompr { term, query, .. } => {
            Term::SetComprehension(Box::new(lower_expr(term)), lower_query(query))
        }
        parsed::Expr::ObjectCompr {
            key, value, query, ..
        } => Term::ObjectComprehension(
            Box::new(lower_expr(key)),
            Box::new(lower_expr(value)),
            lower_query(query),
        ),
        parsed::Expr::Call { fcn, params, .. } => {
            let function = lower_expr(fcn);
            if params.is_empty() && function == Term::Var(Var::new("set")) {
                return Term::Set(Vec::new());
            }
            let mut terms = vec![function];
            terms.extend(params.iter().map(|p| lower_expr(p)));
            Term::Call(terms)
        }
        parsed::Expr::UnaryExpr { expr: operand, .. } => {
            Term::Call(vec![Term::operator("neg"), lower_expr(operand)])
        }
        parsed::Expr::RefDot { span, refr, .. } => {
            let text = span.text();
            let field = text.rsplit_once('.').map_or(text, |(_, field)| field);
            lower_expr(refr).with_segment(Term::String(field.to_string()))
        }
        parsed::Expr::RefBrack { refr, index, .. } => {
            lower_expr(refr).with_segment(lower_expr(index))
        }
        parsed::Expr::AssignExpr { op, lhs, rhs, .. } => {
            let operator = if matches!(op, parsed::AssignOp::ColEq) {
                "assign"
            } else {
                "eq"
            };
            Term::Call(vec![Term::operator(operator), lower_expr(lhs), lower_expr(rhs)])
        }
        parsed::Expr::BoolExpr { op, lhs, rhs, .. } => infix(op, lower_expr(lhs), lower_expr(rhs)),
        parsed::Expr::ArithExpr { op, lhs, rhs, .. } => infix(op, lower_expr(lhs), lower_expr(rhs)),
        parsed::Expr::BinExpr { op, lhs, rhs, .. } => infix(op, lower_expr(lhs), lower_expr(rhs)),
        parsed::Expr::Membership {
            key,
            value,
            collection,
            ..
        } => {
            let operator = if key.is_some() {
                "internal.member_3"
            } else {
                "internal.member_2"
            };
            let mut terms = vec![Term::operator(operator)];
            terms.extend(
                key.iter()
                    .chain([value, collection])
                    .map(|e| lower_expr(e)),
            );
            Term::Call(terms)
        }
        other => Term::Scalar(other.span().text().to_string()),
    }
}

/// Comparison, arithmetic and set operators, named after the operator variant.
fn infix(op: &impl fmt::Debug, lhs: Term, rhs: Term) -> Term {
    let name = format!("{op:?}").to_lowercase();
    Term::Call(vec![Term::operator(&name), lhs, rhs])
}

/// Every call through an imported `data` path, or a literal `data.` reference,
/// must name a rule defined by one of the fragments.
fn check_calls(modules: &BTreeMap<String, Module>) -> Result<(), PolicyError> {
    let defined: BTreeSet<Vec<String>> = modules
        .values()
        .filter_map(|module| Some((module.package_path()?, module)))
        .flat_map(|(package, module)| {
            module.rules.iter().map(move |rule| {
                let mut path = vec!["data".to_string()];
                path.extend(package.iter().cloned());
                path.push(rule.name.to_string());
                path
            })
        })
        .collect();

    for (name, module) in modules {
        let aliases: BTreeMap<String, Vec<String>> = module
            .imports
            .iter()
            .filter_map(|import| {
                let path = import.path.string_segments()?;
                (path.first()? == "data").then_some((import.name()?, path))
            })
            .collect();

        let mut undefined = None;
        for rule in &module.rules {
            rule.for_each_call(&mut |terms: &[Term]| {
                if undefined.is_some() {
                    return;
                }
                let Some(Term::Ref(operator)) = terms.first() else {
                    return;
                };
                let Some(segments) = operator.string_segments() else {
                    return;
                };
                let path = if segments[0] == "data" {
                    segments
                } else if let Some(prefix) = aliases.get(&segments[0]) {
                    prefix.iter().chain(&segments[1..]).cloned().collect()
                } else {
                    return;
                };
                if !defined.contains(&path) {
                    undefined = Some(operator.to_string());
                }
            });
        }

        if let Some(function) = undefined {
            return Err(PolicyError::UndefinedFunction {
                module: name.clone(),
                function,
            });
        }
    }

    Ok(())
}

/// Renames variables declared with `:=` or `some` to `__localN__`.
#[derive(Default)]
struct Rewriter {
    table: RewrittenVars,
    next: usize,
}

type Scope = BTreeMap<Var, Var>;

impl Rewriter {
    fn rule(&mut self, rule: &mut Rule) {
        for (i, body) in rule.bodies.iter_mut().enumerate() {
            let mut scope = Scope::new();
            self.body(body, &mut scope);
            if i == 0 {
                for term in rule.key.iter_mut().chain(&mut rule.value) {
                    self.term(term, &scope);
                }
            }
        }
    }

    fn body(&mut self, body: &mut Body, scope: &mut Scope) {
        for expr in body {
            match &mut expr.terms {
                Terms::Call(terms) if terms.len() == 3 && terms[0] == Term::operator("assign") => {
                    self.term(&mut terms[2], scope);
                    self.declare(&mut terms[1], scope);
                }
                Terms::Call(terms) => {
                    for term in terms {
                        self.term(term, scope);
                    }
                }
                Terms::Single(term) => self.term(term, scope),
                Terms::Some { vars, domain } => {
                    if let Some(domain) = domain {
                        self.term(domain, scope);
                    }
                    for var in vars {
                        self.declare(var, scope);
                    }
                }
                Terms::Every {
                    key,
                    value,
                    domain,
                    body,
                } => {
                    self.term(domain, scope);
                    let mut inner = scope.clone();
                    for var in key.iter_mut().chain([value]) {
                        self.declare(var, &mut inner);
                    }
                    self.body(body, &mut inner);
                }
            }
            for with in &mut expr.with {
                self.term(&mut with.value, scope);
            }
        }
    }

    fn declare(&mut self, term: &mut Term, scope: &mut Scope) {
        match term {
            Term::Var(var) if !var.is_wildcard() => {
                let local = Var::new(format!("__local{}__", self.next));
                self.next += 1;
                let original = std::mem::replace(var, local.clone());
                self.table.0.insert(local.clone(), original.clone());
                scope.insert(original, local);
            }
            Term::Array(items) => {
                for item in items {
                    self.declare(item, scope);
                }
            }
            other => self.term(other, scope),
        }
    }

    fn term(&mut self, term: &mut Term, scope: &Scope) {
        match term {
            Term::Var(var) => {
                if let Some(local) = scope.get(var) {
                    *var = local.clone();
                }
            }
            Term::Ref(reference) => {
                for term in &mut reference.0 {
                    self.term(term, scope);
                }
            }
            Term::Call(terms) | Term::Array(terms) | Term::Set(terms) => {
                for term in terms {
                    self.term(term, scope);
                }
            }
            Term::Object(fields) => {
                for (key, value) in fields {
                    self.term(key, scope);
                    self.term(value, scope);
                }
            }
            Term::ArrayComprehension(head, body) | Term::SetComprehension(head, body) => {
                let mut inner = scope.clone();
                self.body(body, &mut inner);
                self.term(head, &inner);
            }
            Term::ObjectComprehension(key, value, body) => {
                let mut inner = scope.clone();
                self.body(body, &mut inner);
                self.term(key, &inner);
                self.term(value, &inner);
            }
            Term::Scalar(_) | Term::String(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECTORS: &str = r#"package stacks.web.selectors

import data.library.v1.utils.labels.match.v1 as match
import rego.v1

systems contains system_id if {
	include := {"team": {"a"}}
	exclude := {}
	metadata := data.metadata[system_id]
	match.all(metadata.labels.labels, include, exclude)
}
"#;

    #[test]
    fn rewrites_local_variables() {
        let compiled = compile_modules([
            ("selector.rego", SELECTORS),
            (MATCH_HELPER_STUB_MODULE, MATCH_HELPER_STUB_V1),
        ])
        .unwrap();

        let rule = compiled.rule("selector.rego", "systems").unwrap();
        let body = &rule.bodies[0];
        let Terms::Call(terms) = &body[0].terms else {
            panic!("expected assignment");
        };
        let Term::Var(include) = &terms[1] else {
            panic!("expected variable");
        };
        assert!(include.as_str().starts_with("__local"));
        assert_eq!(compiled.rewritten_vars().resolve(include).as_str(), "include");

        // uses of the variable follow the rename
        let Terms::Call(call) = &body[3].terms else {
            panic!("expected call");
        };
        assert_eq!(call[2], terms[1]);
        assert_eq!(compiled.rewritten_vars().0.len(), 3);
    }

    #[test]
    fn resolve_passes_through_unknown_names() {
        let table = RewrittenVars::default();
        let var = Var::new("include");
        assert_eq!(table.resolve(&var), &var);
    }

    #[test]
    fn undefined_helper_without_stub() {
        let err = compile_modules([("selector.rego", SELECTORS)])
            .err()
            .unwrap();
        assert!(
            matches!(err, PolicyError::UndefinedFunction { ref function, .. } if function == "match.all"),
            "{err}"
        );
    }

    #[test]
    fn syntax_errors_name_the_module() {
        let err = compile_modules([("labels.rego", "package p\n\nlabels := {\n")])
            .err()
            .unwrap();
        assert!(matches!(err, PolicyError::Syntax { ref module, .. } if module == "labels.rego"));
        assert!(err.is_compile_error());
    }

    #[test]
    fn looks_up_rules_by_package() {
        let compiled = compile_modules([(MATCH_HELPER_STUB_MODULE, MATCH_HELPER_STUB_V1)]).unwrap();
        let package: Vec<String> = ["library", "v1", "utils", "labels", "match", "v1"]
            .map(String::from)
            .to_vec();
        assert!(compiled.defines(&package, "all"));
        assert!(!compiled.defines(&package, "any"));
        assert!(compiled.rule(MATCH_HELPER_STUB_MODULE, "all").is_some());
        assert!(compiled.rule("selector.rego", "systems").is_none());
    }
}
