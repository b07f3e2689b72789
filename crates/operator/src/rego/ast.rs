// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Tagged-variant view over the syntax tree produced by `regorus`.
//!
//! Expressions follow the shape used by OPA: a body is a list of [`Expr`], and
//! an expression is either a single [`Term`] or a call whose first slot is the
//! operator reference (`assign`, `eq`, a builtin, or a user function).

use std::fmt;

/// A compiled policy module
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    /// Package path without the implicit `data.` root
    pub package: Ref,
    /// Import declarations in source order
    pub imports: Vec<Import>,
    /// Rules in source order
    pub rules: Vec<Rule>,
}

impl Module {
    /// Package path as plain segments, `None` when a segment is not a string.
    #[must_use]
    pub fn package_path(&self) -> Option<Vec<String>> {
        self.package.string_segments()
    }

    /// Finds the first rule named `name`.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.name.as_str() == name)
    }
}

/// `import <path> [as <alias>]`
#[derive(Clone, Debug, PartialEq)]
pub struct Import {
    /// Imported reference, e.g. `data.library.v1`
    pub path: Ref,
    /// Optional alias
    pub alias: Option<Var>,
}

impl Import {
    /// Name under which the import is visible inside the module.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        if let Some(alias) = &self.alias {
            return Some(alias.as_str().to_string());
        }
        match self.path.0.last()? {
            Term::Var(var) => Some(var.as_str().to_string()),
            Term::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// A rule with all of its bodies (`else` branches follow the first one)
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    /// First segment of the head reference
    pub name: Var,
    /// `default` rules have no body
    pub default: bool,
    /// Function arguments
    pub args: Vec<Term>,
    /// Key of partial set and object rules
    pub key: Option<Term>,
    /// Produced value
    pub value: Option<Term>,
    /// Conjunctions, one per body
    pub bodies: Vec<Body>,
}

impl Rule {
    /// Calls `f` with the slots (operator first) of every call in the rule,
    /// nested calls and `else` bodies included.
    pub fn for_each_call(&self, f: &mut dyn FnMut(&[Term])) {
        self.args
            .iter()
            .chain(&self.key)
            .chain(&self.value)
            .for_each(|t| t.for_each_call(f));
        for body in &self.bodies {
            body_calls(body, f);
        }
    }
}

/// Conjunction of expressions
pub type Body = Vec<Expr>;

/// One literal of a rule body
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    /// Preceded by `not`
    pub negated: bool,
    /// What the expression evaluates
    pub terms: Terms,
    /// `with` modifiers
    pub with: Vec<With>,
}

/// Expression payload
#[derive(Clone, Debug, PartialEq)]
pub enum Terms {
    /// A single term, e.g. `input.allowed`
    Single(Term),
    /// Operator reference followed by the operands
    Call(Vec<Term>),
    /// `some x, y` or `some x in xs`
    Some {
        /// Declared variables (key and value for `some k, v in xs`)
        vars: Vec<Term>,
        /// Collection for `some .. in`
        domain: Option<Term>,
    },
    /// `every k, v in xs { .. }`
    Every {
        /// Key variable
        key: Option<Term>,
        /// Value variable
        value: Term,
        /// Collection iterated over
        domain: Term,
        /// Body checked for every element
        body: Body,
    },
}

impl From<Term> for Terms {
    fn from(term: Term) -> Self {
        match term {
            Term::Call(terms) => Terms::Call(terms),
            other => Terms::Single(other),
        }
    }
}

/// `with <target> as <value>`
#[derive(Clone, Debug, PartialEq)]
pub struct With {
    /// Replaced document or function
    pub target: Term,
    /// Replacement
    pub value: Term,
}

/// A syntactic node inside an expression
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    /// `null`, booleans and numbers, kept as written
    Scalar(String),
    /// String literal, escapes resolved
    String(String),
    /// Variable
    Var(Var),
    /// Reference such as `data.metadata[system_id]`
    Ref(Ref),
    /// Operator reference followed by the operands
    Call(Vec<Term>),
    /// `[a, b]`
    Array(Vec<Term>),
    /// `{a, b}` or `set()`
    Set(Vec<Term>),
    /// `{k: v}`
    Object(Vec<(Term, Term)>),
    /// `[t | body]`
    ArrayComprehension(Box<Term>, Body),
    /// `{t | body}`
    SetComprehension(Box<Term>, Body),
    /// `{k: v | body}`
    ObjectComprehension(Box<Term>, Box<Term>, Body),
}

impl Term {
    /// Reference to a builtin operator such as `assign` or `internal.member_2`.
    #[must_use]
    pub fn operator(name: &str) -> Self {
        let mut parts = name.split('.');
        let head = parts.next().unwrap_or(name);
        let mut segments = vec![Term::Var(Var::new(head))];
        segments.extend(parts.map(|part| Term::String(part.to_string())));
        Term::Ref(Ref(segments))
    }

    /// Appends a path segment, turning the term into a reference.
    #[must_use]
    pub fn with_segment(self, segment: Term) -> Self {
        match self {
            Term::Ref(mut reference) => {
                reference.0.push(segment);
                Term::Ref(reference)
            }
            other => Term::Ref(Ref(vec![other, segment])),
        }
    }

    fn for_each_call(&self, f: &mut dyn FnMut(&[Term])) {
        match self {
            Term::Call(terms) => {
                f(terms);
                terms.iter().for_each(|t| t.for_each_call(f));
            }
            Term::Ref(Ref(terms)) | Term::Array(terms) | Term::Set(terms) => {
                terms.iter().for_each(|t| t.for_each_call(f));
            }
            Term::Object(fields) => {
                for (key, value) in fields {
                    key.for_each_call(f);
                    value.for_each_call(f);
                }
            }
            Term::ArrayComprehension(term, body) | Term::SetComprehension(term, body) => {
                term.for_each_call(f);
                body_calls(body, f);
            }
            Term::ObjectComprehension(key, value, body) => {
                key.for_each_call(f);
                value.for_each_call(f);
                body_calls(body, f);
            }
            Term::Scalar(_) | Term::String(_) | Term::Var(_) => {}
        }
    }
}

fn body_calls(body: &Body, f: &mut dyn FnMut(&[Term])) {
    for expr in body {
        match &expr.terms {
            Terms::Single(term) => term.for_each_call(f),
            Terms::Call(terms) => {
                f(terms);
                terms.iter().for_each(|t| t.for_each_call(f));
            }
            Terms::Some { vars, domain } => {
                vars.iter().chain(domain).for_each(|t| t.for_each_call(f));
            }
            Terms::Every {
                key,
                value,
                domain,
                body,
            } => {
                key.iter()
                    .chain([value, domain])
                    .for_each(|t| t.for_each_call(f));
                body_calls(body, f);
            }
        }
        for with in &expr.with {
            with.value.for_each_call(f);
        }
    }
}

/// Variable name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(String);

impl Var {
    /// Creates a variable
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Variable name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `_` never binds anything
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == "_"
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference: a head term followed by path segments
#[derive(Clone, Debug, PartialEq)]
pub struct Ref(pub Vec<Term>);

impl Ref {
    /// Segments as plain strings: the head variable followed by string keys.
    #[must_use]
    pub fn string_segments(&self) -> Option<Vec<String>> {
        let (head, rest) = self.0.split_first()?;
        let Term::Var(head) = head else {
            return None;
        };
        let mut segments = vec![head.as_str().to_string()];
        for term in rest {
            let Term::String(s) = term else {
                return None;
            };
            segments.push(s.clone());
        }
        Some(segments)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.0.iter().enumerate() {
            match term {
                Term::Var(var) if i == 0 => write!(f, "{var}")?,
                Term::String(key) if is_identifier(key) => write!(f, ".{key}")?,
                Term::String(key) => write!(f, "[{}]", serde_json::Value::String(key.clone()))?,
                Term::Var(var) => write!(f, "[{var}]")?,
                _ => write!(f, "[..]")?,
            }
        }
        Ok(())
    }
}

/// Whether `name` can be written as a bare identifier.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
