//! Input revalidation against the contract.
//!
//! Submitted values are untrusted even when the envelope is authentic: the
//! issuer is trusted to say *who* asked, not that the values are well formed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use deckhand_types::{Contract, FieldKind, FieldSpec, NumericRules, TextRules};
use regex::Regex;
use thiserror::Error;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .expect("valid regex")
});

const PORT_RANGE: std::ops::RangeInclusive<i64> = 1..=65_535;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// What is wrong with one field. Never carries the submitted value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldProblem {
    #[error("is required")]
    Missing,
    #[error("does not match the required pattern")]
    PatternMismatch,
    #[error("must be at least {0} characters")]
    TooShort(usize),
    #[error("must be at most {0} characters")]
    TooLong(usize),
    #[error("must be a whole number")]
    NotInteger,
    #[error("must be at least {0}")]
    BelowMin(i64),
    #[error("must be at most {0}")]
    AboveMax(i64),
    #[error("must be a port number between 1 and 65535")]
    PortRange,
    #[error("must be 'true' or 'false'")]
    NotBoolean,
    #[error("must be one of: {0}")]
    NotAllowed(String),
    #[error("must be a valid email address")]
    NotEmail,
}

/// One problem with one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub problem: FieldProblem,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.problem)
    }
}

/// Every problem found in one submission.
///
/// Displays as the offending field names joined with `, `.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.field_names().join(", "))]
pub struct ValidationError {
    pub fields: Vec<FieldError>,
}

impl ValidationError {
    /// Offending fields in declaration order, each listed once.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for e in &self.fields {
            if !names.contains(&e.field.as_str()) {
                names.push(&e.field);
            }
        }
        names
    }

    /// One line per problem.
    pub fn details(&self) -> String {
        self.fields
            .iter()
            .map(|e| format!("{e}\n"))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// A validated, normalized input.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub name: String,
    pub value: String,
    pub sensitive: bool,
}

impl fmt::Debug for ResolvedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: &dyn fmt::Debug = if self.sensitive {
            &"<redacted>"
        } else {
            &self.value
        };
        f.debug_struct("ResolvedInput")
            .field("name", &self.name)
            .field("value", value)
            .finish()
    }
}

/// The parameter set handed to the installer, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedInputs {
    values: Vec<ResolvedInput>,
}

impl ResolvedInputs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedInput> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Names only, safe to log.
    pub fn names(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.name.as_str()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validator
// ─────────────────────────────────────────────────────────────────────────────

/// Checks a submission against one contract.
#[derive(Debug, Clone, Copy)]
pub struct InputValidator<'a> {
    contract: &'a Contract,
}

impl<'a> InputValidator<'a> {
    pub fn new(contract: &'a Contract) -> Self {
        Self { contract }
    }

    /// Resolve every visible field or report all problems at once.
    pub fn validate(
        &self,
        submitted: &BTreeMap<String, String>,
    ) -> Result<ResolvedInputs, ValidationError> {
        let undeclared: Vec<&str> = submitted
            .keys()
            .map(String::as_str)
            .filter(|name| self.contract.field(name).is_none())
            .collect();
        if !undeclared.is_empty() {
            tracing::warn!(
                app_id = %self.contract.id,
                fields = ?undeclared,
                "Ignoring inputs not declared by the contract"
            );
        }

        let mut resolved = ResolvedInputs::default();
        let mut errors = Vec::new();

        for field in &self.contract.inputs {
            if !is_visible(field, &resolved) {
                continue;
            }

            let raw = submitted
                .get(&field.name)
                .filter(|v| !v.is_empty())
                .or(field.default.as_ref().filter(|v| !v.is_empty()));
            let Some(raw) = raw else {
                if field.required {
                    errors.push(FieldError {
                        field: field.name.clone(),
                        problem: FieldProblem::Missing,
                    });
                }
                continue;
            };

            match check_value(&field.kind, raw) {
                Ok(value) => resolved.values.push(ResolvedInput {
                    name: field.name.clone(),
                    value,
                    sensitive: field.is_sensitive(),
                }),
                Err(problems) => errors.extend(problems.into_iter().map(|problem| FieldError {
                    field: field.name.clone(),
                    problem,
                })),
            }
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(ValidationError { fields: errors })
        }
    }
}

/// All `visible_if` entries must match earlier resolved values.
fn is_visible(field: &FieldSpec, resolved: &ResolvedInputs) -> bool {
    match &field.visible_if {
        None => true,
        Some(conditions) => conditions
            .iter()
            .all(|(name, expected)| resolved.get(name) == Some(expected.as_str())),
    }
}

/// Check one value, returning its normalized form.
fn check_value(kind: &FieldKind, raw: &str) -> Result<String, Vec<FieldProblem>> {
    match kind {
        FieldKind::Text(rules) | FieldKind::Secret(rules) => {
            check_text(rules, raw)?;
            Ok(raw.to_string())
        }
        FieldKind::Email(rules) => {
            let mut problems = Vec::new();
            if !EMAIL_RE.is_match(raw) {
                problems.push(FieldProblem::NotEmail);
            }
            if let Err(more) = check_text(rules, raw) {
                problems.extend(more);
            }
            if problems.is_empty() {
                Ok(raw.to_string())
            } else {
                Err(problems)
            }
        }
        FieldKind::Integer(rules) => {
            let n = parse_whole(raw)?;
            check_bounds(rules, n)?;
            Ok(n.to_string())
        }
        FieldKind::Port(rules) => {
            let n = parse_whole(raw)?;
            if !PORT_RANGE.contains(&n) {
                return Err(vec![FieldProblem::PortRange]);
            }
            check_bounds(rules, n)?;
            Ok(n.to_string())
        }
        FieldKind::Boolean => match raw {
            "true" | "false" => Ok(raw.to_string()),
            _ => Err(vec![FieldProblem::NotBoolean]),
        },
        FieldKind::Choice { allowed } => {
            if allowed.iter().any(|a| a == raw) {
                Ok(raw.to_string())
            } else {
                Err(vec![FieldProblem::NotAllowed(allowed.join(", "))])
            }
        }
    }
}

fn check_text(rules: &TextRules, raw: &str) -> Result<(), Vec<FieldProblem>> {
    let mut problems = Vec::new();
    let len = raw.chars().count();
    if let Some(min) = rules.min_length
        && len < min
    {
        problems.push(FieldProblem::TooShort(min));
    }
    if let Some(max) = rules.max_length
        && len > max
    {
        problems.push(FieldProblem::TooLong(max));
    }
    if let Some(pattern) = &rules.pattern
        && !pattern.is_match(raw)
    {
        problems.push(FieldProblem::PatternMismatch);
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn parse_whole(raw: &str) -> Result<i64, Vec<FieldProblem>> {
    raw.parse::<i64>().map_err(|_| vec![FieldProblem::NotInteger])
}

fn check_bounds(rules: &NumericRules, n: i64) -> Result<(), Vec<FieldProblem>> {
    if let Some(min) = rules.min_value
        && n < min
    {
        return Err(vec![FieldProblem::BelowMin(min)]);
    }
    if let Some(max) = rules.max_value
        && n > max
    {
        return Err(vec![FieldProblem::AboveMax(max)]);
    }
    Ok(())
}
