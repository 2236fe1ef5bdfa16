use thiserror::Error;

use crate::host::Host;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid selector '{expr}': {reason}")]
pub struct SelectorError {
    pub expr: String,
    pub reason: String,
}

/// Predicate deciding whether a host takes part in a task.
///
/// The orchestrator treats it as opaque; evaluation failures are fatal.
pub trait Selector: Send + Sync {
    fn matches(&self, expr: &str, host: &Host) -> Result<bool, SelectorError>;
}

/// Default selector over host aliases and labels.
///
/// Grammar: alternatives separated by `,` (any may match), each made of
/// terms joined by `&` (all must match). A term is `all`, a bare host alias,
/// `label=value` or `label!=value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelSelector;

impl Selector for LabelSelector {
    fn matches(&self, expr: &str, host: &Host) -> Result<bool, SelectorError> {
        let invalid = |reason: &str| SelectorError {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        if expr.trim().is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut any = false;
        for alternative in expr.split(',') {
            let mut all = true;
            for term in alternative.split('&') {
                let term = term.trim();
                if term.is_empty() {
                    return Err(invalid("empty term"));
                }
                // Evaluate every term so malformed input is reported even when
                // an earlier term already decided the outcome.
                all &= eval_term(term, host).map_err(|reason| invalid(&reason))?;
            }
            any |= all;
        }
        Ok(any)
    }
}

fn eval_term(term: &str, host: &Host) -> Result<bool, String> {
    if let Some((key, value)) = term.split_once("!=") {
        let (key, value) = comparison(key, value)?;
        return Ok(host.label(key).as_deref() != Some(value));
    }
    if let Some((key, value)) = term.split_once('=') {
        let (key, value) = comparison(key, value)?;
        return Ok(host.label(key).as_deref() == Some(value));
    }
    if term.chars().any(char::is_whitespace) {
        return Err(format!("unexpected whitespace in term '{term}'"));
    }
    Ok(term == "all" || term == host.alias())
}

fn comparison<'a>(key: &'a str, value: &'a str) -> Result<(&'a str, &'a str), String> {
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return Err("comparison needs both a label and a value".to_string());
    }
    if value.contains('=') {
        return Err(format!("malformed comparison '{key}={value}'"));
    }
    Ok((key, value))
}
