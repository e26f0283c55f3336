//! Expression evaluation for event names, conditions and timer definitions.
//!
//! Expressions use `${...}` placeholders. A placeholder spanning the whole
//! expression yields the raw JSON result; placeholders embedded in text are
//! interpolated as strings. Text without placeholders is a literal.

use crate::CoreError;
use serde_json::Value;

/// Evaluates expressions against a JSON variable context
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate an expression to a JSON value
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, CoreError>;

    /// Evaluate an expression that must produce a non-null string
    fn evaluate_to_string(&self, expression: &str, variables: &Value) -> Result<String, CoreError> {
        match self.evaluate(expression, variables)? {
            Value::String(s) => Ok(s),
            Value::Null => Err(CoreError::ExpressionError(format!(
                "Expression '{}' evaluated to null",
                expression
            ))),
            other => Ok(other.to_string()),
        }
    }

    /// Evaluate an expression as a boolean condition; null is false
    fn evaluate_condition(&self, expression: &str, variables: &Value) -> Result<bool, CoreError> {
        match self.evaluate(expression, variables)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(CoreError::ExpressionError(format!(
                "Condition '{}' did not evaluate to a boolean: {}",
                expression, other
            ))),
        }
    }
}

/// Default evaluator backed by JMESPath
#[derive(Debug, Default, Clone, Copy)]
pub struct JmesPathExpressionEvaluator;

impl JmesPathExpressionEvaluator {
    /// Create a new evaluator
    pub fn new() -> Self {
        Self
    }

    fn search(&self, path: &str, variables: &Value) -> Result<Value, CoreError> {
        let compiled = jmespath::compile(path.trim()).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        let result = compiled.search(variables).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        Ok(serde_json::to_value(&*result)?)
    }
}

impl ExpressionEvaluator for JmesPathExpressionEvaluator {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, CoreError> {
        let segments = split_placeholders(expression)?;

        match segments.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Segment::Placeholder(path)] => self.search(path, variables),
            _ => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Placeholder(path) => match self.search(path, variables)? {
                            Value::Null => {
                                return Err(CoreError::ExpressionError(format!(
                                    "Cannot resolve identifier '{}'",
                                    path.trim()
                                )))
                            }
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn split_placeholders(expression: &str) -> Result<Vec<Segment<'_>>, CoreError> {
    let mut segments = Vec::new();
    let mut rest = expression;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            CoreError::ExpressionError(format!("Unterminated placeholder in '{}'", expression))
        })?;
        segments.push(Segment::Placeholder(&after[..end]));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    Ok(segments)
}
