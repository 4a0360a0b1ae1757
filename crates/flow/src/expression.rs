//! Expression resolution and the shared environment
//!
//! The expression language is pluggable through [`ExpressionEvaluator`].
//! [`PathExpressions`] is the default: `${content.output.approved}` style
//! paths over a `{fields, content, properties, environment}` context.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::broker::Message;
use crate::config::EngineConfig;
use crate::error::ExpressionError;

/// Resolves runtime values from expressions
///
/// Implementations must return `Ok(None)` for missing properties and only
/// fail on malformed expressions.
pub trait ExpressionEvaluator: Send + Sync {
    fn resolve(&self, expression: &str, context: &Value) -> Result<Option<Value>, ExpressionError>;
}

/// Default evaluator for `${dotted.path}` expressions
#[derive(Debug, Clone, Copy, Default)]
pub struct PathExpressions;

impl PathExpressions {
    fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
        path.split('.').try_fold(context, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn parse_path(expression: &str, inner: &str) -> Result<String, ExpressionError> {
        let path = inner.trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ExpressionError::Malformed(expression.to_string()));
        }
        Ok(path.to_string())
    }
}

impl ExpressionEvaluator for PathExpressions {
    fn resolve(&self, expression: &str, context: &Value) -> Result<Option<Value>, ExpressionError> {
        if !expression.contains("${") {
            if expression.contains('}') && expression.contains('{') {
                return Err(ExpressionError::Malformed(expression.to_string()));
            }
            return Ok(Some(match expression {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                other => Value::String(other.to_string()),
            }));
        }

        // whole-expression path keeps the resolved value's type
        if let Some(inner) = expression
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            if !inner.contains("${") && !inner.contains('}') {
                let path = Self::parse_path(expression, inner)?;
                return Ok(Self::lookup(context, &path).cloned());
            }
        }

        let mut rendered = String::new();
        let mut rest = expression;
        while let Some(start) = rest.find("${") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ExpressionError::Malformed(expression.to_string()))?;
            let path = Self::parse_path(expression, &after[..end])?;
            match Self::lookup(context, &path) {
                Some(Value::String(s)) => rendered.push_str(s),
                Some(Value::Null) | None => {}
                Some(other) => rendered.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        rendered.push_str(rest);
        Ok(Some(Value::String(rendered)))
    }
}

/// Shared runtime environment handed to every element
#[derive(Clone)]
pub struct Environment {
    pub config: EngineConfig,
    pub variables: Map<String, Value>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("variables", &self.variables)
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Environment {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            variables: Map::new(),
            evaluator: Arc::new(PathExpressions),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Resolve an expression against a message and the environment variables
    pub fn resolve_expression(
        &self,
        expression: &str,
        message: &Message,
    ) -> Result<Option<Value>, ExpressionError> {
        let mut context = message.to_context();
        if let Value::Object(map) = &mut context {
            map.insert(
                "environment".to_string(),
                serde_json::json!({ "variables": self.variables }),
            );
        }
        self.evaluator.resolve(expression, &context)
    }
}

/// Truthiness used by conditions
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Content;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "content": { "id": "task", "output": { "approved": true, "items": [1, 2] } },
            "environment": { "variables": { "user": "ada" } }
        })
    }

    #[test]
    fn test_whole_path_keeps_type() {
        let value = PathExpressions
            .resolve("${content.output.approved}", &context())
            .unwrap();
        assert_eq!(value, Some(json!(true)));

        let item = PathExpressions
            .resolve("${content.output.items.1}", &context())
            .unwrap();
        assert_eq!(item, Some(json!(2)));
    }

    #[test]
    fn test_missing_path_is_none() {
        let value = PathExpressions
            .resolve("${content.output.missing.deeper}", &context())
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_template_interpolation() {
        let value = PathExpressions
            .resolve("hello ${environment.variables.user} from ${content.id}", &context())
            .unwrap();
        assert_eq!(value, Some(json!("hello ada from task")));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(PathExpressions.resolve("${content.id", &context()).is_err());
        assert!(PathExpressions.resolve("${}", &context()).is_err());
        assert!(PathExpressions.resolve("${content..id}", &context()).is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(PathExpressions.resolve("true", &context()).unwrap(), Some(json!(true)));
        assert_eq!(
            PathExpressions.resolve("plain", &context()).unwrap(),
            Some(json!("plain"))
        );
    }

    #[test]
    fn test_environment_resolves_against_message() {
        let environment = Environment::default().with_variable("limit", json!(5));
        let message = Message::new("execute.start", Content::new("task", "bpmn:Task"));
        let value = environment
            .resolve_expression("${environment.variables.limit}", &message)
            .unwrap();
        assert_eq!(value, Some(json!(5)));
        let key = environment
            .resolve_expression("${fields.routingKey}", &message)
            .unwrap();
        assert_eq!(key, Some(json!("execute.start")));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(Some(&json!(1))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!("false"))));
        assert!(!is_truthy(None));
    }
}
