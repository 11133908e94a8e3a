//! Template rendering for response bodies and headers.
//!
//! Placeholders are written `${ expression }` and are replaced with the
//! text of the evaluated expression.

use crate::context::RequestContext;
use crate::expr::{self, ExpressionEvaluator, QueryEvaluator};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

const OPEN: &str = "${";
const CLOSE: char = '}';

/// Template engine for rendering dynamic responses.
#[derive(Clone)]
pub struct TemplateEngine {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl TemplateEngine {
    /// Create a template engine backed by [`QueryEvaluator`].
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(QueryEvaluator))
    }

    /// Create a template engine backed by a custom evaluator.
    pub fn with_evaluator(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }

    /// Whether all conditions hold for the request.
    pub fn conditions_hold(&self, conditions: &[String], context: &RequestContext) -> bool {
        expr::conditions_hold(self.evaluator.as_ref(), conditions, context)
    }

    /// Render a template string.
    ///
    /// Identical placeholders are evaluated once. A placeholder that fails
    /// to evaluate, or produces no result, renders as an empty string. An
    /// unterminated `${` is copied through unchanged.
    pub fn render(&self, template: &str, context: &RequestContext) -> String {
        if !template.contains(OPEN) {
            return template.to_string();
        }

        let mut rendered: HashMap<&str, String> = HashMap::new();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            let inner_start = start + OPEN.len();
            let Some(len) = rest[inner_start..].find(CLOSE) else {
                break;
            };
            let end = inner_start + len + CLOSE.len_utf8();
            let marker = &rest[start..end];
            let expression = &rest[inner_start..inner_start + len];

            out.push_str(&rest[..start]);
            let text = rendered
                .entry(marker)
                .or_insert_with(|| self.evaluate(expression, context));
            out.push_str(text);
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }

    fn evaluate(&self, expression: &str, context: &RequestContext) -> String {
        match self.evaluator.evaluate(expression.trim(), context) {
            Ok(Some(value)) => expr::to_text(&value),
            Ok(None) => String::new(),
            Err(e) => {
                warn!(expression = %expression.trim(), error = %e, "Template expression failed");
                String::new()
            }
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}
