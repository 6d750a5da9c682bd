use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::state::StateMap;

/// Terminal marker usable as an edge target or route.
pub const END: &str = "__end__";

/// Unconditional dependency: `to` is scheduled once `from` completes and its
/// update is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Wait-for-all dependency: `target` is scheduled once every source has
/// completed since the join last fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub sources: Vec<String>,
    pub target: String,
}

/// Where a conditional edge sends the run next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Next(String),
    End,
}

impl Route {
    /// Route to a node by name; `END` maps to `Route::End`.
    pub fn to(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == END {
            Self::End
        } else {
            Self::Next(name)
        }
    }
}

type RouteFn<S> = dyn Fn(&S) -> Route + Send + Sync;

/// A predicate over the post-merge state evaluated right after `from` runs.
pub struct ConditionalEdge<S> {
    pub from: String,
    route: Arc<RouteFn<S>>,
}

impl<S> ConditionalEdge<S> {
    pub fn new<F>(from: impl Into<String>, route: F) -> Self
    where
        F: Fn(&S) -> Route + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            route: Arc::new(route),
        }
    }

    pub fn route(&self, state: &S) -> Route {
        (self.route)(state)
    }
}

impl ConditionalEdge<StateMap> {
    /// Route to `then` when `expr` holds against the state, otherwise to
    /// `otherwise`. See [`evaluate_condition`] for the expression syntax.
    pub fn when(
        from: impl Into<String>,
        expr: impl Into<String>,
        then: impl Into<String>,
        otherwise: impl Into<String>,
    ) -> Self {
        let expr = expr.into();
        let then = then.into();
        let otherwise = otherwise.into();
        Self::new(from, move |state: &StateMap| {
            if evaluate_condition(&expr, state.data()) {
                Route::to(then.clone())
            } else {
                Route::to(otherwise.clone())
            }
        })
    }
}

impl<S> Clone for ConditionalEdge<S> {
    fn clone(&self) -> Self {
        Self {
            from: self.from.clone(),
            route: self.route.clone(),
        }
    }
}

impl<S> fmt::Debug for ConditionalEdge<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

/// Evaluate a simple conditional expression against map data.
///
/// Supported expressions:
/// - `key == "value"`
/// - `key != "value"`
/// - `key contains "substr"`
///
/// Non-string values compare by their JSON rendering, so `iteration == "3"`
/// matches the number 3. Unparseable expressions are `false`.
pub fn evaluate_condition(expr: &str, data: &BTreeMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();
    let lookup = |key: &str| {
        data.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return lookup(key).is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(key).is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(key).is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
