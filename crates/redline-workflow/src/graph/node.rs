use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use redline_core::error::Result;

use super::state::WorkflowState;

/// The callable part of a node: takes a read view, returns a partial update.
pub trait NodeBody<S: WorkflowState>: Send + Sync + 'static {
    fn run(&self, state: S) -> BoxFuture<'_, Result<S::Update>>;
}

impl<S, F, Fut> NodeBody<S> for F
where
    S: WorkflowState,
    F: Fn(S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S::Update>> + Send + 'static,
{
    fn run(&self, state: S) -> BoxFuture<'_, Result<S::Update>> {
        Box::pin(self(state))
    }
}

/// A named unit of work in a graph.
///
/// `reads` restricts the view the body receives (empty = whole state).
/// `writes` restricts the fields its update may touch (empty = unrestricted).
pub struct Node<S: WorkflowState> {
    pub name: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    /// Overrides the executor's per-node timeout.
    pub timeout: Option<Duration>,
    body: Arc<dyn NodeBody<S>>,
}

impl<S: WorkflowState> Node<S> {
    /// Create a node from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S::Update>> + Send + 'static,
    {
        Self::from_body(name, Arc::new(body))
    }

    /// Create a node from a shared body.
    pub fn from_body(name: impl Into<String>, body: Arc<dyn NodeBody<S>>) -> Self {
        Self {
            name: name.into(),
            reads: vec![],
            writes: vec![],
            timeout: None,
            body,
        }
    }

    pub fn with_reads<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.reads = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_writes<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.writes = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the node may write `field`.
    pub fn may_write(&self, field: &str) -> bool {
        self.writes.is_empty()
            || field == super::state::ERROR_FIELD
            || self.writes.iter().any(|w| w == field)
    }

    pub(crate) fn body(&self) -> Arc<dyn NodeBody<S>> {
        self.body.clone()
    }
}

impl<S: WorkflowState> Clone for Node<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            reads: self.reads.clone(),
            writes: self.writes.clone(),
            timeout: self.timeout,
            body: self.body.clone(),
        }
    }
}

impl<S: WorkflowState> fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
