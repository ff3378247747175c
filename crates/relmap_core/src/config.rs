//! Session configuration.

/// Configuration for opening a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum depth of eager materialization chains.
    ///
    /// Eager relationships are fetched together with their owner; this
    /// bounds how far a chain of eager declarations may recurse before
    /// further relationships are left unloaded.
    pub eager_depth_limit: usize,

    /// Label attached to this session's log events.
    pub label: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            eager_depth_limit: 8,
            label: None,
        }
    }
}

impl SessionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the eager materialization depth limit.
    #[must_use]
    pub const fn eager_depth_limit(mut self, limit: usize) -> Self {
        self.eager_depth_limit = limit;
        self
    }

    /// Sets the session label used in log events.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
