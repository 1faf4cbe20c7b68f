//! Stream configuration.

/// Options for creating a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Whether work on the stream is ordered against the implicit default stream.
    pub synchronizes_with_default: bool,
    /// Stream priority (lower is higher). `None` uses the runtime default.
    pub priority: Option<i32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            synchronizes_with_default: true,
            priority: None,
        }
    }
}

impl StreamConfig {
    /// A stream that runs independently of the default stream.
    #[must_use]
    pub fn non_blocking() -> Self {
        Self {
            synchronizes_with_default: false,
            priority: None,
        }
    }

    /// A non-blocking stream with an explicit priority.
    #[must_use]
    pub fn with_priority(priority: i32) -> Self {
        Self {
            synchronizes_with_default: false,
            priority: Some(priority),
        }
    }
}

/// Builder for StreamConfig.
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for a non-blocking stream.
    #[must_use]
    pub fn non_blocking() -> Self {
        Self {
            config: StreamConfig::non_blocking(),
        }
    }

    /// Sets whether the stream synchronizes with the default stream.
    #[must_use]
    pub fn with_default_stream_sync(mut self, enabled: bool) -> Self {
        self.config.synchronizes_with_default = enabled;
        self
    }

    /// Sets the stream priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.config.priority = Some(priority);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> StreamConfig {
        self.config
    }
}
