//! Engine-wide configuration.

/// Default ceiling on cached query lists.
pub const DEFAULT_MAX_ROWS: usize = 50_000;

/// Configuration for an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on cached query lists unless a query overrides it.
    pub default_max_rows: usize,
    /// Capacity of local cache pools registered without one.
    pub local_cache_capacity: usize,
    /// Remote cache pool carrying deferred queues and dirty streams.
    pub queue_pool: String,
    /// List name used by lazy flush.
    pub lazy_queue: String,
    /// List name used by cache-ahead flush.
    pub cache_ahead_queue: String,
    /// Prefix of the stream each dirty channel publishes to.
    pub dirty_stream_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_rows: DEFAULT_MAX_ROWS,
            local_cache_capacity: 100_000,
            queue_pool: "default".to_string(),
            lazy_queue: "tierdb:lazy".to_string(),
            cache_ahead_queue: "tierdb:cache_ahead".to_string(),
            dirty_stream_prefix: "tierdb:dirty:".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_max_rows(mut self, ceiling: usize) -> Self {
        self.default_max_rows = ceiling;
        self
    }

    pub fn local_cache_capacity(mut self, capacity: usize) -> Self {
        self.local_cache_capacity = capacity;
        self
    }

    pub fn queue_pool(mut self, pool: impl Into<String>) -> Self {
        self.queue_pool = pool.into();
        self
    }

    pub fn lazy_queue(mut self, name: impl Into<String>) -> Self {
        self.lazy_queue = name.into();
        self
    }

    pub fn cache_ahead_queue(mut self, name: impl Into<String>) -> Self {
        self.cache_ahead_queue = name.into();
        self
    }

    pub fn dirty_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dirty_stream_prefix = prefix.into();
        self
    }

    /// Stream a dirty channel publishes to.
    pub fn dirty_stream(&self, channel: &str) -> String {
        format!("{}{}", self.dirty_stream_prefix, channel)
    }

    /// Dead-letter list for a queue.
    pub fn failed_queue(queue: &str) -> String {
        format!("{}:failed", queue)
    }
}
