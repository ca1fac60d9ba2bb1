//! Configuration for an open log.

use std::time::Duration;

/// Tunables for a [`Log`](crate::Log).
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Upper bound on obtaining one missing ancestor during a join.
    pub fetch_timeout: Duration,
    /// Maximum number of skip-links written into `refs` on append.
    pub reference_count: usize,
    /// Recompute heads from the index and entry DAG when opening.
    pub rebuild_heads_on_open: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            reference_count: 8,
            rebuild_heads_on_open: false,
        }
    }
}

/// Builder for log options.
pub struct LogOptionsBuilder {
    options: LogOptions,
}

impl LogOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: LogOptions::default(),
        }
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.options.fetch_timeout = timeout;
        self
    }

    pub fn reference_count(mut self, count: usize) -> Self {
        self.options.reference_count = count;
        self
    }

    pub fn rebuild_heads_on_open(mut self, enabled: bool) -> Self {
        self.options.rebuild_heads_on_open = enabled;
        self
    }

    pub fn build(self) -> LogOptions {
        self.options
    }
}

impl Default for LogOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = LogOptionsBuilder::new()
            .fetch_timeout(Duration::from_millis(250))
            .reference_count(4)
            .rebuild_heads_on_open(true)
            .build();

        assert_eq!(options.fetch_timeout, Duration::from_millis(250));
        assert_eq!(options.reference_count, 4);
        assert!(options.rebuild_heads_on_open);
    }

    #[test]
    fn test_defaults() {
        let options = LogOptions::default();
        assert_eq!(options.fetch_timeout, Duration::from_secs(30));
        assert!(!options.rebuild_heads_on_open);
    }
}
