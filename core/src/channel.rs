//! Channel configuration for the stats pipeline

/// Buffer sizes of the queues feeding the stats consumer
///
/// Producers wait when a queue is full, so these bound how far execution
/// units can run ahead of the consumer.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Successful request events (execution units -> stats engine)
    pub success_buffer: usize,

    /// Failed request events (execution units -> stats engine)
    pub failure_buffer: usize,

    /// Transaction outcome events (execution units -> stats engine)
    pub transaction_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            success_buffer: 10_000,
            failure_buffer: 10_000,
            transaction_buffer: 10_000,
        }
    }
}

impl ChannelConfig {
    /// Use the same buffer size for every queue
    pub fn with_buffer(mut self, size: usize) -> Self {
        self.success_buffer = size;
        self.failure_buffer = size;
        self.transaction_buffer = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_default() {
        let config = ChannelConfig::default();
        assert_eq!(config.success_buffer, 10_000);
        assert_eq!(config.failure_buffer, 10_000);
        assert_eq!(config.transaction_buffer, 10_000);
    }

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::default().with_buffer(64);
        assert_eq!(config.success_buffer, 64);
        assert_eq!(config.failure_buffer, 64);
        assert_eq!(config.transaction_buffer, 64);
    }
}
