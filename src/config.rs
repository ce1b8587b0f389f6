//! Storage configuration.

/// Configuration for a [`Storage`](crate::Storage) instance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Target disk usage in bytes. Exceeding it triggers a shrink sweep;
    /// 0 disables caching entirely.
    pub maximum_size: u64,

    /// Expected working-set size of the existence filter, in entries.
    /// Oversizing costs memory; undersizing raises the false-positive rate.
    pub filter_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            maximum_size: u64::MAX,
            filter_capacity: 50_000,
        }
    }
}

impl StorageConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target disk usage in bytes.
    pub fn maximum_size(mut self, size: u64) -> Self {
        self.maximum_size = size;
        self
    }

    /// Set the expected working-set size of the existence filter.
    pub fn filter_capacity(mut self, capacity: usize) -> Self {
        self.filter_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.maximum_size, u64::MAX);
        assert_eq!(config.filter_capacity, 50_000);
    }

    #[test]
    fn test_builder() {
        let config = StorageConfig::new()
            .maximum_size(64 * 1024 * 1024)
            .filter_capacity(10_000);
        assert_eq!(config.maximum_size, 64 * 1024 * 1024);
        assert_eq!(config.filter_capacity, 10_000);
    }
}
