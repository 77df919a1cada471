use crate::error::Error;

/// Configuration for the socket layer.
#[derive(Clone)]
pub struct Config {
    /// Number of send contexts in the lookaside pool. One context is held per
    /// in-flight send (a whole batch counts once). Exhaustion surfaces as
    /// [`Error::InsufficientResources`] to the caller.
    pub send_ctx_capacity: usize,
    /// Number of shards for the socket-table read sections. Must be a power
    /// of two. More shards reduce contention between concurrent senders and
    /// receivers at the cost of a longer grace-period scan.
    pub reader_shards: usize,
    /// How many times a wildcard-port bind is retried when the v6 socket
    /// loses the port race after the v4 socket already bound.
    pub bind_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_ctx_capacity: 1024,
            reader_shards: 32,
            bind_retries: 100,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of
    /// range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.send_ctx_capacity == 0 {
            return Err(Error::Config("send_ctx_capacity must be non-zero"));
        }
        if self.reader_shards == 0 || !self.reader_shards.is_power_of_two() {
            return Err(Error::Config("reader_shards must be a power of two"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.reader_shards = 3;
        assert_eq!(
            config.validate(),
            Err(Error::Config("reader_shards must be a power of two"))
        );

        let mut config = Config::default();
        config.send_ctx_capacity = 0;
        assert!(config.validate().is_err());
    }
}
