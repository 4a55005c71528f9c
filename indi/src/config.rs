use core::time::Duration;

/// Tuning for a [`Connection`](crate::connection::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Bytes requested per socket read
    pub read_width: usize,
    /// Delay between a lost connection and the next attempt
    pub reconnect_backoff: Duration,
    /// Treat a peer that sends nothing for this long as gone
    pub idle_timeout: Option<Duration>,
    /// Longest the writer waits on an empty queue before re-checking shutdown
    pub write_poll: Duration,
    /// Largest single element the framer will buffer
    pub max_message_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            read_width: 30_000,
            reconnect_backoff: Duration::from_secs(2),
            idle_timeout: None,
            write_poll: Duration::from_millis(500),
            max_message_bytes: 64 << 20,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_width(mut self, bytes: usize) -> Self {
        self.read_width = bytes.max(1);
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_write_poll(mut self, poll: Duration) -> Self {
        self.write_poll = poll;
        self
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }
}
