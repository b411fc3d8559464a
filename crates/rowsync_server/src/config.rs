//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Maximum change-log entries per table in one pull response.
    pub max_pull_batch: u32,
    /// Maximum mutations in one push request.
    pub max_push_batch: u32,
    /// Number of change-log entries kept for incremental pulls. Clients
    /// whose cursor falls behind the retained window get a full snapshot.
    pub change_log_retention: usize,
    /// Capacity of the post-commit side-task queue.
    pub task_queue_capacity: usize,
    /// Whether requests without a credential are rejected.
    pub require_auth: bool,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            request_timeout: Duration::from_secs(30),
            max_pull_batch: 500,
            max_push_batch: 100,
            change_log_retention: 10_000,
            task_queue_capacity: 1024,
            require_auth: false,
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the change-log retention.
    pub fn with_change_log_retention(mut self, entries: usize) -> Self {
        self.change_log_retention = entries;
        self
    }

    /// Sets the side-task queue capacity.
    pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
        self.task_queue_capacity = capacity;
        self
    }

    /// Rejects anonymous requests.
    pub fn with_required_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
