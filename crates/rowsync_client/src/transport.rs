//! Transport layer abstraction for sync operations.

use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use rowsync_protocol::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, loopback, mock for testing).
pub trait SyncTransport: Send + Sync {
    /// Performs a handshake with the server.
    fn handshake(&self, request: &HandshakeRequest) -> ClientResult<HandshakeResponse>;

    /// Pulls changes from the server.
    fn pull(&self, request: &PullRequest) -> ClientResult<PullResponse>;

    /// Pushes mutations to the server.
    fn push(&self, request: &PushRequest) -> ClientResult<PushResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> ClientResult<()>;
}

/// A mock transport for testing.
///
/// Pull responses are served from a queue, so a test can script paged
/// pulls; the last queued response is repeated once the queue runs dry.
/// Every push request is recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    handshake_response: Mutex<Option<HandshakeResponse>>,
    pull_responses: Mutex<VecDeque<PullResponse>>,
    push_response: Mutex<Option<PushResponse>>,
    pushed: Mutex<Vec<PushRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the handshake response.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        *self.handshake_response.lock() = Some(response);
    }

    /// Queues a pull response.
    pub fn push_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Sets the push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push requests received so far.
    pub fn pushed(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }

    fn check_connected(&self) -> ClientResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::transport_retryable("not connected"))
        }
    }
}

impl SyncTransport for MockTransport {
    fn handshake(&self, _request: &HandshakeRequest) -> ClientResult<HandshakeResponse> {
        self.check_connected()?;
        self.handshake_response
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Protocol("no mock handshake response set".into()))
    }

    fn pull(&self, _request: &PullRequest) -> ClientResult<PullResponse> {
        self.check_connected()?;
        let mut queue = self.pull_responses.lock();
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| ClientError::Protocol("no mock pull response set".into()))
    }

    fn push(&self, request: &PushRequest) -> ClientResult<PushResponse> {
        self.check_connected()?;
        self.pushed.lock().push(request.clone());
        self.push_response
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Protocol("no mock push response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> ClientResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::TableDelta;

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        let result = transport.handshake(&HandshakeRequest::new("c", "s"));
        assert!(result.unwrap_err().is_retryable());

        transport.set_connected(true);
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn mock_transport_handshake() {
        let transport = MockTransport::new();
        transport.set_handshake_response(HandshakeResponse::success("e1", 0, 0));
        let result = transport
            .handshake(&HandshakeRequest::new("c", "s"))
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn pull_queue_repeats_last() {
        let transport = MockTransport::new();
        let page = |cursor| {
            PullResponse::new("e1", vec![TableDelta::delta("t", vec![], cursor, false)], 0)
        };
        transport.push_pull_response(page(1));
        transport.push_pull_response(page(2));

        let request = PullRequest::new("c", vec![], 10);
        assert_eq!(transport.pull(&request).unwrap().tables[0].cursor, 1);
        assert_eq!(transport.pull(&request).unwrap().tables[0].cursor, 2);
        assert_eq!(transport.pull(&request).unwrap().tables[0].cursor, 2);
    }
}
