//! Server confirmation of individual mutations.
//!
//! Every local mutation gets a [`MutationHandle`]. The local effect is
//! visible as soon as `mutate` returns; the handle resolves once the server
//! has applied or rejected the mutation.

use crate::error::{ClientError, ClientResult};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Tracks the server outcome of one mutation.
#[derive(Debug)]
pub struct MutationHandle {
    id: u64,
    receiver: oneshot::Receiver<ClientResult<()>>,
}

impl MutationHandle {
    /// The mutation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the server's verdict.
    ///
    /// Resolves to `Ok` when the server applied the mutation (or had already
    /// processed it), to [`ClientError::Rejected`] when it refused it, and to
    /// [`ClientError::TornDown`] if the client went away first.
    pub async fn server(self) -> ClientResult<()> {
        self.receiver.await.unwrap_or(Err(ClientError::TornDown))
    }

    /// Returns the verdict if it has already arrived.
    pub fn try_result(&mut self) -> Option<ClientResult<()>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::TornDown)),
        }
    }
}

/// Senders of unresolved handles, by mutation id.
#[derive(Debug, Default)]
pub(crate) struct Waiters {
    senders: BTreeMap<u64, oneshot::Sender<ClientResult<()>>>,
}

impl Waiters {
    pub(crate) fn register(&mut self, id: u64) -> MutationHandle {
        let (sender, receiver) = oneshot::channel();
        self.senders.insert(id, sender);
        MutationHandle { id, receiver }
    }

    /// Resolves `id`. No-op if it was resolved already or never registered.
    pub(crate) fn resolve(&mut self, id: u64, result: ClientResult<()>) {
        if let Some(sender) = self.senders.remove(&id) {
            // The caller may have dropped the handle.
            let _ = sender.send(result);
        }
    }

    pub(crate) fn fail_all(&mut self, error: ClientError) {
        for (_, sender) in std::mem::take(&mut self.senders) {
            let _ = sender.send(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
