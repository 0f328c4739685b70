//! In-memory adapter backed by a scriptable fake server.
//!
//! Useful for tests and embedders that replicate in-process. The "server"
//! side is plain state: set its authoritative `(value, version)`, feed
//! updates through [`MemoryAdapter::emit`], and inspect what was pushed.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::adapter::{AdapterError, SharedStateAdapter};
use super::document::{
    ChangeRef, OptimisticUpdate, ResyncResponse, ServerUpdate, SharedStateDocument, Version,
    NEVER_SYNCED,
};

struct MemoryState {
    server_value: Value,
    server_version: Version,
    confirmed_refs: Vec<ChangeRef>,
    persisted: Option<SharedStateDocument>,
    pushed: Vec<OptimisticUpdate>,
    fail_pushes: bool,
    fail_resyncs: usize,
}

/// Adapter over an in-process fake server.
pub struct MemoryAdapter {
    state: StdMutex<MemoryState>,
    sender: mpsc::UnboundedSender<ServerUpdate>,
    receiver: StdMutex<Option<mpsc::UnboundedReceiver<ServerUpdate>>>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: StdMutex::new(MemoryState {
                server_value: Value::Null,
                server_version: NEVER_SYNCED,
                confirmed_refs: Vec::new(),
                persisted: None,
                pushed: Vec::new(),
                fail_pushes: false,
                fail_resyncs: 0,
            }),
            sender,
            receiver: StdMutex::new(Some(receiver)),
        }
    }

    /// Delivers a server update to the subscribed manager.
    pub fn emit(&self, update: ServerUpdate) {
        let _ = self.sender.send(update);
    }

    /// Sets the authoritative state returned by the next resync.
    pub fn set_server_state(&self, value: Value, version: Version) {
        let mut state = self.state.lock().unwrap();
        state.server_value = value;
        state.server_version = version;
    }

    /// Marks change refs as folded into the server state, so the next
    /// resync reports them confirmed.
    pub fn confirm_refs(&self, refs: impl IntoIterator<Item = ChangeRef>) {
        self.state.lock().unwrap().confirmed_refs.extend(refs);
    }

    /// Seeds the locally persisted snapshot.
    pub fn set_persisted(&self, document: SharedStateDocument) {
        self.state.lock().unwrap().persisted = Some(document);
    }

    /// All updates pushed so far.
    pub fn pushed(&self) -> Vec<OptimisticUpdate> {
        self.state.lock().unwrap().pushed.clone()
    }

    /// Current persisted snapshot.
    pub fn persisted(&self) -> Option<SharedStateDocument> {
        self.state.lock().unwrap().persisted.clone()
    }

    /// Makes every subsequent push fail with a connectivity error.
    pub fn fail_pushes(&self, fail: bool) {
        self.state.lock().unwrap().fail_pushes = fail;
    }

    /// Makes the next `n` resync requests fail.
    pub fn fail_next_resyncs(&self, n: usize) {
        self.state.lock().unwrap().fail_resyncs = n;
    }
}

#[async_trait]
impl SharedStateAdapter for MemoryAdapter {
    async fn join(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn push(&self, update: OptimisticUpdate) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pushes {
            return Err(AdapterError::Connectivity("push refused".into()));
        }
        state.pushed.push(update);
        Ok(())
    }

    async fn resync_request(&self, _last_known: Version) -> Result<ResyncResponse, AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_resyncs > 0 {
            state.fail_resyncs -= 1;
            return Err(AdapterError::Connectivity("resync refused".into()));
        }
        Ok(ResyncResponse {
            version: state.server_version,
            data: state.server_value.clone(),
            change_refs: state.confirmed_refs.clone(),
        })
    }

    async fn ensure_connected(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<ServerUpdate>> {
        self.receiver.lock().unwrap().take()
    }

    async fn get_document(&self) -> Result<Option<SharedStateDocument>, AdapterError> {
        Ok(self.state.lock().unwrap().persisted.clone())
    }

    async fn save_document(&self, value: &Value, version: Version) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        let document = state.persisted.get_or_insert_with(SharedStateDocument::default);
        document.value = value.clone();
        document.version = version;
        Ok(())
    }

    async fn save_optimistic_updates(
        &self,
        updates: &[OptimisticUpdate],
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        let document = state.persisted.get_or_insert_with(SharedStateDocument::default);
        document.optimistic_updates = updates.to_vec();
        Ok(())
    }
}
