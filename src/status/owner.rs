//! Single-writer owner task for [`AgentState`]
//!
//! Concurrent handlers submit [`StatusIntent`]s through a [`StatusHandle`];
//! the owner applies them one at a time and publishes an immutable snapshot
//! that readers observe through a [`StatusView`].

use super::state::{AgentState, StatusIntent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const INTENT_CHANNEL_CAPACITY: usize = 256;

/// Read-only view of the latest agent state
#[derive(Debug, Clone)]
pub struct StatusView {
    rx: watch::Receiver<Arc<AgentState>>,
}

impl StatusView {
    /// Latest applied state
    pub fn snapshot(&self) -> Arc<AgentState> {
        self.rx.borrow().clone()
    }

    /// Wait for the next applied intent; false once the owner has stopped
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Cloneable handle used to submit intents
#[derive(Debug, Clone)]
pub struct StatusHandle {
    tx: mpsc::Sender<StatusIntent>,
    view: StatusView,
}

impl StatusHandle {
    /// Queue an intent for the owner
    pub async fn submit(&self, intent: StatusIntent) {
        if let Err(e) = self.tx.send(intent).await {
            warn!(intent = ?e.0, "Status owner stopped - intent dropped");
        }
    }

    pub async fn submit_all(&self, intents: impl IntoIterator<Item = StatusIntent>) {
        for intent in intents {
            self.submit(intent).await;
        }
    }

    pub fn view(&self) -> StatusView {
        self.view.clone()
    }
}

/// Spawns the owner task
pub struct StatusOwner;

impl StatusOwner {
    /// Start owning `state`; the task ends when every handle is dropped
    pub fn spawn(state: AgentState) -> (StatusHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(Arc::new(state));

        let handle = tokio::spawn(async move {
            while let Some(intent) = rx.recv().await {
                debug!(?intent, "Applying status intent");
                state_tx.send_modify(|current| Arc::make_mut(current).apply(intent));
            }
            debug!("Status owner stopped");
        });

        (
            StatusHandle {
                tx,
                view: StatusView { rx: state_rx },
            },
            handle,
        )
    }
}
