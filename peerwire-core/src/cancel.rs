//! Cooperative cancellation.
//!
//! [`CancellationToken`] is both the controller and the signal: any clone can
//! cancel it, and every clone observes the first reason it was cancelled
//! with. Observers subscribe by awaiting [`CancellationToken::cancelled`];
//! dropping that future unsubscribes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::PeerError;

/// A cloneable, observable "please stop" signal carrying a reason.
#[derive(Clone)]
pub struct CancellationToken {
    reason: Arc<watch::Sender<Option<PeerError>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            reason: Arc::new(tx),
        }
    }

    /// Cancel with `reason`.
    ///
    /// Only the first call has an effect; returns whether it was this one.
    pub fn cancel(&self, reason: PeerError) -> bool {
        self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason.borrow().is_some()
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<PeerError> {
        self.reason.borrow().clone()
    }

    /// Wait until the token is cancelled and return the reason.
    ///
    /// Resolves immediately when already cancelled.
    pub async fn cancelled(&self) -> PeerError {
        let mut rx = self.reason.subscribe();
        if let Ok(reason) = rx.wait_for(Option::is_some).await {
            if let Some(reason) = reason.as_ref() {
                return reason.clone();
            }
        }
        // The sender lives as long as `self`, so the channel cannot close.
        std::future::pending().await
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &*self.reason.borrow())
            .finish()
    }
}
