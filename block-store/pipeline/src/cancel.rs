use tokio::sync::watch;

/// Raises the cancellation observed by every [`CancelSignal`] cloned from
/// the same pair. Dropping the handle cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once cancellation has been raised. Safe to use as a
    /// `tokio::select!` branch at any suspension point.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // An error means the handle is gone, which counts as cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}
