use tokio::sync::watch;

/// Owner side of the stop signal. Dropping it without calling
/// [`CancelSignal::cancel`] never cancels anything.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

/// Observer side, cloned into every worker and encoder.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_signal, token) = CancelSignal::new();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the signal
    /// was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_reaches_all_tokens() {
        let (signal, token) = CancelSignal::new();
        let mut first = token.clone();
        let mut second = signal.token();
        assert!(!first.is_cancelled());

        signal.cancel();

        first.cancelled().await;
        second.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_signal_does_not_cancel() {
        let (signal, mut token) = CancelSignal::new();
        drop(signal);

        let waited = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(waited.is_err());
        assert!(!token.is_cancelled());
    }
}
