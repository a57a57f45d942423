//! Signals an external caller sends to a running session.
//!
//! [`channel`] returns a [`ControlHandle`] for the caller (CLI, signal
//! handler, test) and a [`ControlReceiver`] for the orchestrator. Resume and
//! budget messages are queued; abort is a sticky flag observed through
//! [`AbortSignal`], so every suspension point can race against it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Answer to a session blocked on a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResumeSignal {
    /// Continue without input: accept the first option of a decision, or
    /// report a human action as done.
    Continue,
    /// Free-form text: the chosen answer or the human's report.
    Input(String),
    /// 1-based option number of a pending decision.
    Select(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Resume(ResumeSignal),
    /// Raise the hard budget ceiling of a paused session.
    RaiseBudget { max_usd: f64 },
}

/// Caller side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
    abort_tx: Arc<watch::Sender<bool>>,
}

impl ControlHandle {
    /// Returns `false` if the session is no longer listening.
    pub fn resume(&self, signal: ResumeSignal) -> bool {
        self.tx.send(ControlMessage::Resume(signal)).is_ok()
    }

    pub fn raise_budget(&self, max_usd: f64) -> bool {
        self.tx.send(ControlMessage::RaiseBudget { max_usd }).is_ok()
    }

    /// Request an abort. Idempotent.
    pub fn abort(&self) {
        self.abort_tx.send_replace(true);
    }

    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.abort_tx.subscribe(),
        }
    }
}

/// Orchestrator side of the control channel.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    abort: AbortSignal,
}

impl ControlReceiver {
    /// Next queued message, or `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ControlMessage> {
        self.rx.try_recv().ok()
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

/// Create a connected handle/receiver pair.
pub fn channel() -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (abort_tx, abort_rx) = watch::channel(false);
    (
        ControlHandle {
            tx,
            abort_tx: Arc::new(abort_tx),
        },
        ControlReceiver {
            rx,
            abort: AbortSignal { rx: abort_rx },
        },
    )
}

/// Observes the abort flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an abort is requested. Pends forever if every handle
    /// was dropped without aborting.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (handle, mut rx) = channel();
        assert!(handle.resume(ResumeSignal::Select(2)));
        assert!(handle.raise_budget(80.0));
        assert_eq!(
            rx.recv().await,
            Some(ControlMessage::Resume(ResumeSignal::Select(2)))
        );
        assert_eq!(
            rx.try_recv(),
            Some(ControlMessage::RaiseBudget { max_usd: 80.0 })
        );
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn abort_is_sticky_and_wakes_waiters() {
        let (handle, rx) = channel();
        let mut signal = rx.abort_signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.is_aborted()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        assert!(waiter.await.unwrap());

        let mut late = handle.abort_signal();
        assert!(late.is_aborted());
        late.cancelled().await;
    }

    #[tokio::test]
    async fn never_signal_does_not_fire() {
        let mut signal = AbortSignal::never();
        assert!(!signal.is_aborted());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn resume_signal_serde() {
        let json = serde_json::to_string(&ResumeSignal::Input("use sqlite".into())).unwrap();
        assert_eq!(json, r#"{"kind":"input","value":"use sqlite"}"#);
        let back: ResumeSignal = serde_json::from_str(r#"{"kind":"continue"}"#).unwrap();
        assert_eq!(back, ResumeSignal::Continue);
    }
}
