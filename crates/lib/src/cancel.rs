//! Build cancellation.
//!
//! A single `CancelToken` is threaded through marshaling, solving and exporting.
//! Deadlines are modeled as a linked token that fires on its own after a timeout,
//! so expiry and explicit cancellation look the same to every consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx: Arc::new(tx), rx }
  }

  /// Signal cancellation to every clone of this token.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }

  /// Create a token that is cancelled when `self` is, or when `timeout` elapses.
  ///
  /// Cancelling the returned token does not cancel `self`. Must be called from
  /// within a tokio runtime.
  pub fn with_timeout(&self, timeout: Option<Duration>) -> CancelToken {
    let child = CancelToken::new();
    let tx = child.tx.clone();
    let parent = self.clone();

    tokio::spawn(async move {
      let deadline = async {
        match timeout {
          Some(timeout) => tokio::time::sleep(timeout).await,
          None => std::future::pending::<()>().await,
        }
      };

      tokio::select! {
        _ = parent.cancelled() => {
          tx.send_replace(true);
        }
        _ = deadline => {
          debug!(?timeout, "build deadline expired");
          tx.send_replace(true);
        }
        _ = tx.closed() => {}
      }
    });

    child
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}
