//! Cooperative cancellation for in-flight reconciles.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation signal.
///
/// All clones observe the same flag. Once cancelled, a token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  /// Signal cancellation to every clone of this token.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once the token has been cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
      // The sender lives as long as `self`, so this cannot be reached while awaiting.
      std::future::pending::<()>().await;
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}
