//! Background incremental metrics.

use std::sync::Weak;

use carta_core::{ErrorKind, conversation::ConversationId, store::ConversationStore};
use tokio::{
  sync::{mpsc, oneshot},
  task::JoinHandle,
};
use tracing::{debug, warn};

use crate::carta::{Carta, Inner};

/// Handle to the task started by
/// [`Carta::spawn_metrics_worker`](crate::Carta::spawn_metrics_worker).
///
/// The task ends on [`shutdown`](Self::shutdown) or when this handle is
/// dropped. It also ends once its feed is replaced by a newer worker, or
/// after every [`Carta`] handle is gone.
pub struct MetricsWorker {
  shutdown: oneshot::Sender<()>,
  handle:   JoinHandle<()>,
}

impl MetricsWorker {
  pub(crate) fn spawn<S>(inner: Weak<Inner<S>>, mut feed: mpsc::UnboundedReceiver<ConversationId>) -> Self
  where
    S: ConversationStore + 'static,
  {
    let (shutdown, mut stop) = oneshot::channel();
    let handle = tokio::spawn(async move {
      loop {
        let id = tokio::select! {
          biased;
          _ = &mut stop => break,
          next = feed.recv() => match next {
            Some(id) => id,
            None => break,
          },
        };
        let Some(inner) = inner.upgrade() else { break };
        let carta = Carta { inner };
        match carta.refresh_metrics(&id).await {
          Ok(outcome) if outcome.nodes_updated > 0 => {
            debug!(conversation = %id, nodes = outcome.nodes_updated, "background refresh");
          }
          Ok(_) => {}
          Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(conversation = %id, "conversation vanished before refresh");
          }
          Err(e) => warn!(conversation = %id, error = %e, "background refresh failed"),
        }
      }
      debug!("metrics worker stopped");
    });
    Self { shutdown, handle }
  }

  /// Stop after the refresh in flight, if any, completes.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(());
    if let Err(e) = self.handle.await {
      warn!(error = %e, "metrics worker panicked");
    }
  }
}
