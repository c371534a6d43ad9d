//! Background worker that persists ended sessions.

use std::sync::Arc;

use tally_core::Session;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::Shared;

/// Work handed to the drain worker.
pub(crate) enum DrainRequest {
    /// Persist a finished session.
    End(Session),
    /// Reply once every earlier request has been persisted.
    Settle(oneshot::Sender<()>),
}

/// Runs until every sender is dropped, then waits for in-flight merges.
///
/// Each end runs as its own blocking task that claims the session from the
/// active map and merges it. The loop itself never takes a lock, so a
/// snapshot holding the map does not stall it.
pub(crate) async fn run(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<DrainRequest>) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(DrainRequest::End(session)) => {
                    let shared = Arc::clone(&shared);
                    in_flight.spawn_blocking(move || {
                        let session = shared.claim(session);
                        shared.persist(session);
                    });
                }
                Some(DrainRequest::Settle(done)) => {
                    wait_all(&mut in_flight).await;
                    // The waiter may have given up; nothing to report then.
                    let _ = done.send(());
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
        }
    }
    wait_all(&mut in_flight).await;
    tracing::debug!("session drain stopped");
}

async fn wait_all(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "session merge task failed");
    }
}
