//! Hands finished rounds to downstream collaborators.
//!
//! Statistics and leaderboards live outside this process; for now the
//! standings are emitted as structured log records.

use marble_core::round::{RoundEvent, RoundResults};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn report_results(mut events: broadcast::Receiver<RoundEvent>) {
    loop {
        match events.recv().await {
            Ok(RoundEvent::Finished(results)) => report(&results),
            Ok(RoundEvent::Reset { round }) => info!(round, "new round open for entries"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "results reporter lagged behind round events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("round events channel closed; results reporter exiting");
                break;
            }
        }
    }
}

fn report(results: &RoundResults) {
    let winner = results.finish_order.first().and_then(|first| {
        results
            .participants
            .iter()
            .find(|entry| entry.id == first.entity_id)
    });

    match serde_json::to_string(&results.finish_order) {
        Ok(standings) => info!(
            round = results.round,
            aborted = results.aborted,
            participants = results.participants.len(),
            winner = winner.map(|entry| entry.display_name.as_str()),
            standings = %standings,
            "round results"
        ),
        Err(err) => warn!(round = results.round, error = %err, "failed to serialize results"),
    }
}
