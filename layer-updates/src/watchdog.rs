//! Liveness probe for the push channel.
//!
//! Telegram sometimes stops pushing updates to a connection without closing
//! it. When nothing has arrived for a full interval, an `updates.getState`
//! call is usually enough to get the server flushing again.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::Client;
use crate::raw::functions;

pub(crate) async fn run(client: Client, interval: Duration, stop: CancellationToken) {
    tracing::debug!("[layer] Updates watchdog started ({interval:?})");
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let idle = client.last_update_at().elapsed();
        if idle <= interval {
            continue;
        }

        tracing::debug!("[layer] No updates for {idle:?}, requesting state");
        tokio::select! {
            _ = stop.cancelled() => break,
            result = client.invoke(&functions::GetState) => {
                if let Err(e) = result {
                    tracing::warn!("[layer] Watchdog getState failed: {e}");
                }
            }
        }
    }
    tracing::debug!("[layer] Updates watchdog stopped");
}
