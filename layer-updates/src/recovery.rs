//! Catch-up of missed updates with `updates.getDifference` and
//! `updates.getChannelDifference`.
//!
//! Every scope in the state storage is resumed from its stored pts, one page
//! at a time, until the server says the scope is current. Recovered messages
//! and updates are queued exactly like pushed ones.

use std::sync::Arc;

use crate::raw::{self, functions, ChannelMessagesFilter, PeerId};
use crate::storage::StateRecord;
use crate::update::{chat_map, user_map, RawEnvelope};
use crate::{Client, InvocationError};

/// How much a [`Client::recover_gaps`] run queued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Messages re-injected as `updateNewMessage` / `updateNewChannelMessage`.
    pub messages: usize,
    /// Other updates re-injected as they came.
    pub updates:  usize,
}

/// What one difference page tells the loop to do next.
enum Step {
    /// Queue the page, then fetch the next one.
    Continue(raw::DifferencePage),
    /// Queue the page, then stop.
    Last(raw::DifferencePage),
    /// Stop without queuing anything.
    Stop,
}

impl Client {
    /// Fetch everything missed since the stored pts of every known scope.
    ///
    /// A scope stops on an empty or "too long" difference, on a final page,
    /// on a slice that does not advance the pts, after
    /// [`crate::Config::max_difference_pages`] pages, or when the server
    /// rejects the request. The pts reached is written back either way.
    pub async fn recover_gaps(&self) -> Result<RecoveryStats, InvocationError> {
        let states = self.inner.storage.states()?;
        if states.is_empty() {
            tracing::info!("[layer] No update states stored, nothing to recover");
            return Ok(RecoveryStats::default());
        }

        let mut stats = RecoveryStats::default();
        for record in states {
            self.recover_scope(record, &mut stats).await?;
        }

        tracing::info!(
            "[layer] Recovered {} messages and {} updates",
            stats.messages, stats.updates
        );
        Ok(stats)
    }

    async fn recover_scope(&self, record: StateRecord, stats: &mut RecoveryStats) -> Result<(), InvocationError> {
        let scope          = record.scope;
        let mut local_pts  = record.pts;
        let mut local_date = record.date;
        let mut prev_pts   = 0;
        let mut pages      = 0;

        loop {
            if pages >= self.inner.max_difference_pages {
                tracing::warn!(
                    "[layer] Scope {scope}: giving up after {pages} difference pages (pts {local_pts})"
                );
                break;
            }
            pages += 1;

            let step = if scope < 0 {
                self.channel_difference_step(scope, &mut local_pts).await
            } else {
                self.difference_step(scope, &mut local_pts, &mut local_date, &mut prev_pts).await
            };

            let step = match step {
                Ok(step) => step,
                Err(e) if e.is_scope_terminal() => {
                    tracing::warn!("[layer] Scope {scope}: recovery aborted: {e}");
                    break;
                }
                Err(e) => {
                    tracing::warn!("[layer] Scope {scope}: difference failed: {e}");
                    break;
                }
            };

            match step {
                Step::Continue(page) => self.requeue(scope, local_pts, page, stats),
                Step::Last(page) => {
                    self.requeue(scope, local_pts, page, stats);
                    break;
                }
                Step::Stop => break,
            }
        }

        self.inner.storage.set_state(StateRecord::new(scope, local_pts, local_date))?;
        Ok(())
    }

    async fn difference_step(
        &self,
        scope:      PeerId,
        local_pts:  &mut i32,
        local_date: &mut Option<i32>,
        prev_pts:   &mut i32,
    ) -> Result<Step, InvocationError> {
        let diff = self
            .invoke(&functions::GetDifference {
                pts:             *local_pts,
                pts_total_limit: None,
                date:            local_date.unwrap_or(0),
                qts:             0,
            })
            .await?;

        Ok(match diff {
            raw::Difference::Empty { .. } => Step::Stop,
            raw::Difference::TooLong { pts } => {
                tracing::warn!("[layer] Scope {scope}: difference too long (server pts {pts}), not resynced");
                Step::Stop
            }
            raw::Difference::Difference { page, state } => {
                *local_pts = state.pts;
                Step::Last(page)
            }
            raw::Difference::Slice { page, intermediate_state } => {
                *local_pts  = intermediate_state.pts;
                *local_date = Some(intermediate_state.date);
                if *local_pts == *prev_pts {
                    tracing::warn!("[layer] Scope {scope}: difference slice did not advance pts {local_pts}");
                    Step::Stop
                } else {
                    *prev_pts = *local_pts;
                    Step::Continue(page)
                }
            }
        })
    }

    async fn channel_difference_step(&self, scope: PeerId, local_pts: &mut i32) -> Result<Step, InvocationError> {
        let channel = self.inner.invoker.resolve_peer(scope).await?;
        let diff = self
            .invoke(&functions::GetChannelDifference {
                force:  false,
                channel,
                filter: ChannelMessagesFilter::Empty,
                pts:    *local_pts,
                limit:  self.inner.channel_difference_limit,
            })
            .await?;

        Ok(match diff {
            raw::ChannelDifference::Empty { .. } => Step::Stop,
            raw::ChannelDifference::TooLong { dialog_pts, .. } => {
                tracing::warn!(
                    "[layer] Scope {scope}: channel difference too long (dialog pts {dialog_pts}), not resynced"
                );
                Step::Stop
            }
            raw::ChannelDifference::Difference { pts, page, .. } => {
                *local_pts = pts;
                Step::Last(page)
            }
        })
    }

    /// Queue one page. Messages are wrapped with `pts_count = -1`: their
    /// sequence has already been accounted for by the difference itself.
    fn requeue(&self, scope: PeerId, pts: i32, page: raw::DifferencePage, stats: &mut RecoveryStats) {
        let users = Arc::new(user_map(page.users));
        let chats = Arc::new(chat_map(page.chats));

        for message in page.new_messages {
            let update = if scope < 0 {
                raw::Update::NewChannelMessage { message, pts, pts_count: -1 }
            } else {
                raw::Update::NewMessage { message, pts, pts_count: -1 }
            };
            self.enqueue(RawEnvelope::shared(update, &users, &chats));
            stats.messages += 1;
        }
        for update in page.other_updates {
            self.enqueue(RawEnvelope::shared(update, &users, &chats));
            stats.updates += 1;
        }
    }
}
