//! Sequence-state bookkeeping for pushed updates.
//!
//! Every update carrying a **pts** advances the stored state of its scope
//! (`0` for the account-wide sequence, the marked channel id for a channel)
//! as soon as its batch arrives. Nothing is checked for gaps here: the
//! stored pts is the resume point [`Client::recover_gaps`] starts from after
//! a restart or reconnect.
//!
//! Two pushes need a round-trip before they can be delivered:
//!
//! * `updateShortMessage` / `updateShortChatMessage` carry no peers, so the
//!   full message is fetched with `updates.getDifference`.
//! * `updateNewChannelMessage` in a batch whose peers are *min* is followed by
//!   a `getChannelDifference` limited to that one message id, to obtain
//!   usable peer records.

use std::collections::HashMap;
use std::sync::Arc;

use crate::raw::{self, functions, ChannelMessagesFilter, MessageRange, Updates};
use crate::storage::{StateRecord, GLOBAL_SCOPE};
use crate::update::{chat_map, user_map, RawEnvelope};
use crate::{Client, InvocationError};

impl Client {
    /// Feed one server push into the pipeline: persist its pts, complete it
    /// if needed, and queue its updates for the handlers.
    pub async fn handle_updates(&self, updates: Updates) -> Result<(), InvocationError> {
        self.touch();

        match updates {
            Updates::Updates(batch) | Updates::Combined(batch) => self.handle_batch(batch).await,

            Updates::ShortMessage(short) | Updates::ShortChatMessage(short) => {
                self.handle_short_message(short).await
            }

            Updates::Short { update, .. } => {
                self.enqueue(RawEnvelope::bare(update));
                Ok(())
            }

            Updates::TooLong => {
                tracing::info!("[layer] updatesTooLong received");
                Ok(())
            }
        }
    }

    /// Failures while persisting or completing peers do not stop the batch:
    /// every update is still queued, and the first error is returned after.
    async fn handle_batch(&self, batch: raw::UpdatesBatch) -> Result<(), InvocationError> {
        let is_min = batch.users.iter().any(|u| u.min) || batch.chats.iter().any(|c| c.is_min());
        let mut users = user_map(batch.users);
        let mut chats = chat_map(batch.chats);
        let mut failure: Option<InvocationError> = None;

        for update in &batch.updates {
            let channel_id = update.channel_id();

            if let Some(info) = update.pts_info() {
                if !self.inner.skip_updates {
                    let scope = channel_id.map(raw::channel_scope).unwrap_or(GLOBAL_SCOPE);
                    if let Err(e) = self.inner.storage.set_state(StateRecord::new(scope, info.pts, Some(batch.date))) {
                        tracing::warn!("[layer] Scope {scope}: failed to store pts {}: {e}", info.pts);
                        failure.get_or_insert(e.into());
                    }
                }
            }

            match update {
                raw::Update::ChannelTooLong { channel_id, pts } => {
                    tracing::info!("[layer] updateChannelTooLong for channel {channel_id} (pts {pts:?})");
                }
                raw::Update::NewChannelMessage { message, pts, pts_count } if is_min && !message.is_empty() => {
                    let Some(channel_id) = channel_id else { continue };
                    let filter = ChannelMessagesFilter::Ranges(vec![MessageRange {
                        min_id: message.id(),
                        max_id: message.id(),
                    }]);
                    match self.fetch_min_peers(channel_id, filter, *pts, *pts_count).await {
                        Ok(Some(page)) => {
                            users.extend(user_map(page.users));
                            chats.extend(chat_map(page.chats));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("[layer] Min peers of channel {channel_id} not completed: {e}");
                            failure.get_or_insert(e);
                        }
                    }
                }
                _ => {}
            }
        }

        let users = Arc::new(users);
        let chats = Arc::new(chats);
        for update in batch.updates {
            self.enqueue(RawEnvelope::shared(update, &users, &chats));
        }
        failure.map_or(Ok(()), Err)
    }

    /// `getChannelDifference` for a single message id. Access errors mean
    /// the peers cannot be completed and are ignored.
    async fn fetch_min_peers(
        &self,
        channel_id: i64,
        filter:     ChannelMessagesFilter,
        pts:        i32,
        pts_count:  i32,
    ) -> Result<Option<raw::DifferencePage>, InvocationError> {
        let channel = self.inner.invoker.resolve_peer(raw::channel_scope(channel_id)).await?;
        let req = functions::GetChannelDifference {
            force: false,
            channel,
            filter,
            pts:   pts - pts_count,
            limit: pts,
        };
        match self.invoke(&req).await {
            Ok(raw::ChannelDifference::Empty { .. }) => Ok(None),
            Ok(raw::ChannelDifference::TooLong { page, .. })
            | Ok(raw::ChannelDifference::Difference { page, .. }) => Ok(Some(page)),
            Err(e) if e.is("CHANNEL_PRIVATE") || e.is("PERSISTENT_TIMESTAMP_*") => {
                tracing::debug!("[layer] cannot complete min peers of channel {channel_id}: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_short_message(&self, short: raw::ShortMessage) -> Result<(), InvocationError> {
        if !self.inner.skip_updates {
            self.inner.storage.set_state(StateRecord::new(GLOBAL_SCOPE, short.pts, Some(short.date)))?;
        }

        let diff = self
            .invoke(&functions::GetDifference {
                pts:             short.pts - short.pts_count,
                pts_total_limit: None,
                date:            short.date,
                qts:             -1,
            })
            .await?;

        let page = match diff {
            raw::Difference::Difference { page, .. } | raw::Difference::Slice { page, .. } => page,
            raw::Difference::Empty { .. } | raw::Difference::TooLong { .. } => {
                tracing::debug!("[layer] short message {} not found in difference", short.id);
                return Ok(());
            }
        };

        let raw::DifferencePage { new_messages, other_updates, users, chats } = page;
        if let Some(message) = new_messages.into_iter().next() {
            let update = raw::Update::NewMessage { message, pts: short.pts, pts_count: short.pts_count };
            self.enqueue(RawEnvelope::new(update, user_map(users), chat_map(chats)));
        } else if let Some(update) = other_updates.into_iter().next() {
            self.enqueue(RawEnvelope::new(update, HashMap::new(), HashMap::new()));
        }
        Ok(())
    }
}
