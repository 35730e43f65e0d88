//! Handlers registered on the [`crate::Dispatcher`].
//!
//! A handler is either *typed* ([`UpdateHandler`]: receives one
//! [`HandlerKind`] of [`ParsedUpdate`], optionally guarded by a [`Filter`]) or
//! *raw* ([`RawUpdateHandler`]: receives every envelope untranslated).
//!
//! Callbacks tell the dispatcher what to do next by returning a
//! [`DispatchOutcome`]:
//!
//! ```rust,no_run
//! use layer_updates::{DispatchOutcome, UpdateHandler, filters};
//!
//! let echo = UpdateHandler::message(|msg| async move {
//!     println!("{:?} said {:?}", msg.sender, msg.text);
//!     Ok(DispatchOutcome::Handled)
//! })
//! .filter(filters::text() & filters::incoming());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, FutureExt};

use crate::filters::Filter;
use crate::update::{
    BusinessConnection, CallbackQuery, ChatMemberUpdated, DeletedMessages, HandlerKind, Message,
    ParsedUpdate, RawEnvelope, UserStatus,
};

/// Any error a filter or callback may fail with. It is logged and the
/// dispatcher moves on to the next handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<DispatchOutcome, HandlerError>;

/// What the dispatcher should do after a callback ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The update was handled; no later handler sees it.
    Handled,
    /// Pretend this handler did not match and keep looking.
    Skip,
    /// Stop delivering this update, silently.
    Abort,
}

// ─── HandlerId ───────────────────────────────────────────────────────────────

/// Identifies one registration; needed to remove the handler again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── UpdateHandler ───────────────────────────────────────────────────────────

type Callback    = Arc<dyn Fn(ParsedUpdate) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type RawCallback = Arc<dyn Fn(RawEnvelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

macro_rules! typed_constructor {
    ($(#[$doc:meta])* $name:ident => $variant:ident($ty:ty)) => {
        $(#[$doc])*
        pub fn $name<F, Fut>(callback: F) -> Self
        where
            F:   Fn($ty) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = HandlerResult> + Send + 'static,
        {
            Self::new(HandlerKind::$variant, move |update| {
                let fut = match update {
                    ParsedUpdate::$variant(inner) => Some(callback(inner)),
                    _ => None,
                };
                async move {
                    match fut {
                        Some(fut) => fut.await,
                        None      => Ok(DispatchOutcome::Skip),
                    }
                }
            })
        }
    };
}

/// A handler for one kind of parsed update.
#[derive(Clone)]
pub struct UpdateHandler {
    kind:     HandlerKind,
    filter:   Option<Filter>,
    callback: Callback,
}

impl UpdateHandler {
    /// A handler receiving the whole [`ParsedUpdate`] of the given kind.
    pub fn new<F, Fut>(kind: HandlerKind, callback: F) -> Self
    where
        F:   Fn(ParsedUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            kind,
            filter:   None,
            callback: Arc::new(move |update| callback(update).boxed()),
        }
    }

    typed_constructor!(
        /// New messages, including channel posts and business messages.
        message => Message(Message)
    );
    typed_constructor!(edited_message => EditedMessage(Message));
    typed_constructor!(deleted_messages => DeletedMessages(DeletedMessages));
    typed_constructor!(callback_query => CallbackQuery(CallbackQuery));
    typed_constructor!(user_status => UserStatus(UserStatus));
    typed_constructor!(chat_member_updated => ChatMemberUpdated(ChatMemberUpdated));
    typed_constructor!(business_connection => BusinessConnection(BusinessConnection));

    /// Only run the callback when `filter` accepts the update. Setting a
    /// filter twice combines both with `&`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing & filter,
            None           => filter,
        });
        self
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Whether this handler wants `update`. Filter errors propagate.
    pub(crate) fn check(&self, update: &ParsedUpdate) -> Result<bool, HandlerError> {
        if update.kind() != self.kind {
            return Ok(false);
        }
        match &self.filter {
            Some(filter) => filter.check(update),
            None         => Ok(true),
        }
    }

    pub(crate) fn call(&self, update: ParsedUpdate) -> BoxFuture<'static, HandlerResult> {
        (self.callback)(update)
    }
}

impl fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandler")
            .field("kind", &self.kind)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

// ─── RawUpdateHandler ────────────────────────────────────────────────────────

/// A handler that matches every envelope, parsed or not.
#[derive(Clone)]
pub struct RawUpdateHandler {
    callback: RawCallback,
}

impl RawUpdateHandler {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F:   Fn(RawEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self { callback: Arc::new(move |envelope| callback(envelope).boxed()) }
    }

    pub(crate) fn call(&self, envelope: RawEnvelope) -> BoxFuture<'static, HandlerResult> {
        (self.callback)(envelope)
    }
}

impl fmt::Debug for RawUpdateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawUpdateHandler")
    }
}

// ─── Handler ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum Handler {
    Update(UpdateHandler),
    Raw(RawUpdateHandler),
}

impl From<UpdateHandler> for Handler {
    fn from(h: UpdateHandler) -> Self { Self::Update(h) }
}

impl From<RawUpdateHandler> for Handler {
    fn from(h: RawUpdateHandler) -> Self { Self::Raw(h) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw;

    fn status_update() -> ParsedUpdate {
        ParsedUpdate::UserStatus(UserStatus {
            user: crate::update::User {
                id: 1, is_bot: false, first_name: None, last_name: None, username: None,
            },
            status: raw::UserStatus::Recently,
        })
    }

    #[test]
    fn kind_mismatch_never_matches() {
        let h = UpdateHandler::message(|_| async { Ok(DispatchOutcome::Handled) });
        assert!(!h.check(&status_update()).unwrap());
    }

    #[test]
    fn filter_is_applied() {
        let h = UpdateHandler::user_status(|_| async { Ok(DispatchOutcome::Handled) })
            .filter(Filter::new(|u| matches!(u, ParsedUpdate::UserStatus(s) if s.user.id == 2)));
        assert!(!h.check(&status_update()).unwrap());
    }

    #[tokio::test]
    async fn typed_callback_receives_inner_value() {
        let h = UpdateHandler::user_status(|s| async move {
            assert_eq!(s.user.id, 1);
            Ok(DispatchOutcome::Abort)
        });
        assert_eq!(h.call(status_update()).await.unwrap(), DispatchOutcome::Abort);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(HandlerId::next(), HandlerId::next());
    }
}
