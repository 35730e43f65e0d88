//! Composable predicates over parsed updates.
//!
//! Filters combine with `&`, `|` and `!`:
//!
//! ```rust
//! use layer_updates::filters;
//!
//! let private_commands = filters::command("start") & !filters::outgoing();
//! let anything_textual = filters::text() | filters::callback_data("ok");
//! # let _ = (private_commands, anything_textual);
//! ```

use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use crate::handler::HandlerError;
use crate::raw::PeerId;
use crate::update::ParsedUpdate;

type Predicate = Arc<dyn Fn(&ParsedUpdate) -> Result<bool, HandlerError> + Send + Sync>;

/// A predicate deciding whether a typed handler runs.
#[derive(Clone)]
pub struct Filter {
    predicate: Predicate,
}

impl Filter {
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&ParsedUpdate) -> bool + Send + Sync + 'static,
    {
        Self { predicate: Arc::new(move |u| Ok(predicate(u))) }
    }

    /// A filter that may fail; the failure is logged by the dispatcher and
    /// the handler is treated as not matching.
    pub fn fallible<P>(predicate: P) -> Self
    where
        P: Fn(&ParsedUpdate) -> Result<bool, HandlerError> + Send + Sync + 'static,
    {
        Self { predicate: Arc::new(predicate) }
    }

    pub fn check(&self, update: &ParsedUpdate) -> Result<bool, HandlerError> {
        (self.predicate)(update)
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        Filter::fallible(move |u| Ok(self.check(u)? && rhs.check(u)?))
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        Filter::fallible(move |u| Ok(self.check(u)? || rhs.check(u)?))
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::fallible(move |u| Ok(!self.check(u)?))
    }
}

/// Messages with non-empty text.
pub fn text() -> Filter {
    Filter::new(|u| u.message().is_some_and(|m| m.text.is_some()))
}

/// Messages that are the bot command `/name` (with or without `@botname`).
pub fn command(name: &str) -> Filter {
    let name = name.to_string();
    Filter::new(move |u| u.message().and_then(|m| m.command()) == Some(name.as_str()))
}

/// Updates concerning the chat with this marked id.
pub fn chat(chat_id: PeerId) -> Filter {
    Filter::new(move |u| match u {
        ParsedUpdate::Message(m) | ParsedUpdate::EditedMessage(m) => m.chat.id == chat_id,
        ParsedUpdate::CallbackQuery(q)     => q.chat_id == chat_id,
        ParsedUpdate::DeletedMessages(d)   => d.chat_id == Some(chat_id),
        ParsedUpdate::ChatMemberUpdated(c) => c.chat.id == chat_id,
        _ => false,
    })
}

/// Messages sent by someone else.
pub fn incoming() -> Filter {
    Filter::new(|u| u.message().is_some_and(|m| !m.outgoing))
}

/// Messages sent by this account.
pub fn outgoing() -> Filter {
    Filter::new(|u| u.message().is_some_and(|m| m.outgoing))
}

/// Callback queries whose button data equals `data`.
pub fn callback_data(data: &str) -> Filter {
    let data = data.to_string();
    Filter::new(move |u| matches!(u, ParsedUpdate::CallbackQuery(q) if q.data() == Some(data.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{self, Peer};
    use crate::update::{Chat, ChatKind, Message};

    fn message(text: &str, outgoing: bool) -> ParsedUpdate {
        ParsedUpdate::Message(Message {
            id:        1,
            chat:      Chat { id: 42, kind: ChatKind::Private, title: None, username: None },
            sender:    None,
            date:      None,
            edit_date: None,
            text:      if text.is_empty() { None } else { Some(text.into()) },
            outgoing,
            business_connection_id: None,
            raw: raw::Message::Empty { id: 1, peer_id: Some(Peer::User(42)) },
        })
    }

    #[test]
    fn stock_filters() {
        assert!(text().check(&message("hi", false)).unwrap());
        assert!(!text().check(&message("", false)).unwrap());
        assert!(command("start").check(&message("/start", false)).unwrap());
        assert!(!command("start").check(&message("/stop", false)).unwrap());
        assert!(chat(42).check(&message("x", true)).unwrap());
        assert!(!chat(7).check(&message("x", true)).unwrap());
    }

    #[test]
    fn combinators() {
        let f = text() & !outgoing();
        assert!(f.check(&message("hi", false)).unwrap());
        assert!(!f.check(&message("hi", true)).unwrap());

        let g = command("a") | command("b");
        assert!(g.check(&message("/b", false)).unwrap());
        assert!(!g.check(&message("/c", false)).unwrap());
    }

    #[test]
    fn errors_short_circuit() {
        let failing = Filter::fallible(|_| Err("boom".into()));
        assert!((failing.clone() & text()).check(&message("hi", false)).is_err());
        // `&` stops at the first `false`.
        assert!(!(outgoing() & failing).check(&message("hi", false)).unwrap());
    }
}
