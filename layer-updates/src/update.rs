//! High-level update types delivered to typed handlers.
//!
//! Every queued envelope whose update has a parser is turned into one
//! [`ParsedUpdate`]; the variant decides which [`HandlerKind`] may receive it.
//! Updates without a parser are only seen by raw handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::cache::Cache;
use crate::raw::{self, Peer, PeerId};

// ─── RawEnvelope ─────────────────────────────────────────────────────────────

/// One queued update together with the users and chats that arrived with it.
#[derive(Clone, Debug)]
pub struct RawEnvelope {
    pub update: raw::Update,
    pub users:  Arc<HashMap<i64, raw::User>>,
    pub chats:  Arc<HashMap<i64, raw::Chat>>,
}

impl RawEnvelope {
    pub fn new(
        update: raw::Update,
        users:  HashMap<i64, raw::User>,
        chats:  HashMap<i64, raw::Chat>,
    ) -> Self {
        Self { update, users: Arc::new(users), chats: Arc::new(chats) }
    }

    /// An envelope with no accompanying peers.
    pub fn bare(update: raw::Update) -> Self {
        Self::new(update, HashMap::new(), HashMap::new())
    }

    /// Share already-built peer maps between the envelopes of one batch.
    pub fn shared(
        update: raw::Update,
        users:  &Arc<HashMap<i64, raw::User>>,
        chats:  &Arc<HashMap<i64, raw::Chat>>,
    ) -> Self {
        Self { update, users: Arc::clone(users), chats: Arc::clone(chats) }
    }
}

pub(crate) fn user_map(users: Vec<raw::User>) -> HashMap<i64, raw::User> {
    users.into_iter().map(|u| (u.id, u)).collect()
}

pub(crate) fn chat_map(chats: Vec<raw::Chat>) -> HashMap<i64, raw::Chat> {
    chats.into_iter().map(|c| (c.id(), c)).collect()
}

// ─── User / Chat ─────────────────────────────────────────────────────────────

/// A user as seen in an update. Only `id` is guaranteed; the rest is filled
/// in when the user came along with the update.
#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id:         i64,
    pub is_bot:     bool,
    pub first_name: Option<String>,
    pub last_name:  Option<String>,
    pub username:   Option<String>,
}

impl User {
    fn resolve(id: i64, users: &HashMap<i64, raw::User>) -> Self {
        match users.get(&id) {
            Some(u) => Self {
                id,
                is_bot:     u.bot,
                first_name: u.first_name.clone(),
                last_name:  u.last_name.clone(),
                username:   u.username.clone(),
            },
            None => Self { id, is_bot: false, first_name: None, last_name: None, username: None },
        }
    }

    /// First and last name joined, or the username.
    pub fn full_name(&self) -> Option<String> {
        let first = self.first_name.as_deref().unwrap_or("");
        let last  = self.last_name.as_deref().unwrap_or("");
        let name  = format!("{first} {last}").trim().to_string();
        if name.is_empty() { self.username.clone() } else { Some(name) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chat {
    /// Marked id of the chat.
    pub id:       PeerId,
    pub kind:     ChatKind,
    pub title:    Option<String>,
    pub username: Option<String>,
}

impl Chat {
    fn resolve(
        peer:  Peer,
        users: &HashMap<i64, raw::User>,
        chats: &HashMap<i64, raw::Chat>,
    ) -> Self {
        let id = peer.marked_id();
        match peer {
            Peer::User(uid) => {
                let user = User::resolve(uid, users);
                Self { id, kind: ChatKind::Private, title: user.full_name(), username: user.username }
            }
            Peer::Chat(cid) | Peer::Channel(cid) => match chats.get(&cid) {
                Some(raw::Chat::Channel { megagroup, title, username, .. }) => Self {
                    id,
                    kind:     if *megagroup { ChatKind::Supergroup } else { ChatKind::Channel },
                    title:    Some(title.clone()),
                    username: username.clone(),
                },
                Some(chat) => Self {
                    id, kind: ChatKind::Group, title: Some(chat.title().to_string()), username: None,
                },
                None => Self {
                    id,
                    kind:     if matches!(peer, Peer::Channel(_)) { ChatKind::Channel } else { ChatKind::Group },
                    title:    None,
                    username: None,
                },
            },
        }
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// A new or edited message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id:        i32,
    pub chat:      Chat,
    /// `None` for channel posts and empty messages.
    pub sender:    Option<User>,
    pub date:      Option<DateTime<Utc>>,
    pub edit_date: Option<DateTime<Utc>>,
    /// The message text (or caption), `None` if empty.
    pub text:      Option<String>,
    pub outgoing:  bool,
    /// Set for messages received on behalf of a business account.
    pub business_connection_id: Option<String>,
    /// The underlying raw message.
    pub raw:       raw::Message,
}

impl Message {
    fn parse(
        msg:   &raw::Message,
        users: &HashMap<i64, raw::User>,
        chats: &HashMap<i64, raw::Chat>,
    ) -> Option<Self> {
        match msg {
            raw::Message::Message(m) => Some(Self {
                id:        m.id,
                chat:      Chat::resolve(m.peer_id, users, chats),
                sender:    match (m.from_id, m.peer_id) {
                    (Some(Peer::User(uid)), _)        => Some(User::resolve(uid, users)),
                    // Incoming private messages omit `from_id`.
                    (None, Peer::User(uid)) if !m.out => Some(User::resolve(uid, users)),
                    _                                 => None,
                },
                date:      timestamp(m.date),
                edit_date: m.edit_date.and_then(timestamp),
                text:      if m.message.is_empty() { None } else { Some(m.message.clone()) },
                outgoing:  m.out,
                business_connection_id: None,
                raw:       msg.clone(),
            }),
            raw::Message::Empty { peer_id: Some(peer), id } => Some(Self {
                id:        *id,
                chat:      Chat::resolve(*peer, users, chats),
                sender:    None,
                date:      None,
                edit_date: None,
                text:      None,
                outgoing:  false,
                business_connection_id: None,
                raw:       msg.clone(),
            }),
            raw::Message::Empty { peer_id: None, .. } => None,
        }
    }

    /// `true` if the message is a bot command (starts with `/`).
    pub fn is_command(&self) -> bool {
        self.text.as_deref().is_some_and(|t| t.starts_with('/'))
    }

    /// The command name without the leading `/` and any `@botname` suffix.
    pub fn command(&self) -> Option<&str> {
        let text = self.text.as_deref()?.strip_prefix('/')?;
        let word = text.split_whitespace().next()?;
        Some(word.split('@').next().unwrap_or(word))
    }
}

fn timestamp(secs: i32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::from(secs), 0)
}

// ─── DeletedMessages ─────────────────────────────────────────────────────────

/// One or more messages were deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct DeletedMessages {
    /// Marked id of the channel, if the deletion happened in one. Telegram
    /// does not say which chat private and basic-group deletions came from.
    pub chat_id:     Option<PeerId>,
    pub message_ids: Vec<i32>,
    /// The deleted messages that were still in the message cache.
    pub cached:      Vec<Message>,
}

// ─── CallbackQuery ───────────────────────────────────────────────────────────

/// A user pressed an inline keyboard button on a bot message.
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackQuery {
    pub id:            i64,
    pub from:          User,
    pub chat_id:       PeerId,
    pub message_id:    i32,
    /// The message the button belongs to, if it is still cached.
    pub message:       Option<Message>,
    pub chat_instance: i64,
    /// Raw `data` bytes from the button.
    pub data_raw:      Option<Vec<u8>>,
}

impl CallbackQuery {
    /// Button data as a UTF-8 string, if valid.
    pub fn data(&self) -> Option<&str> {
        self.data_raw.as_ref().and_then(|d| std::str::from_utf8(d).ok())
    }
}

// ─── UserStatus / ChatMemberUpdated / BusinessConnection ────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct UserStatus {
    pub user:   User,
    pub status: raw::UserStatus,
}

/// A member joined, left, was promoted, banned, …
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMemberUpdated {
    pub chat:       Chat,
    pub from_user:  User,
    pub user:       User,
    pub date:       Option<DateTime<Utc>>,
    pub old_role:   Option<raw::ParticipantRole>,
    pub new_role:   Option<raw::ParticipantRole>,
}

/// A business account connected the bot (or changed/removed the connection).
#[derive(Clone, Debug, PartialEq)]
pub struct BusinessConnection {
    pub id:        String,
    pub user:      User,
    pub dc_id:     i32,
    pub date:      Option<DateTime<Utc>>,
    pub can_reply: bool,
    pub enabled:   bool,
}

// ─── ParsedUpdate / HandlerKind ──────────────────────────────────────────────

/// Which typed handler may receive a parsed update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Message,
    EditedMessage,
    DeletedMessages,
    CallbackQuery,
    UserStatus,
    ChatMemberUpdated,
    BusinessConnection,
}

/// A raw update translated into its high-level form.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedUpdate {
    Message(Message),
    EditedMessage(Message),
    DeletedMessages(DeletedMessages),
    CallbackQuery(CallbackQuery),
    UserStatus(UserStatus),
    ChatMemberUpdated(ChatMemberUpdated),
    BusinessConnection(BusinessConnection),
}

impl ParsedUpdate {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Message(_)            => HandlerKind::Message,
            Self::EditedMessage(_)      => HandlerKind::EditedMessage,
            Self::DeletedMessages(_)    => HandlerKind::DeletedMessages,
            Self::CallbackQuery(_)      => HandlerKind::CallbackQuery,
            Self::UserStatus(_)         => HandlerKind::UserStatus,
            Self::ChatMemberUpdated(_)  => HandlerKind::ChatMemberUpdated,
            Self::BusinessConnection(_) => HandlerKind::BusinessConnection,
        }
    }

    /// The message carried by `Message` / `EditedMessage` updates, or the
    /// source message of a callback query.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Message(m) | Self::EditedMessage(m) => Some(m),
            Self::CallbackQuery(q) => q.message.as_ref(),
            _ => None,
        }
    }
}

// ─── Caches ──────────────────────────────────────────────────────────────────

/// Recently seen messages and business connections, shared by every worker.
pub(crate) struct Caches {
    messages: Mutex<Cache<(PeerId, i32), Message>>,
    business: Mutex<Cache<String, BusinessConnection>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Caches {
    pub(crate) fn new(message_capacity: usize, business_capacity: usize) -> Self {
        Self {
            messages: Mutex::new(Cache::new(message_capacity)),
            business: Mutex::new(Cache::new(business_capacity)),
        }
    }

    pub(crate) fn message(&self, chat_id: PeerId, message_id: i32) -> Option<Message> {
        lock(&self.messages).get(&(chat_id, message_id))
    }

    pub(crate) fn business_connection(&self, id: &str) -> Option<BusinessConnection> {
        lock(&self.business).get(&id.to_string())
    }

    fn store_message(&self, message: &Message) {
        lock(&self.messages).set((message.chat.id, message.id), message.clone());
    }
}

// ─── Parser ──────────────────────────────────────────────────────────────────

/// Translates raw envelopes into [`ParsedUpdate`]s, feeding the caches.
pub(crate) struct UpdateParser {
    caches: Arc<Caches>,
}

impl UpdateParser {
    pub(crate) fn new(caches: Arc<Caches>) -> Self {
        Self { caches }
    }

    /// `None` if this kind of update has no parser (or could not be parsed).
    pub(crate) fn parse(&self, envelope: &RawEnvelope) -> Option<ParsedUpdate> {
        use raw::Update as U;

        let users = envelope.users.as_ref();
        let chats = envelope.chats.as_ref();

        match &envelope.update {
            U::NewMessage { message, .. } | U::NewChannelMessage { message, .. } => {
                let m = Message::parse(message, users, chats)?;
                self.caches.store_message(&m);
                Some(ParsedUpdate::Message(m))
            }
            U::EditMessage { message, .. } | U::EditChannelMessage { message, .. } => {
                let m = Message::parse(message, users, chats)?;
                self.caches.store_message(&m);
                Some(ParsedUpdate::EditedMessage(m))
            }
            U::BotNewBusinessMessage { connection_id, message, .. } => {
                let mut m = Message::parse(message, users, chats)?;
                m.business_connection_id = Some(connection_id.clone());
                self.caches.store_message(&m);
                Some(ParsedUpdate::Message(m))
            }
            U::DeleteMessages { messages, .. } => Some(ParsedUpdate::DeletedMessages(DeletedMessages {
                chat_id:     None,
                message_ids: messages.clone(),
                cached:      Vec::new(),
            })),
            U::DeleteChannelMessages { channel_id, messages, .. } => {
                let chat_id = raw::channel_scope(*channel_id);
                let cached = messages
                    .iter()
                    .filter_map(|id| self.caches.message(chat_id, *id))
                    .collect();
                Some(ParsedUpdate::DeletedMessages(DeletedMessages {
                    chat_id:     Some(chat_id),
                    message_ids: messages.clone(),
                    cached,
                }))
            }
            U::BotCallbackQuery { query_id, user_id, peer, msg_id, chat_instance, data } => {
                let chat_id = peer.marked_id();
                Some(ParsedUpdate::CallbackQuery(CallbackQuery {
                    id:            *query_id,
                    from:          User::resolve(*user_id, users),
                    chat_id,
                    message_id:    *msg_id,
                    message:       self.caches.message(chat_id, *msg_id),
                    chat_instance: *chat_instance,
                    data_raw:      data.clone(),
                }))
            }
            U::UserStatus { user_id, status } => Some(ParsedUpdate::UserStatus(UserStatus {
                user:   User::resolve(*user_id, users),
                status: *status,
            })),
            U::ChatParticipant { chat_id, date, actor_id, user_id, prev_participant, new_participant, .. } => {
                Some(ParsedUpdate::ChatMemberUpdated(ChatMemberUpdated {
                    chat:      Chat::resolve(Peer::Chat(*chat_id), users, chats),
                    from_user: User::resolve(*actor_id, users),
                    user:      User::resolve(*user_id, users),
                    date:      timestamp(*date),
                    old_role:  *prev_participant,
                    new_role:  *new_participant,
                }))
            }
            U::ChannelParticipant { channel_id, date, actor_id, user_id, prev_participant, new_participant, .. } => {
                Some(ParsedUpdate::ChatMemberUpdated(ChatMemberUpdated {
                    chat:      Chat::resolve(Peer::Channel(*channel_id), users, chats),
                    from_user: User::resolve(*actor_id, users),
                    user:      User::resolve(*user_id, users),
                    date:      timestamp(*date),
                    old_role:  *prev_participant,
                    new_role:  *new_participant,
                }))
            }
            U::BotBusinessConnect { connection, .. } => {
                let parsed = BusinessConnection {
                    id:        connection.connection_id.clone(),
                    user:      User::resolve(connection.user_id, users),
                    dc_id:     connection.dc_id,
                    date:      timestamp(connection.date),
                    can_reply: connection.can_reply,
                    enabled:   !connection.disabled,
                };
                lock(&self.caches.business).set(parsed.id.clone(), parsed.clone());
                Some(ParsedUpdate::BusinessConnection(parsed))
            }
            U::ChannelTooLong { .. } | U::Other { .. } => None,
        }
    }
}
