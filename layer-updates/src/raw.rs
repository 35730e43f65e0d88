//! Raw protocol objects exchanged with the network layer.
//!
//! These mirror the slice of the Telegram TL schema that the update pipeline
//! touches: push containers, the individual updates inside them, the
//! `updates.getDifference` / `updates.getChannelDifference` results and the
//! three functions used to fetch them. They are plain values; framing and
//! (de)serialization belong to whoever implements [`crate::Invoker`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::InvocationError;

/// A "marked" peer id: users are positive, basic groups negative and
/// channels below `-1_000_000_000_000`. Also used as an update-state scope.
pub type PeerId = i64;

/// Offset applied to channel ids to obtain their marked id.
pub const CHANNEL_ID_OFFSET: i64 = -1_000_000_000_000;

// ─── Peers ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Peer {
    User(i64),
    Chat(i64),
    Channel(i64),
}

impl Peer {
    /// The marked id of this peer.
    pub fn marked_id(&self) -> PeerId {
        match *self {
            Peer::User(id)    => id,
            Peer::Chat(id)    => -id,
            Peer::Channel(id) => channel_scope(id),
        }
    }

    pub fn channel_id(&self) -> Option<i64> {
        match *self {
            Peer::Channel(id) => Some(id),
            _                 => None,
        }
    }
}

/// Marked id (and update-state scope) of a channel.
pub fn channel_scope(channel_id: i64) -> PeerId {
    CHANNEL_ID_OFFSET - channel_id
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct User {
    pub id:          i64,
    pub access_hash: Option<i64>,
    /// Seen without a usable access hash; needs to be re-fetched.
    pub min:         bool,
    pub bot:         bool,
    pub first_name:  Option<String>,
    pub last_name:   Option<String>,
    pub username:    Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Chat {
    /// A basic (small) group.
    Group { id: i64, title: String },
    /// A broadcast channel or a supergroup.
    Channel {
        id:          i64,
        access_hash: Option<i64>,
        min:         bool,
        megagroup:   bool,
        title:       String,
        username:    Option<String>,
    },
    /// A chat the account has lost access to.
    Forbidden { id: i64, title: String },
}

impl Chat {
    pub fn id(&self) -> i64 {
        match self {
            Chat::Group { id, .. } | Chat::Channel { id, .. } | Chat::Forbidden { id, .. } => *id,
        }
    }

    /// The peer this chat is addressed as in messages.
    pub fn peer(&self) -> Peer {
        match self {
            Chat::Group { id, .. }     => Peer::Chat(*id),
            Chat::Channel { id, .. }   => Peer::Channel(*id),
            Chat::Forbidden { id, .. } => Peer::Chat(*id),
        }
    }

    pub fn is_min(&self) -> bool {
        matches!(self, Chat::Channel { min: true, .. })
    }

    pub fn title(&self) -> &str {
        match self {
            Chat::Group { title, .. } | Chat::Channel { title, .. } | Chat::Forbidden { title, .. } => title,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Message {
    Message(MessageData),
    Empty { id: i32, peer_id: Option<Peer> },
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MessageData {
    pub id:        i32,
    pub peer_id:   Peer,
    #[cfg_attr(feature = "serde", serde(default))]
    pub from_id:   Option<Peer>,
    pub date:      i32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub message:   String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub out:       bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub edit_date: Option<i32>,
}

impl Message {
    pub fn id(&self) -> i32 {
        match self {
            Message::Message(m)       => m.id,
            Message::Empty { id, .. } => *id,
        }
    }

    pub fn peer_id(&self) -> Option<Peer> {
        match self {
            Message::Message(m)            => Some(m.peer_id),
            Message::Empty { peer_id, .. } => *peer_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Message::Empty { .. })
    }
}

// ─── Updates ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UserStatus {
    Empty,
    Online { expires: i32 },
    Offline { was_online: i32 },
    Recently,
    LastWeek,
    LastMonth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParticipantRole {
    Member,
    Admin,
    Creator,
    Banned,
    Left,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BotBusinessConnection {
    pub connection_id: String,
    pub user_id:       i64,
    pub dc_id:         i32,
    pub date:          i32,
    pub can_reply:     bool,
    pub disabled:      bool,
}

/// A single update, as found inside a push container or a difference.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Update {
    NewMessage { message: Message, pts: i32, pts_count: i32 },
    NewChannelMessage { message: Message, pts: i32, pts_count: i32 },
    EditMessage { message: Message, pts: i32, pts_count: i32 },
    EditChannelMessage { message: Message, pts: i32, pts_count: i32 },
    DeleteMessages { messages: Vec<i32>, pts: i32, pts_count: i32 },
    DeleteChannelMessages { channel_id: i64, messages: Vec<i32>, pts: i32, pts_count: i32 },
    BotCallbackQuery {
        query_id:      i64,
        user_id:       i64,
        peer:          Peer,
        msg_id:        i32,
        chat_instance: i64,
        data:          Option<Vec<u8>>,
    },
    UserStatus { user_id: i64, status: UserStatus },
    ChatParticipant {
        chat_id:          i64,
        date:             i32,
        actor_id:         i64,
        user_id:          i64,
        prev_participant: Option<ParticipantRole>,
        new_participant:  Option<ParticipantRole>,
        qts:              i32,
    },
    ChannelParticipant {
        channel_id:       i64,
        date:             i32,
        actor_id:         i64,
        user_id:          i64,
        prev_participant: Option<ParticipantRole>,
        new_participant:  Option<ParticipantRole>,
        qts:              i32,
    },
    BotBusinessConnect { connection: BotBusinessConnection, qts: i32 },
    BotNewBusinessMessage { connection_id: String, message: Message, qts: i32 },
    /// The channel has too many pending updates to be pushed.
    ChannelTooLong { channel_id: i64, pts: Option<i32> },
    /// Anything the pipeline has no dedicated variant for.
    Other { name: String },
}

/// `pts` and `pts_count` carried by an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtsInfo {
    pub pts:       i32,
    pub pts_count: i32,
}

impl Update {
    /// Sequence information, for the update kinds that advance a `pts`.
    pub fn pts_info(&self) -> Option<PtsInfo> {
        use Update::*;
        match *self {
            NewMessage { pts, pts_count, .. }
            | NewChannelMessage { pts, pts_count, .. }
            | EditMessage { pts, pts_count, .. }
            | EditChannelMessage { pts, pts_count, .. }
            | DeleteMessages { pts, pts_count, .. }
            | DeleteChannelMessages { pts, pts_count, .. } => Some(PtsInfo { pts, pts_count }),
            _ => None,
        }
    }

    /// The channel this update belongs to: the channel of the message's peer
    /// if there is a message, otherwise the update's own `channel_id`.
    pub fn channel_id(&self) -> Option<i64> {
        use Update::*;
        let from_message = match self {
            NewMessage { message, .. }
            | NewChannelMessage { message, .. }
            | EditMessage { message, .. }
            | EditChannelMessage { message, .. }
            | BotNewBusinessMessage { message, .. } => message.peer_id().and_then(|p| p.channel_id()),
            _ => None,
        };
        from_message.or(match *self {
            DeleteChannelMessages { channel_id, .. }
            | ChannelParticipant { channel_id, .. }
            | ChannelTooLong { channel_id, .. } => Some(channel_id),
            _ => None,
        })
    }

    /// Constructor-like name, for logs.
    pub fn name(&self) -> &str {
        match self {
            Update::NewMessage { .. }              => "updateNewMessage",
            Update::NewChannelMessage { .. }       => "updateNewChannelMessage",
            Update::EditMessage { .. }             => "updateEditMessage",
            Update::EditChannelMessage { .. }      => "updateEditChannelMessage",
            Update::DeleteMessages { .. }          => "updateDeleteMessages",
            Update::DeleteChannelMessages { .. }   => "updateDeleteChannelMessages",
            Update::BotCallbackQuery { .. }        => "updateBotCallbackQuery",
            Update::UserStatus { .. }              => "updateUserStatus",
            Update::ChatParticipant { .. }         => "updateChatParticipant",
            Update::ChannelParticipant { .. }      => "updateChannelParticipant",
            Update::BotBusinessConnect { .. }      => "updateBotBusinessConnect",
            Update::BotNewBusinessMessage { .. }   => "updateBotNewBusinessMessage",
            Update::ChannelTooLong { .. }          => "updateChannelTooLong",
            Update::Other { name }                 => name.as_str(),
        }
    }
}

// ─── Push containers ──────────────────────────────────────────────────────────

/// `updates` / `updatesCombined` payload.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UpdatesBatch {
    pub updates: Vec<Update>,
    pub users:   Vec<User>,
    pub chats:   Vec<Chat>,
    pub date:    i32,
    pub seq:     i32,
}

/// A short private or basic-group message pushed without its batch wrapper.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ShortMessage {
    pub id:        i32,
    /// The other user, or the basic group for `updateShortChatMessage`.
    pub peer:      Peer,
    pub from_id:   Option<i64>,
    pub message:   String,
    pub out:       bool,
    pub pts:       i32,
    pub pts_count: i32,
    pub date:      i32,
}

/// Everything the server may push on its own.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Updates {
    Updates(UpdatesBatch),
    Combined(UpdatesBatch),
    ShortMessage(ShortMessage),
    ShortChatMessage(ShortMessage),
    Short { update: Update, date: i32 },
    TooLong,
}

// ─── Difference results ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct State {
    pub pts:          i32,
    pub qts:          i32,
    pub date:         i32,
    pub seq:          i32,
    pub unread_count: i32,
}

/// Messages, updates and peers of one difference page.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DifferencePage {
    pub new_messages:  Vec<Message>,
    pub other_updates: Vec<Update>,
    pub users:         Vec<User>,
    pub chats:         Vec<Chat>,
}

/// Result of `updates.getDifference`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Difference {
    Empty { date: i32, seq: i32 },
    Difference { page: DifferencePage, state: State },
    Slice { page: DifferencePage, intermediate_state: State },
    TooLong { pts: i32 },
}

/// Result of `updates.getChannelDifference`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelDifference {
    Empty { pts: i32, is_final: bool, timeout: Option<i32> },
    TooLong { dialog_pts: i32, page: DifferencePage },
    Difference { pts: i32, page: DifferencePage, is_final: bool, timeout: Option<i32> },
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A request-ready peer reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InputPeer {
    Empty,
    PeerSelf,
    User { user_id: i64, access_hash: i64 },
    Chat { chat_id: i64 },
    Channel { channel_id: i64, access_hash: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MessageRange {
    pub min_id: i32,
    pub max_id: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelMessagesFilter {
    Empty,
    Ranges(Vec<MessageRange>),
}

/// A typed remote procedure: its request shape and what it returns.
pub trait RemoteCall {
    type Return;

    fn to_request(&self) -> Request;

    fn from_response(response: Response) -> Result<Self::Return, InvocationError>;
}

pub mod functions {
    use super::*;

    /// `updates.getState`
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GetState;

    /// `updates.getDifference`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GetDifference {
        pub pts:             i32,
        pub pts_total_limit: Option<i32>,
        pub date:            i32,
        pub qts:             i32,
    }

    /// `updates.getChannelDifference`
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct GetChannelDifference {
        pub force:   bool,
        pub channel: InputPeer,
        pub filter:  ChannelMessagesFilter,
        pub pts:     i32,
        pub limit:   i32,
    }

    impl RemoteCall for GetState {
        type Return = State;

        fn to_request(&self) -> Request { Request::GetState(*self) }

        fn from_response(response: Response) -> Result<State, InvocationError> {
            match response {
                Response::State(s) => Ok(s),
                other => Err(unexpected("updates.State", &other)),
            }
        }
    }

    impl RemoteCall for GetDifference {
        type Return = Difference;

        fn to_request(&self) -> Request { Request::GetDifference(*self) }

        fn from_response(response: Response) -> Result<Difference, InvocationError> {
            match response {
                Response::Difference(d) => Ok(d),
                other => Err(unexpected("updates.Difference", &other)),
            }
        }
    }

    impl RemoteCall for GetChannelDifference {
        type Return = ChannelDifference;

        fn to_request(&self) -> Request { Request::GetChannelDifference(self.clone()) }

        fn from_response(response: Response) -> Result<ChannelDifference, InvocationError> {
            match response {
                Response::ChannelDifference(d) => Ok(d),
                other => Err(unexpected("updates.ChannelDifference", &other)),
            }
        }
    }

    fn unexpected(wanted: &str, got: &Response) -> InvocationError {
        InvocationError::Deserialize(format!("expected {wanted}, got {}", got.name()))
    }
}

/// Every request the pipeline can send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    GetState(functions::GetState),
    GetDifference(functions::GetDifference),
    GetChannelDifference(functions::GetChannelDifference),
}

/// Every response the pipeline can receive.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Response {
    State(State),
    Difference(Difference),
    ChannelDifference(ChannelDifference),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::State(_)             => "updates.State",
            Response::Difference(_)        => "updates.Difference",
            Response::ChannelDifference(_) => "updates.ChannelDifference",
        }
    }
}
