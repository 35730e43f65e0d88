//! The RPC capability the update pipeline runs on top of.
//!
//! Connection management, encryption and the wire codec live elsewhere; the
//! pipeline only needs to send a handful of requests and to turn a marked
//! peer id into something it can put in a request.

use futures_util::future::BoxFuture;

use crate::errors::InvocationError;
use crate::raw::{InputPeer, PeerId, Request, Response};

/// Sends requests to Telegram on behalf of a [`crate::Client`].
///
/// Implementations should return `FLOOD_WAIT_X` as an
/// [`InvocationError::Rpc`]; sleeping on it is the client's job, governed by
/// its [`crate::RetryPolicy`].
pub trait Invoker: Send + Sync + 'static {
    /// Perform one RPC call.
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, InvocationError>>;

    /// Resolve a marked peer id (user, basic group or channel) to a
    /// request-ready reference.
    fn resolve_peer(&self, peer_id: PeerId) -> BoxFuture<'_, Result<InputPeer, InvocationError>>;
}
