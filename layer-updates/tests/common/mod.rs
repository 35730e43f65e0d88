//! Shared fixtures: a scripted [`Invoker`] and message builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use layer_updates::raw::{self, InputPeer, Message, MessageData, Peer, PeerId, Request, Response};
use layer_updates::{
    Client, Config, DispatchOutcome, InMemoryStorage, InvocationError, Invoker, NoRetries,
    RawEnvelope, RawUpdateHandler, RpcError, StateStorage,
};

/// Answers calls from a fixed script, in order, and records every request.
/// Once the script runs out, `getState` still succeeds and everything else
/// fails with [`InvocationError::Dropped`].
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<VecDeque<Result<Response, InvocationError>>>,
    calls:   Mutex<Vec<Request>>,
}

impl ScriptedInvoker {
    pub fn new(replies: impl IntoIterator<Item = Result<Response, InvocationError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls:   Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }
}

impl Invoker for ScriptedInvoker {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, InvocationError>> {
        let scripted = self.replies.lock().unwrap().pop_front();
        let reply = match (scripted, &request) {
            (Some(reply), _) => reply,
            (None, Request::GetState(_)) => Ok(Response::State(raw::State::default())),
            (None, _) => Err(InvocationError::Dropped),
        };
        self.calls.lock().unwrap().push(request);
        Box::pin(async move { reply })
    }

    fn resolve_peer(&self, peer_id: PeerId) -> BoxFuture<'_, Result<InputPeer, InvocationError>> {
        let peer = if peer_id < 0 {
            InputPeer::Channel { channel_id: -peer_id, access_hash: 0 }
        } else {
            InputPeer::User { user_id: peer_id, access_hash: 0 }
        };
        Box::pin(async move { Ok(peer) })
    }
}

pub fn rpc_error(code: i32, name: &str) -> InvocationError {
    InvocationError::Rpc(RpcError::from_telegram(code, name))
}

pub fn config(storage: Arc<dyn StateStorage>) -> Config {
    Config {
        workers:      1,
        retry_policy: Arc::new(NoRetries),
        storage,
        ..Config::default()
    }
}

pub fn client(invoker: &Arc<ScriptedInvoker>) -> (Client, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let client = Client::new(invoker.clone(), config(storage.clone()));
    (client, storage)
}

pub fn text(id: i32, peer: Peer, body: &str) -> Message {
    Message::Message(MessageData {
        id,
        peer_id:   peer,
        from_id:   Some(Peer::User(1)),
        date:      1_700_000_000,
        message:   body.to_string(),
        out:       false,
        edit_date: None,
    })
}

/// Register a raw handler in group 0 that forwards every envelope.
pub async fn collect(client: &Client) -> mpsc::UnboundedReceiver<RawEnvelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .add_handler(
            RawUpdateHandler::new(move |envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(envelope);
                    Ok(DispatchOutcome::Handled)
                }
            }),
            0,
        )
        .await
        .unwrap();
    rx
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<RawEnvelope>) -> Vec<RawEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

/// Collects `tracing` output emitted on the current thread while the
/// returned guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
