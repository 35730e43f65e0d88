//! layer-replay: drive layer-updates from a recorded server transcript.
//!
//! A transcript is a JSON file with three parts:
//! - `states`: the update state stored before the run (`scope`, `pts`, `date`)
//! - `replies`: answers to the RPC calls the client makes, in call order
//!   (`{"ok": <Response>}` or `{"error": {"code": 400, "message": "CHANNEL_PRIVATE"}}`)
//! - `pushes`: `Updates` containers delivered after startup
//!
//! ```text
//! cargo run -p layer-replay -- layer-replay/transcripts/sample.json
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use layer_updates::raw::{self, InputPeer, PeerId, Request, Response, Updates};
use layer_updates::{
    filters, Client, Config, DispatchOutcome, InMemoryStorage, InvocationError, Invoker,
    RawUpdateHandler, RpcError, StateRecord, StateStorage, UpdateHandler,
};

// ─── Transcript ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Ok(Response),
    Error { code: i32, message: String },
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Transcript {
    states:  Vec<StateRecord>,
    replies: Vec<Reply>,
    pushes:  Vec<Updates>,
}

/// Serves `replies` in order. Running out counts as a dropped connection.
struct ReplayInvoker {
    replies: Mutex<VecDeque<Reply>>,
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::GetState(_)             => "updates.getState",
        Request::GetDifference(_)        => "updates.getDifference",
        Request::GetChannelDifference(_) => "updates.getChannelDifference",
    }
}

impl Invoker for ReplayInvoker {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, InvocationError>> {
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        let result = match reply {
            Some(Reply::Ok(response)) => Ok(response),
            Some(Reply::Error { code, message }) => Err(RpcError::from_telegram(code, &message).into()),
            None => Err(InvocationError::Dropped),
        };
        println!("  → {:<30} {}", request_name(&request), match &result {
            Ok(r)  => r.name().to_string(),
            Err(e) => e.to_string(),
        });
        Box::pin(async move { result })
    }

    fn resolve_peer(&self, peer_id: PeerId) -> BoxFuture<'_, Result<InputPeer, InvocationError>> {
        let peer = if peer_id < 0 {
            InputPeer::Channel { channel_id: raw::CHANNEL_ID_OFFSET - peer_id, access_hash: 0 }
        } else {
            InputPeer::User { user_id: peer_id, access_hash: 0 }
        };
        Box::pin(async move { Ok(peer) })
    }
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "layer_updates=info,layer_replay=info"); }
    }
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: layer-replay <transcript.json>");
        std::process::exit(2);
    };
    let transcript: Transcript = serde_json::from_slice(&std::fs::read(&path)?)?;
    println!(
        "📼 {}: {} stored states, {} replies, {} pushes",
        path.display(), transcript.states.len(), transcript.replies.len(), transcript.pushes.len()
    );

    let storage = Arc::new(InMemoryStorage::new());
    for record in transcript.states {
        storage.set_state(record)?;
    }
    let invoker = Arc::new(ReplayInvoker { replies: Mutex::new(transcript.replies.into()) });
    let client = Client::new(invoker, Config { storage: storage.clone(), ..Config::default() });

    register_handlers(&client).await?;

    println!("🔁 Recovering gaps…");
    client.start().await?;

    println!("📨 Replaying pushes…");
    for push in transcript.pushes {
        if let Err(e) = client.handle_updates(push).await {
            eprintln!("  ✗ push failed: {e}");
        }
    }
    client.stop().await;

    println!("\n💾 Stored state at {}:", Utc::now().format("%H:%M:%S"));
    for record in storage.states()? {
        let kind = if record.is_channel() { "channel" } else { "global" };
        println!("  {kind:<8} {:>16}  pts={:<8} date={:?}", record.scope, record.pts, record.date);
    }
    Ok(())
}

async fn register_handlers(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    client.add_handler(
        UpdateHandler::message(|msg| async move {
            let when = msg.date.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default();
            let who  = msg.sender.as_ref().and_then(|u| u.full_name()).unwrap_or_else(|| "?".into());
            println!("  💬 [{when}] {who} in {}: {}", msg.chat.id, msg.text.unwrap_or_default());
            Ok(DispatchOutcome::Handled)
        })
        .filter(filters::text() & filters::incoming()),
        0,
    ).await?;

    client.add_handler(
        UpdateHandler::deleted_messages(|d| async move {
            println!("  🗑  {:?} deleted in {:?} ({} cached)", d.message_ids, d.chat_id, d.cached.len());
            Ok(DispatchOutcome::Handled)
        }),
        0,
    ).await?;

    client.add_handler(
        UpdateHandler::callback_query(|q| async move {
            println!("  🔘 callback {:?} from {}", q.data(), q.from.id);
            Ok(DispatchOutcome::Handled)
        }),
        0,
    ).await?;

    // Everything nobody above claimed.
    client.add_handler(
        RawUpdateHandler::new(|envelope| async move {
            println!("  ·  {} ({} users, {} chats)", envelope.update.name(), envelope.users.len(), envelope.chats.len());
            Ok(DispatchOutcome::Handled)
        }),
        1,
    ).await?;
    Ok(())
}
