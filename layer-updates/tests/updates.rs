mod common;

use std::sync::Arc;

use common::*;
use layer_updates::raw::{
    self, functions::GetChannelDifference, functions::GetDifference, ChannelDifference,
    ChannelMessagesFilter, Difference, DifferencePage, MessageRange, Peer, Request, Response,
    ShortMessage, Updates, UpdatesBatch,
};
use layer_updates::{Client, Config, InMemoryStorage, StateStorage};

fn channel(id: i64, min: bool) -> raw::Chat {
    raw::Chat::Channel {
        id,
        access_hash: None,
        min,
        megagroup:   true,
        title:       "Lobby".into(),
        username:    None,
    }
}

#[tokio::test]
async fn batch_advances_each_scope() {
    let invoker = ScriptedInvoker::new(Vec::new());
    let (client, storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    client
        .handle_updates(Updates::Updates(UpdatesBatch {
            updates: vec![
                raw::Update::NewMessage { message: text(1, Peer::User(1), "hi"), pts: 5, pts_count: 1 },
                raw::Update::NewChannelMessage { message: text(2, Peer::Channel(77), "yo"), pts: 9, pts_count: 1 },
                raw::Update::UserStatus { user_id: 1, status: raw::UserStatus::Recently },
            ],
            users:   vec![raw::User { id: 1, ..Default::default() }],
            chats:   vec![channel(77, false)],
            date:    1234,
            seq:     0,
        }))
        .await
        .unwrap();
    client.stop().await;

    assert_eq!(storage.state(0).unwrap().unwrap().pts, 5);
    let ch = storage.state(raw::channel_scope(77)).unwrap().unwrap();
    assert_eq!((ch.pts, ch.date), (9, Some(1234)));
    assert_eq!(storage.states().unwrap().len(), 2);

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 3);
    // One batch, one set of peer maps.
    assert!(Arc::ptr_eq(&envelopes[0].chats, &envelopes[2].chats));
    assert!(invoker.calls().is_empty());
}

#[tokio::test]
async fn skip_updates_persists_nothing() {
    let invoker = ScriptedInvoker::new(Vec::new());
    let storage = Arc::new(InMemoryStorage::new());
    let client = Client::new(invoker.clone(), Config { skip_updates: true, ..config(storage.clone()) });

    client
        .handle_updates(Updates::Updates(UpdatesBatch {
            updates: vec![raw::Update::DeleteMessages { messages: vec![3], pts: 8, pts_count: 1 }],
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(storage.states().unwrap().is_empty());
}

#[tokio::test]
async fn min_channel_peers_are_completed() {
    let invoker = ScriptedInvoker::new([Ok(Response::ChannelDifference(ChannelDifference::Difference {
        pts:      10,
        page:     DifferencePage {
            users: vec![raw::User { id: 5, access_hash: Some(99), ..Default::default() }],
            chats: vec![channel(77, false)],
            ..Default::default()
        },
        is_final: true,
        timeout:  None,
    }))]);
    let (client, _storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    client
        .handle_updates(Updates::Updates(UpdatesBatch {
            updates: vec![raw::Update::NewChannelMessage {
                message:   text(42, Peer::Channel(77), "hello"),
                pts:       10,
                pts_count: 1,
            }],
            chats: vec![channel(77, true)],
            date:  1,
            ..Default::default()
        }))
        .await
        .unwrap();
    client.stop().await;

    match &invoker.calls()[..] {
        [Request::GetChannelDifference(GetChannelDifference { filter, pts, limit, force, .. })] => {
            assert_eq!(*filter, ChannelMessagesFilter::Ranges(vec![MessageRange { min_id: 42, max_id: 42 }]));
            assert_eq!((*pts, *limit, *force), (9, 10, false));
        }
        other => panic!("unexpected calls {other:?}"),
    }

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 1);
    assert!(envelopes[0].users.contains_key(&5));
    assert!(!envelopes[0].chats[&77].is_min());
}

#[tokio::test]
async fn inaccessible_min_channel_is_still_delivered() {
    let invoker = ScriptedInvoker::new([Err(rpc_error(400, "CHANNEL_PRIVATE"))]);
    let (client, _storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    client
        .handle_updates(Updates::Combined(UpdatesBatch {
            updates: vec![raw::Update::NewChannelMessage {
                message:   text(42, Peer::Channel(77), "hello"),
                pts:       10,
                pts_count: 1,
            }],
            chats: vec![channel(77, true)],
            ..Default::default()
        }))
        .await
        .unwrap();
    client.stop().await;

    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test]
async fn failed_peer_completion_still_delivers_the_batch() {
    // No scripted replies: the completion call fails with `Dropped`.
    let invoker = ScriptedInvoker::new(Vec::new());
    let (client, storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    let result = client
        .handle_updates(Updates::Updates(UpdatesBatch {
            updates: vec![
                raw::Update::NewMessage { message: text(1, Peer::User(1), "hi"), pts: 5, pts_count: 1 },
                raw::Update::NewChannelMessage { message: text(42, Peer::Channel(77), "yo"), pts: 9, pts_count: 1 },
            ],
            chats: vec![channel(77, true)],
            date:  1,
            ..Default::default()
        }))
        .await;
    client.stop().await;

    assert!(result.is_err());
    assert_eq!(storage.state(0).unwrap().unwrap().pts, 5);
    assert_eq!(storage.state(raw::channel_scope(77)).unwrap().unwrap().pts, 9);

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 2);
    assert!(matches!(envelopes[0].update, raw::Update::NewMessage { pts: 5, .. }));
    assert!(matches!(envelopes[1].update, raw::Update::NewChannelMessage { pts: 9, .. }));
}

#[tokio::test]
async fn short_message_is_fetched_with_real_counts() {
    let invoker = ScriptedInvoker::new([Ok(Response::Difference(Difference::Difference {
        page: DifferencePage {
            new_messages: vec![text(31, Peer::User(1), "full")],
            users:        vec![raw::User { id: 1, first_name: Some("Ann".into()), ..Default::default() }],
            ..Default::default()
        },
        state: raw::State { pts: 20, ..Default::default() },
    }))]);
    let (client, storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    client
        .handle_updates(Updates::ShortMessage(ShortMessage {
            id:        31,
            peer:      Peer::User(1),
            from_id:   Some(1),
            message:   "full".into(),
            out:       false,
            pts:       20,
            pts_count: 1,
            date:      50,
        }))
        .await
        .unwrap();
    client.stop().await;

    assert_eq!(
        invoker.calls(),
        vec![Request::GetDifference(GetDifference { pts: 19, pts_total_limit: None, date: 50, qts: -1 })]
    );
    assert_eq!(storage.state(0).unwrap().unwrap().pts, 20);

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 1);
    assert!(matches!(envelopes[0].update, raw::Update::NewMessage { pts: 20, pts_count: 1, .. }));
    assert!(envelopes[0].users.contains_key(&1));
    assert!(client.cached_message(1, 31).is_some());
}

#[tokio::test]
async fn short_update_is_queued_bare() {
    let invoker = ScriptedInvoker::new(Vec::new());
    let (client, _storage) = client(&invoker);
    let mut rx = collect(&client).await;
    client.dispatcher().start().await;

    let before = client.last_update_at();
    client
        .handle_updates(Updates::Short {
            update: raw::Update::UserStatus { user_id: 3, status: raw::UserStatus::Recently },
            date:   0,
        })
        .await
        .unwrap();
    client.stop().await;

    assert!(client.last_update_at() >= before);
    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 1);
    assert!(envelopes[0].users.is_empty() && envelopes[0].chats.is_empty());
}
