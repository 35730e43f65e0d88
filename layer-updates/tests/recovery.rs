mod common;

use common::*;
use layer_updates::raw::{
    self, functions::GetChannelDifference, functions::GetDifference, ChannelDifference,
    ChannelMessagesFilter, Difference, DifferencePage, InputPeer, Peer, Request, Response, State,
};
use layer_updates::{RecoveryStats, StateRecord, StateStorage};

fn state(pts: i32, date: i32) -> State {
    State { pts, date, ..State::default() }
}

fn page(messages: &[i32], others: usize) -> DifferencePage {
    DifferencePage {
        new_messages:  messages.iter().map(|id| text(*id, Peer::User(1), "missed")).collect(),
        other_updates: (0..others).map(|i| raw::Update::Other { name: format!("other{i}") }).collect(),
        users:         vec![raw::User { id: 1, first_name: Some("Ann".into()), ..Default::default() }],
        chats:         Vec::new(),
    }
}

fn slice(messages: &[i32], pts: i32, date: i32) -> Result<Response, layer_updates::InvocationError> {
    Ok(Response::Difference(Difference::Slice { page: page(messages, 0), intermediate_state: state(pts, date) }))
}

fn get_difference(request: &Request) -> GetDifference {
    match request {
        Request::GetDifference(r) => *r,
        other => panic!("expected getDifference, got {other:?}"),
    }
}

#[tokio::test]
async fn slices_converge_on_final_difference() {
    let invoker = ScriptedInvoker::new([
        slice(&[1], 110, 1010),
        Ok(Response::Difference(Difference::Slice {
            page: page(&[2], 1),
            intermediate_state: state(120, 1020),
        })),
        Ok(Response::Difference(Difference::Difference { page: page(&[3], 0), state: state(130, 1030) })),
    ]);
    let (client, storage) = client(&invoker);
    storage.set_state(StateRecord::new(0, 100, Some(1000))).unwrap();
    let mut rx = collect(&client).await;

    client.dispatcher().start().await;
    let stats = client.recover_gaps().await.unwrap();
    client.stop().await;

    assert_eq!(stats, RecoveryStats { messages: 3, updates: 1 });
    let stored = storage.state(0).unwrap().unwrap();
    assert_eq!(stored.pts, 130);
    // Only slices carry a date forward.
    assert_eq!(stored.date, Some(1020));

    let sent: Vec<_> = invoker.calls().iter().map(get_difference).map(|r| (r.pts, r.date, r.qts)).collect();
    assert_eq!(sent, vec![(100, 1000, 0), (110, 1010, 0), (120, 1020, 0)]);

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 4);
    let wrapped: Vec<_> = envelopes
        .iter()
        .filter_map(|e| match &e.update {
            raw::Update::NewMessage { message, pts, pts_count } => Some((message.id(), *pts, *pts_count)),
            _ => None,
        })
        .collect();
    assert_eq!(wrapped, vec![(1, 110, -1), (2, 120, -1), (3, 130, -1)]);
    assert!(envelopes.iter().all(|e| e.users.contains_key(&1)));
}

#[tokio::test]
async fn stalled_slice_stops_the_loop() {
    let invoker = ScriptedInvoker::new([
        slice(&[1], 110, 1010),
        slice(&[2], 110, 1010),
        slice(&[3], 120, 1020),
    ]);
    let (client, storage) = client(&invoker);
    storage.set_state(StateRecord::new(0, 100, Some(1000))).unwrap();

    let stats = client.recover_gaps().await.unwrap();

    assert_eq!(invoker.calls().len(), 2);
    // The page that did not advance is not queued.
    assert_eq!(stats.messages, 1);
    assert_eq!(storage.state(0).unwrap().unwrap().pts, 110);
}

#[tokio::test]
async fn channel_difference_too_long_leaves_pts_alone() {
    let invoker = ScriptedInvoker::new([Ok(Response::ChannelDifference(ChannelDifference::TooLong {
        dialog_pts: 9000,
        page:       page(&[1, 2], 0),
    }))]);
    let (client, storage) = client(&invoker);
    storage.set_state(StateRecord::new(-100123, 500, None)).unwrap();

    let (logs, _guard) = LogCapture::install();
    let stats = client.recover_gaps().await.unwrap();

    assert_eq!(stats, RecoveryStats::default());
    let logs = logs.text();
    assert!(logs.contains("WARN"), "{logs}");
    assert!(logs.contains("Scope -100123: channel difference too long (dialog pts 9000)"), "{logs}");
    assert_eq!(storage.state(-100123).unwrap().unwrap().pts, 500);
    assert_eq!(
        invoker.calls(),
        vec![Request::GetChannelDifference(GetChannelDifference {
            force:   false,
            channel: InputPeer::Channel { channel_id: 100123, access_hash: 0 },
            filter:  ChannelMessagesFilter::Empty,
            pts:     500,
            limit:   10_000,
        })]
    );
}

#[tokio::test]
async fn channel_messages_are_wrapped_as_channel_updates() {
    let scope = raw::channel_scope(55);
    let invoker = ScriptedInvoker::new([Ok(Response::ChannelDifference(ChannelDifference::Difference {
        pts:      42,
        page:     page(&[7], 0),
        is_final: true,
        timeout:  None,
    }))]);
    let (client, storage) = client(&invoker);
    storage.set_state(StateRecord::new(scope, 40, Some(1))).unwrap();
    let mut rx = collect(&client).await;

    client.dispatcher().start().await;
    client.recover_gaps().await.unwrap();
    client.stop().await;

    let envelopes = drain(&mut rx);
    assert_eq!(envelopes.len(), 1);
    assert!(matches!(
        envelopes[0].update,
        raw::Update::NewChannelMessage { pts: 42, pts_count: -1, .. }
    ));
    assert_eq!(storage.state(scope).unwrap().unwrap(), StateRecord::new(scope, 42, Some(1)));
}

#[tokio::test]
async fn terminal_error_only_ends_its_own_scope() {
    let invoker = ScriptedInvoker::new([
        Err(rpc_error(400, "CHANNEL_PRIVATE")),
        Ok(Response::Difference(Difference::Difference { page: page(&[1], 0), state: state(12, 3) })),
    ]);
    let (client, storage) = client(&invoker);
    // Channel scopes sort first.
    storage.set_state(StateRecord::new(raw::channel_scope(9), 70, None)).unwrap();
    storage.set_state(StateRecord::new(0, 10, Some(3))).unwrap();

    let stats = client.recover_gaps().await.unwrap();

    assert_eq!(stats.messages, 1);
    assert_eq!(storage.state(raw::channel_scope(9)).unwrap().unwrap().pts, 70);
    assert_eq!(storage.state(0).unwrap().unwrap().pts, 12);
}

#[tokio::test]
async fn page_cap_bounds_a_diverging_server() {
    let invoker = ScriptedInvoker::new((1..=10).map(|i| slice(&[], 100 + i, 0)));
    let storage = std::sync::Arc::new(layer_updates::InMemoryStorage::new());
    storage.set_state(StateRecord::new(0, 100, None)).unwrap();
    let client = layer_updates::Client::new(
        invoker.clone(),
        layer_updates::Config { max_difference_pages: 3, ..config(storage.clone()) },
    );

    client.recover_gaps().await.unwrap();

    assert_eq!(invoker.calls().len(), 3);
    assert_eq!(storage.state(0).unwrap().unwrap().pts, 103);
}

#[tokio::test]
async fn nothing_stored_nothing_fetched() {
    let invoker = ScriptedInvoker::new(Vec::new());
    let (client, _storage) = client(&invoker);

    assert_eq!(client.recover_gaps().await.unwrap(), RecoveryStats::default());
    assert!(invoker.calls().is_empty());
}
