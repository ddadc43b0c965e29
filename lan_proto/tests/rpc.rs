mod common;

use common::*;
use lan_io::tokio;
use lan_io::tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use lan_proto::prelude::*;
use rstest::*;
use std::sync::Arc;
use std::time::Duration;

lan_proto::rpc_service! {
    pub service Chat {
        base: 1000;
        handler: ChatHandler;
        stub: ChatStub;
        proxy: ChatProxy;
        1 => fn say(text: String);
        2 => fn shout(text: String, times: u32);
    }
}

/// Implements `say` only
struct Listener {
    heard: UnboundedSender<(HostId, String)>,
}

impl ChatHandler for Listener {
    fn say(&self, ctx: &RpcContext, text: String) -> RpcResult {
        let _ = self.heard.send((ctx.sender, text));
        Ok(())
    }
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn calls_reach_the_other_side() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);
    let (server_heard, mut server_rx) = unbounded_channel();
    server
        .attach_stub(Arc::new(ChatStub::new(Listener {
            heard: server_heard,
        })))
        .unwrap();

    let (client, _client_rx) = connect(server.local_addr(), false).await;
    let (client_heard, mut client_heard_rx) = unbounded_channel();
    client
        .attach_stub(Arc::new(ChatStub::new(Listener {
            heard: client_heard,
        })))
        .unwrap();
    let me = client.host_id();

    client
        .send_rpc(
            &[HostId::SERVER],
            &ChatProxy::say(&"hi server".to_string()),
            SendOptions::SECURE,
        )
        .unwrap();
    let heard = tokio::time::timeout(EVENT_TIMEOUT, server_rx.recv()).await.unwrap();
    assert_eq!(heard, Some((me, "hi server".to_string())));

    server
        .send_rpc(
            &[me],
            &ChatProxy::say(&"hi client".to_string()),
            SendOptions::RELIABLE,
        )
        .unwrap();
    let heard = tokio::time::timeout(EVENT_TIMEOUT, client_heard_rx.recv())
        .await
        .unwrap();
    assert_eq!(heard, Some((HostId::SERVER, "hi client".to_string())));

    client.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn unimplemented_calls_are_reported_to_both_sides() {
    lan_logging::setup_test_log();
    let (events, mut server_events) = ServerRecorder::new();
    let server = start_server(events);
    let (heard, _heard_rx) = unbounded_channel();
    server
        .attach_stub(Arc::new(ChatStub::new(Listener { heard })))
        .unwrap();

    let (client, mut client_rx) = connect(server.local_addr(), false).await;
    let me = client.host_id();

    // the server's handler leaves `shout` unimplemented
    client
        .send_rpc(
            &[HostId::SERVER],
            &ChatProxy::shout(&"hey".to_string(), &3),
            SendOptions::RELIABLE,
        )
        .unwrap();
    expect_event(&mut server_events, ServerEvent::NotImplemented(1002, me)).await;
    expect_event(&mut client_rx, ClientEvent::Warning(ErrorType::RpcNotImplemented)).await;

    // the client has no stub at all
    server
        .send_rpc(&[me], &ChatProxy::say(&"anyone?".to_string()), SendOptions::RELIABLE)
        .unwrap();
    expect_event(&mut client_rx, ClientEvent::NotImplemented(1001, HostId::SERVER)).await;

    client.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test(flavor = "multi_thread")]
async fn malformed_rpc_messages_are_refused_locally() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);
    let (client, _client_rx) = connect(server.local_addr(), false).await;

    // freeform messages cannot be sent through the rpc path
    assert!(matches!(
        client.send_rpc(&[HostId::SERVER], &Message::user(b"nope"), SendOptions::RELIABLE),
        Err(NetworkError::InvalidRequest(_))
    ));

    // overlapping rpc ids are refused at attach time
    let (heard, _rx) = unbounded_channel();
    client
        .attach_stub(Arc::new(ChatStub::new(Listener { heard: heard.clone() })))
        .unwrap();
    assert!(client
        .attach_stub(Arc::new(ChatStub::new(Listener { heard })))
        .is_err());

    client.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}
