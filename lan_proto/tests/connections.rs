mod common;

use common::*;
use lan_io::tokio;
use lan_proto::prelude::*;
use rstest::*;
use std::time::Duration;

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn clients_join_and_leave() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (first, mut first_rx) = connect(server.local_addr(), true).await;
    let (second, _second_rx) = connect(server.local_addr(), true).await;

    expect_event(
        &mut first_rx,
        ClientEvent::Joined(ErrorType::Ok, bytes::Bytes::from_static(b"welcome")),
    )
    .await;

    let first_id = first.host_id();
    let second_id = second.host_id();
    assert!(first_id.is_assignable());
    assert!(second_id.is_assignable());
    assert_ne!(first_id, second_id);
    assert!(first.is_connected());
    assert!(first.external_addr().is_some());

    expect_event(&mut server_rx, ServerEvent::ClientJoin(first_id, b"hello".to_vec())).await;
    let mut ids = server.get_client_host_ids();
    ids.sort();
    let mut expected = vec![first_id, second_id];
    expected.sort();
    assert_eq!(ids, expected);

    let info = server.get_client_info(first_id).unwrap();
    assert_eq!(info.user_data.as_ref(), b"hello");
    assert!(info.p2p_addr.is_some());

    first.disconnect(Duration::from_secs(2), b"bye").await;
    assert!(!first.is_connected());
    expect_event(&mut first_rx, ClientEvent::Left(ErrorType::DisconnectFromLocal)).await;
    wait_for(&mut server_rx, |event| match event {
        ServerEvent::ClientLeave(host_id, _) if *host_id == first_id => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(server.get_client_host_ids(), vec![second_id]);

    // a second disconnect is a no-op and raises nothing new
    first.disconnect(Duration::from_secs(1), b"").await;
    assert!(drain_for(&mut first_rx, Duration::from_millis(300))
        .await
        .iter()
        .all(|event| !matches!(event, ClientEvent::Left(_))));

    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn rejected_clients_receive_the_reply() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events.rejecting(b"intruder"));

    let (events, mut client_rx) = ClientRecorder::new();
    let result = LanClient::connect(
        client_config(server.local_addr(), true, b"intruder"),
        events,
    )
    .await;

    match result {
        Err(err) => {
            assert_eq!(err.error_type(), ErrorType::NotifyServerDeniedConnection);
            match err {
                NetworkError::ConnectFailed { reply, .. } => assert_eq!(reply.as_ref(), b"go away"),
                other => panic!("unexpected error {other:?}"),
            }
        }
        Ok(_) => panic!("the server admitted a rejected client"),
    }

    expect_event(
        &mut client_rx,
        ClientEvent::Joined(
            ErrorType::NotifyServerDeniedConnection,
            bytes::Bytes::from_static(b"go away"),
        ),
    )
    .await;

    // rejected candidates never become clients
    let events = drain_for(&mut server_rx, Duration::from_millis(300)).await;
    assert!(events
        .iter()
        .all(|event| !matches!(event, ServerEvent::ClientJoin(..) | ServerEvent::ClientLeave(..))));
    assert!(server.get_client_host_ids().is_empty());

    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(30))]
#[tokio::test(flavor = "multi_thread")]
async fn connecting_to_a_closed_port_fails() {
    lan_logging::setup_test_log();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (events, _rx) = ClientRecorder::new();
    let err = LanClient::connect(client_config(addr, false, b""), events)
        .await
        .err()
        .unwrap();
    assert_eq!(err.error_type(), ErrorType::TcpConnectFailure);
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn messages_reach_the_server_and_come_back() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);
    let (client, mut client_rx) = connect(server.local_addr(), false).await;
    let me = client.host_id();

    client
        .send(&[HostId::SERVER], b"ping", SendOptions::SECURE)
        .unwrap();
    expect_event(
        &mut server_rx,
        ServerEvent::Message {
            sender: me,
            payload: b"ping".to_vec(),
        },
    )
    .await;

    server.send(&[me], b"pong", SendOptions::RELIABLE).unwrap();
    expect_event(
        &mut client_rx,
        ClientEvent::Message {
            sender: HostId::SERVER,
            payload: b"pong".to_vec(),
            relayed: false,
        },
    )
    .await;

    // sending to oneself is delivered locally
    client.send(&[me], b"self", SendOptions::RELIABLE).unwrap();
    expect_event(
        &mut client_rx,
        ClientEvent::Message {
            sender: me,
            payload: b"self".to_vec(),
            relayed: false,
        },
    )
    .await;

    assert!(matches!(
        client.send(&[HostId::NONE], b"nobody", SendOptions::RELIABLE),
        Err(NetworkError::UnknownHost(_))
    ));

    eventually(|| client.server_ping().is_some() && client.server_time().is_some()).await;

    client.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn oversized_messages_are_refused_before_sending() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = LanServer::start(server_config(Some(1024)), events).unwrap();
    let (client, _client_rx) = connect(server.local_addr(), false).await;

    let payload = vec![7u8; 4096];
    match client.send(&[HostId::SERVER], &payload, SendOptions::RELIABLE) {
        Err(NetworkError::MessageTooLong { max, .. }) => assert_eq!(max, 1024),
        other => panic!("expected a length error, got {other:?}"),
    }

    // the connection survives and small messages still flow
    client
        .send(&[HostId::SERVER], b"small", SendOptions::RELIABLE)
        .unwrap();
    expect_event(
        &mut server_rx,
        ServerEvent::Message {
            sender: client.host_id(),
            payload: b"small".to_vec(),
        },
    )
    .await;
    assert!(client.is_connected());

    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn server_side_close_is_reported_once() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);
    let (client, mut client_rx) = connect(server.local_addr(), false).await;
    let host_id = client.host_id();

    server.close_connection(host_id).unwrap();
    assert!(matches!(
        server.close_connection(host_id),
        Err(NetworkError::UnknownHost(_))
    ));

    expect_event(&mut client_rx, ClientEvent::Left(ErrorType::DisconnectFromRemote)).await;
    expect_event(
        &mut server_rx,
        ServerEvent::ClientLeave(host_id, ErrorType::DisconnectFromLocal),
    )
    .await;

    let later = drain_for(&mut server_rx, Duration::from_millis(500)).await;
    assert!(later
        .iter()
        .all(|event| !matches!(event, ServerEvent::ClientLeave(..))));
    let later = drain_for(&mut client_rx, Duration::from_millis(200)).await;
    assert!(later
        .iter()
        .all(|event| !matches!(event, ClientEvent::Left(_))));

    eventually(|| !client.is_connected()).await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn stopping_the_server_disconnects_everyone() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);
    let (_first, mut first_rx) = connect(server.local_addr(), false).await;
    let (_second, mut second_rx) = connect(server.local_addr(), false).await;

    server.stop().await;
    // idempotent
    server.stop().await;

    wait_for(&mut first_rx, |event| {
        matches!(event, ClientEvent::Left(_)).then_some(())
    })
    .await;
    wait_for(&mut second_rx, |event| {
        matches!(event, ClientEvent::Left(_)).then_some(())
    })
    .await;

    let leaves = drain_for(&mut server_rx, Duration::from_millis(300))
        .await
        .into_iter()
        .filter(|event| matches!(event, ServerEvent::ClientLeave(..)))
        .count();
    assert_eq!(leaves, 2);
    assert!(server.get_client_host_ids().is_empty());
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn panicking_callbacks_are_reported() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (events, mut client_rx) = ClientRecorder::new();
    let client = LanClient::connect(
        client_config(server.local_addr(), false, b"hello"),
        events.panicking_on(0xFF),
    )
    .await
    .unwrap();
    let me = client.host_id();

    server.send(&[me], &[0xFF, 1], SendOptions::RELIABLE).unwrap();
    expect_event(&mut client_rx, ClientEvent::Exception(HostId::SERVER)).await;

    // the queue keeps serving the same subject afterwards
    server.send(&[me], b"after", SendOptions::RELIABLE).unwrap();
    expect_event(
        &mut client_rx,
        ClientEvent::Message {
            sender: HostId::SERVER,
            payload: b"after".to_vec(),
            relayed: false,
        },
    )
    .await;

    client.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}
