mod common;

use common::*;
use lan_io::tokio;
use lan_io::tokio::sync::mpsc::UnboundedReceiver;
use lan_proto::prelude::*;
use rstest::*;
use std::collections::HashSet;
use std::time::Duration;

/// Waits until `rx` reported a direct link to each of `peers` and `group` as fully connected
async fn wait_until_linked(
    rx: &mut UnboundedReceiver<ClientEvent>,
    mut peers: HashSet<HostId>,
    group: HostId,
) {
    let mut fully_connected = false;
    while !peers.is_empty() || !fully_connected {
        let linked = wait_for(rx, |event| match event {
            ClientEvent::DirectEstablished(peer) => Some(Some(*peer)),
            ClientEvent::FullyConnected(id) if *id == group => Some(None),
            _ => None,
        })
        .await;

        match linked {
            Some(peer) => assert!(peers.remove(&peer), "unexpected direct link to {peer}"),
            None => fully_connected = true,
        }
    }
}

#[rstest]
#[timeout(Duration::from_secs(90))]
#[tokio::test(flavor = "multi_thread")]
async fn members_link_up_directly() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (a, mut a_rx) = connect(server.local_addr(), true).await;
    let (b, mut b_rx) = connect(server.local_addr(), true).await;
    let (c, mut c_rx) = connect(server.local_addr(), true).await;
    let (ida, idb, idc) = (a.host_id(), b.host_id(), c.host_id());

    let group = server
        .create_p2p_group(&[ida, idb, idc], bytes::Bytes::from_static(b"lobby"))
        .unwrap();
    assert!(group.is_assignable());

    wait_until_linked(&mut a_rx, HashSet::from([idb, idc]), group).await;
    wait_until_linked(&mut b_rx, HashSet::from([ida, idc]), group).await;
    wait_until_linked(&mut c_rx, HashSet::from([ida, idb]), group).await;
    expect_event(&mut server_rx, ServerEvent::FullyConnected(group)).await;

    // the larger host id of every pair opened the link
    let pair = server.get_p2p_pair_info(ida, idb).unwrap();
    assert_eq!(pair.initiator, ida.max(idb));
    assert_eq!(pair.dup_count, 1);
    assert_eq!(pair.phase, PairPhase::Connected);

    let info = a.get_p2p_group_info(group).unwrap();
    assert_eq!(info.custom_field.as_ref(), b"lobby");
    assert_eq!(info.members.len(), 3);
    assert_eq!(a.get_joined_p2p_groups(), vec![group]);
    assert!(a.get_peer_info(idb).unwrap().direct);

    a.send(&[group], b"to everyone", SendOptions::SECURE).unwrap();
    for rx in [&mut b_rx, &mut c_rx] {
        expect_event(
            rx,
            ClientEvent::Message {
                sender: ida,
                payload: b"to everyone".to_vec(),
                relayed: false,
            },
        )
        .await;
    }
    // group sends include the sender
    expect_event(
        &mut a_rx,
        ClientEvent::Message {
            sender: ida,
            payload: b"to everyone".to_vec(),
            relayed: false,
        },
    )
    .await;

    eventually(|| a.peer_ping(idb).is_some()).await;

    // fully connected is reported once per group
    let later = drain_for(&mut server_rx, Duration::from_millis(500)).await;
    assert!(!later.contains(&ServerEvent::FullyConnected(group)));

    a.disconnect(Duration::from_secs(2), b"").await;
    b.disconnect(Duration::from_secs(2), b"").await;
    c.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn traffic_is_relayed_without_direct_links() {
    lan_logging::setup_test_log();
    let (events, mut server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (a, mut a_rx) = connect(server.local_addr(), false).await;
    let (b, mut b_rx) = connect(server.local_addr(), false).await;
    let (ida, idb) = (a.host_id(), b.host_id());

    let group = server
        .create_p2p_group(&[ida, idb], bytes::Bytes::new())
        .unwrap();
    expect_event(
        &mut server_rx,
        ServerEvent::JoinAckComplete {
            group,
            member: ida,
            result: ErrorType::Ok,
        },
    )
    .await;
    wait_for(&mut b_rx, |event| match event {
        ClientEvent::MemberJoin { member, .. } if *member == ida => Some(()),
        _ => None,
    })
    .await;

    a.send(&[idb], b"through the server", SendOptions::SECURE)
        .unwrap();
    expect_event(
        &mut b_rx,
        ClientEvent::Message {
            sender: ida,
            payload: b"through the server".to_vec(),
            relayed: true,
        },
    )
    .await;

    assert!(!b.get_peer_info(ida).unwrap().direct);
    let events = drain_for(&mut a_rx, Duration::from_millis(300)).await;
    assert!(events
        .iter()
        .all(|event| !matches!(event, ClientEvent::DirectEstablished(_))));

    a.disconnect(Duration::from_secs(2), b"").await;
    b.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(90))]
#[tokio::test(flavor = "multi_thread")]
async fn pairs_shared_by_two_groups_keep_their_link() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (a, mut a_rx) = connect(server.local_addr(), true).await;
    let (b, mut b_rx) = connect(server.local_addr(), true).await;
    let (ida, idb) = (a.host_id(), b.host_id());

    let first = server
        .create_p2p_group(&[ida, idb], bytes::Bytes::new())
        .unwrap();
    wait_until_linked(&mut a_rx, HashSet::from([idb]), first).await;
    wait_until_linked(&mut b_rx, HashSet::from([ida]), first).await;

    let second = server
        .create_p2p_group(&[ida, idb], bytes::Bytes::new())
        .unwrap();
    wait_for(&mut a_rx, |event| match event {
        ClientEvent::MemberJoin { member, group, .. } if *member == idb && *group == second => {
            Some(())
        }
        _ => None,
    })
    .await;
    eventually(|| {
        server
            .get_p2p_pair_info(ida, idb)
            .map(|pair| pair.dup_count == 2)
            .unwrap_or(false)
    })
    .await;

    // leaving one group keeps the pair and its link
    server.destroy_p2p_group(first).unwrap();
    eventually(|| {
        server
            .get_p2p_pair_info(ida, idb)
            .map(|pair| pair.dup_count == 1)
            .unwrap_or(false)
    })
    .await;
    eventually(|| a.get_joined_p2p_groups() == vec![second]).await;
    assert!(a.get_peer_info(idb).unwrap().direct);

    // leaving the last one drops the pair and its link
    server.leave_p2p_group(second, idb).unwrap();
    wait_for(&mut a_rx, |event| match event {
        ClientEvent::MemberLeave { member, group, .. } if *member == idb && *group == second => {
            Some(())
        }
        _ => None,
    })
    .await;
    eventually(|| server.get_p2p_pair_info(ida, idb).is_none()).await;
    eventually(|| a.get_peer_info(idb).is_none()).await;
    assert!(a.get_peer_host_ids().is_empty());

    a.disconnect(Duration::from_secs(2), b"").await;
    b.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn departed_members_leave_their_groups() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (a, mut a_rx) = connect(server.local_addr(), false).await;
    let (b, _b_rx) = connect(server.local_addr(), false).await;
    let (ida, idb) = (a.host_id(), b.host_id());

    let group = server
        .create_p2p_group(&[ida, idb], bytes::Bytes::new())
        .unwrap();
    eventually(|| a.get_peer_host_ids() == vec![idb]).await;

    b.disconnect(Duration::from_secs(2), b"").await;
    expect_event(
        &mut a_rx,
        ClientEvent::MemberLeave {
            member: idb,
            group,
            count: 1,
        },
    )
    .await;
    assert_eq!(server.get_p2p_group_info(group).unwrap().members, vec![ida]);
    assert!(a.get_peer_host_ids().is_empty());

    // unknown groups and members are refused
    assert!(server
        .join_p2p_group(HostId(9999), ida, bytes::Bytes::new())
        .is_err());
    assert!(server.leave_p2p_group(group, idb).is_err());

    a.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(60))]
#[tokio::test(flavor = "multi_thread")]
async fn relayed_messages_may_use_the_full_length() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = LanServer::start(server_config(Some(1024)), events).unwrap();

    let (a, _a_rx) = connect(server.local_addr(), false).await;
    let (b, mut b_rx) = connect(server.local_addr(), false).await;
    let (ida, idb) = (a.host_id(), b.host_id());
    let _group = server
        .create_p2p_group(&[ida, idb], bytes::Bytes::new())
        .unwrap();
    eventually(|| a.get_peer_host_ids() == vec![idb]).await;

    // the type byte plus the payload is exactly the maximum
    let payload = vec![9u8; 1023];
    for options in [
        SendOptions::RELIABLE,
        SendOptions::SECURE,
        SendOptions::UNRELIABLE.with_encryption(EncryptMode::Fast),
    ] {
        a.send(&[idb], &payload, options).unwrap();
        expect_event(
            &mut b_rx,
            ClientEvent::Message {
                sender: ida,
                payload: payload.clone(),
                relayed: true,
            },
        )
        .await;
    }

    match a.send(&[idb], &[9u8; 1024], SendOptions::RELIABLE) {
        Err(NetworkError::MessageTooLong { length, max }) => {
            assert_eq!((length, max), (1025, 1024))
        }
        other => panic!("expected a length error, got {other:?}"),
    }
    assert!(a.is_connected() && b.is_connected());

    a.disconnect(Duration::from_secs(2), b"").await;
    b.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}

#[rstest]
#[timeout(Duration::from_secs(90))]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_membership_changes_keep_clients_in_step() {
    lan_logging::setup_test_log();
    let (events, _server_rx) = ServerRecorder::new();
    let server = start_server(events);

    let (a, _a_rx) = connect(server.local_addr(), false).await;
    let (b, _b_rx) = connect(server.local_addr(), false).await;
    let (c, _c_rx) = connect(server.local_addr(), false).await;
    let (ida, idb, idc) = (a.host_id(), b.host_id(), c.host_id());
    let group = server
        .create_p2p_group(&[ida], bytes::Bytes::new())
        .unwrap();

    // acks of earlier joins race the membership changes made here
    std::thread::scope(|scope| {
        for member in [idb, idc] {
            let server = &server;
            let _ = scope.spawn(move || {
                for _ in 0..25 {
                    server
                        .join_p2p_group(group, member, bytes::Bytes::new())
                        .unwrap();
                    server.leave_p2p_group(group, member).unwrap();
                }
                server
                    .join_p2p_group(group, member, bytes::Bytes::new())
                    .unwrap();
            });
        }
    });

    let expected = {
        let mut members = vec![ida, idb, idc];
        members.sort();
        members
    };
    assert_eq!(server.get_p2p_group_info(group).unwrap().members, expected);
    for client in [&a, &b, &c] {
        eventually(|| {
            client
                .get_p2p_group_info(group)
                .map(|info| info.members == expected)
                .unwrap_or(false)
        })
        .await;
    }
    eventually(|| {
        server
            .get_p2p_pair_info(idb, idc)
            .map(|pair| pair.dup_count == 1)
            .unwrap_or(false)
    })
    .await;

    a.disconnect(Duration::from_secs(2), b"").await;
    b.disconnect(Duration::from_secs(2), b"").await;
    c.disconnect(Duration::from_secs(2), b"").await;
    server.stop().await;
}
