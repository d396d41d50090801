/// Integration tests: friend connections over the simulated network.
///
/// Covers direct and relay-only connection, friend requests, the status
/// graph on timeout and removal, and the per-friend messaging surface.
mod common;

use common::{statuses, Sim};
use ember_protocol::types::{MAX_CUSTOM_PACKET_SIZE, MAX_MESSAGE_LENGTH};
use ember_protocol::{
    ConnectionStatus, Event, FriendAddError, MessageKind, SelfConnectionStatus, SendPacketError,
};

fn message_texts(events: &[Event]) -> Vec<(MessageKind, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::FriendMessage { kind, text, .. } => Some((*kind, text.clone())),
            _ => None,
        })
        .collect()
}

fn self_statuses(events: &[Event]) -> Vec<SelfConnectionStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::SelfConnectionStatus { status } => Some(*status),
            _ => None,
        })
        .collect()
}

#[test]
fn udp_node_goes_online_and_back_to_none() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    assert_eq!(sim.node(a).self_connection_status(), SelfConnectionStatus::None);

    sim.run(100);
    assert_eq!(sim.node(a).self_connection_status(), SelfConnectionStatus::Udp);
    assert_eq!(self_statuses(&sim.peers[a].take()), vec![SelfConnectionStatus::Udp]);

    let key_a = sim.node(a).public_key();
    sim.net.set_online(&key_a, false);
    sim.run(100);
    assert_eq!(sim.node(a).self_connection_status(), SelfConnectionStatus::None);
    assert_eq!(self_statuses(&sim.peers[a].take()), vec![SelfConnectionStatus::None]);

    sim.net.set_online(&key_a, true);
    sim.run(100);
    assert_eq!(self_statuses(&sim.peers[a].take()), vec![SelfConnectionStatus::Udp]);
}

#[test]
fn relay_only_node_is_online_over_tcp() {
    let mut sim = Sim::with_relay();
    let a = sim.add(1, false);

    let up = sim.run_until(2_000, |s| {
        s.peers[a].node.self_connection_status() == SelfConnectionStatus::Tcp
    });
    assert!(up, "relay link never came up");
    assert_eq!(self_statuses(&sim.peers[a].take()), vec![SelfConnectionStatus::Tcp]);

    // A dead relay link is noticed on its timeout.
    let key_a = sim.node(a).public_key();
    sim.net.set_online(&key_a, false);
    let down = sim.run_until(45_000, |s| {
        s.peers[a].node.self_connection_status() == SelfConnectionStatus::None
    });
    assert!(down, "relay-only node stayed online");
    assert_eq!(self_statuses(&sim.peers[a].take()), vec![SelfConnectionStatus::None]);
}

#[test]
fn udp_friends_connect_directly() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    assert_eq!(sim.status(a, fa), ConnectionStatus::None);

    sim.connect(a, fa, b, fb);

    assert_eq!(sim.status(a, fa), ConnectionStatus::ConnectedDirect);
    assert_eq!(sim.status(b, fb), ConnectionStatus::ConnectedDirect);
    let seen = statuses(&sim.peers[a].take(), fa);
    assert_eq!(seen, vec![ConnectionStatus::Connecting, ConnectionStatus::ConnectedDirect]);
}

#[test]
fn relay_only_friends_connect_through_relay() {
    let mut sim = Sim::with_relay();
    let a = sim.add(1, false);
    let b = sim.add(2, false);
    let (fa, fb) = sim.befriend(a, b);

    sim.connect(a, fa, b, fb);

    assert_eq!(sim.status(a, fa), ConnectionStatus::ConnectedRelay);
    assert_eq!(sim.status(b, fb), ConnectionStatus::ConnectedRelay);
    assert_eq!(sim.node(a).relay_count(), 1);

    sim.node(a).send_message(fa, MessageKind::Normal, "via relay").unwrap();
    sim.run(200);
    let got = message_texts(&sim.peers[b].take());
    assert_eq!(got, vec![(MessageKind::Normal, "via relay".to_string())]);
}

#[test]
fn friend_request_is_reported_once_and_accepted() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let address = sim.node(b).address();
    let key_a = sim.node(a).public_key();

    let fa = sim.node(a).add_friend_by_address(&address, "hello there").unwrap();
    assert_eq!(
        sim.node(a).add_friend_by_address(&address, "again"),
        Err(FriendAddError::AlreadyExists)
    );
    sim.run(3_000);

    let requests: Vec<_> = sim.peers[b]
        .take()
        .into_iter()
        .filter_map(|e| match e {
            Event::FriendRequest {
                public_key,
                message,
            } => Some((public_key, message)),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![(key_a, "hello there".to_string())]);
    assert_eq!(sim.status(a, fa), ConnectionStatus::Connecting);

    let fb = sim.node(b).add_friend(key_a).unwrap();
    sim.connect(a, fa, b, fb);
}

#[test]
fn request_to_stale_nospam_is_dropped() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let address = sim.node(b).address();
    let old = sim.node(b).nospam();
    sim.node(b).set_nospam(old.wrapping_add(1));

    sim.node(a).add_friend_by_address(&address, "hi").unwrap();
    sim.run(2_000);

    assert!(!sim.peers[b]
        .take()
        .iter()
        .any(|e| matches!(e, Event::FriendRequest { .. })));
}

#[test]
fn messages_arrive_in_order_up_to_the_limit() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[b].take();

    let longest = "x".repeat(MAX_MESSAGE_LENGTH);
    let node = sim.node(a);
    assert_eq!(node.send_message(fa, MessageKind::Normal, &longest), Ok(0));
    assert_eq!(node.send_message(fa, MessageKind::Action, "waves"), Ok(1));
    assert_eq!(
        node.send_message(fa, MessageKind::Normal, &"x".repeat(MAX_MESSAGE_LENGTH + 1)),
        Err(SendPacketError::TooLong)
    );
    assert_eq!(node.send_message(fa, MessageKind::Normal, ""), Err(SendPacketError::Empty));
    for i in 0..20 {
        node.send_message(fa, MessageKind::Normal, &format!("m{i}")).unwrap();
    }

    sim.run(500);
    let got = message_texts(&sim.peers[b].take());
    assert_eq!(got.len(), 22);
    assert_eq!(got[0], (MessageKind::Normal, longest));
    assert_eq!(got[1], (MessageKind::Action, "waves".to_string()));
    let tail: Vec<_> = got[2..].iter().map(|(_, t)| t.clone()).collect();
    let expected: Vec<_> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(tail, expected);
}

#[test]
fn profile_and_typing_reach_the_friend() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    sim.node(a).set_name("alice").unwrap();
    let (fa, fb) = sim.befriend(a, b);
    sim.node(a).set_typing(fa, true).unwrap();
    sim.connect(a, fa, b, fb);
    sim.run(200);

    assert_eq!(sim.node(b).friend_name(fb), Ok("alice"));
    assert_eq!(sim.node(b).friend_typing(fb), Ok(true));

    sim.node(a).set_status_message("out for lunch").unwrap();
    sim.node(a).set_typing(fa, false).unwrap();
    sim.run(200);
    assert_eq!(sim.node(b).friend_status_message(fb), Ok("out for lunch"));
    assert_eq!(sim.node(b).friend_typing(fb), Ok(false));
    assert!(sim.peers[b].take().contains(&Event::FriendStatusMessage {
        friend: fb,
        status_message: "out for lunch".into(),
    }));
}

#[test]
fn custom_packets_are_delivered() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[b].take();

    for i in 0..10u8 {
        sim.node(a).send_lossless_packet(fa, &[i, i]).unwrap();
    }
    sim.node(a).send_lossy_packet(fa, b"lossy").unwrap();
    sim.run(300);

    let events = sim.peers[b].take();
    let lossless: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::LosslessPacket { friend, data } if *friend == fb => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(lossless, (0..10u8).map(|i| vec![i, i]).collect::<Vec<_>>());
    assert!(events.contains(&Event::LossyPacket {
        friend: fb,
        data: b"lossy".to_vec(),
    }));
}

#[test]
fn largest_custom_packet_arrives_intact() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[b].take();

    let data: Vec<u8> = (0..MAX_CUSTOM_PACKET_SIZE).map(|i| (i % 251) as u8).collect();
    sim.node(a).send_lossless_packet(fa, &data).unwrap();
    let mut oversized = data.clone();
    oversized.push(0);
    assert_eq!(
        sim.node(a).send_lossless_packet(fa, &oversized),
        Err(SendPacketError::TooLong)
    );
    sim.run(300);

    let lossless: Vec<_> = sim.peers[b]
        .take()
        .into_iter()
        .filter_map(|e| match e {
            Event::LosslessPacket { friend, data } if friend == fb => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(lossless, vec![data]);
}

#[test]
fn silent_friend_times_out_and_reconnects() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[a].take();

    let key_b = sim.node(b).public_key();
    sim.net.set_online(&key_b, false);
    let gone = sim.run_until(20_000, |s| !s.status(a, fa).is_connected());
    assert!(gone);
    assert_eq!(
        statuses(&sim.peers[a].take(), fa),
        vec![ConnectionStatus::None, ConnectionStatus::Connecting]
    );
    assert!(sim.node(a).friend_last_seen(fa).unwrap() > 0);

    sim.net.set_online(&key_b, true);
    sim.connect(a, fa, b, fb);
}

#[test]
fn removed_friend_sees_us_go_offline() {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[b].take();

    sim.node(a).remove_friend(fa).unwrap();
    sim.run(300);

    let seen = statuses(&sim.peers[b].take(), fb);
    assert_eq!(seen.first(), Some(&ConnectionStatus::None));
    assert!(!sim.status(b, fb).is_connected());
    assert!(sim.node(a).friends().is_empty());
}
