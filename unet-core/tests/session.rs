//! End-to-end sessions over in-process memory transports.

use unet_core::{
    Context, ContextConfig, ContextError, ContextStatus, Event, LeaveReason, LobbyInfo,
    LobbyPrivacy, MemoryNetwork, Operation, PacketType, ResultCode, ServiceKind,
};
use unet_core::reassembly::ReassemblyError;

fn context(name: &str, networks: &[&MemoryNetwork]) -> Context {
    context_with(name, networks, ContextConfig::default())
}

fn context_with(name: &str, networks: &[&MemoryNetwork], mut config: ContextConfig) -> Context {
    config.persona = Some(name.to_string());
    let mut ctx = Context::new(config);
    for net in networks {
        ctx.enable_service(Box::new(net.connect(name))).unwrap();
    }
    ctx
}

fn pump(contexts: &mut [&mut Context], rounds: usize) {
    for _ in 0..rounds {
        for ctx in contexts.iter_mut() {
            ctx.run_callbacks();
        }
    }
}

fn drain(ctx: &mut Context) -> Vec<Event> {
    std::iter::from_fn(|| ctx.poll_event()).collect()
}

fn host_lobby(ctx: &mut Context, name: &str) -> LobbyInfo {
    ctx.create_lobby(LobbyPrivacy::Public, 8, Some(name)).unwrap();
    ctx.run_callbacks();
    drain(ctx)
        .into_iter()
        .find_map(|e| match e {
            Event::LobbyCreated(result) if result.code == ResultCode::Ok => result.lobby,
            _ => None,
        })
        .expect("lobby created")
}

fn first_lobby(ctx: &mut Context) -> LobbyInfo {
    ctx.get_lobby_list().unwrap();
    ctx.run_callbacks();
    drain(ctx)
        .into_iter()
        .find_map(|e| match e {
            Event::LobbyList(result) => result.lobbies.into_iter().next(),
            _ => None,
        })
        .expect("lobby listed")
}

fn peer_named(ctx: &Context, name: &str) -> u8 {
    ctx.lobby()
        .and_then(|l| l.members().iter().find(|m| m.name == name))
        .map(|m| m.peer)
        .expect("member known")
}

#[test]
fn create_list_and_join() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);

    let created = host_lobby(&mut host, "room");
    assert_eq!(created.entry_points.len(), 1);
    assert_eq!(host.local_peer(), Some(0));

    let listed = first_lobby(&mut guest);
    assert_eq!(listed.guid, created.guid);
    assert_eq!(listed.name, "room");
    assert_eq!(listed.max_players, 8);

    guest.join_lobby(&listed).unwrap();
    assert_eq!(guest.status(), ContextStatus::Connecting);
    assert!(matches!(guest.join_lobby(&listed), Err(ContextError::Busy(_))));
    pump(&mut [&mut host, &mut guest], 4);

    assert_eq!(guest.status(), ContextStatus::Connected);
    assert_eq!(guest.local_peer(), Some(1));
    let joined = drain(&mut guest);
    assert!(joined.iter().any(|e| matches!(
        e,
        Event::LobbyJoined(result) if result.code == ResultCode::Ok
            && result.lobby.as_ref().map(|l| l.name.as_str()) == Some("room")
    )));
    assert_eq!(peer_named(&guest, "host"), 0);
    assert!(drain(&mut host).contains(&Event::PlayerJoined {
        peer: 1,
        name: "guest".into()
    }));
}

#[test]
fn create_succeeds_if_any_service_does() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let galaxy = MemoryNetwork::new(ServiceKind::Galaxy);
    galaxy.fail_next(Operation::CreateLobby);
    let mut host = context("host", &[&steam, &galaxy]);

    let created = host_lobby(&mut host, "partial");
    assert_eq!(created.entry_points.len(), 1);
    assert!(created.entry_point(ServiceKind::Steam).is_some());
    assert!(created.entry_point(ServiceKind::Galaxy).is_none());
    assert_eq!(galaxy.lobby_count(), 0);
}

#[test]
fn create_fails_if_every_service_does() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let galaxy = MemoryNetwork::new(ServiceKind::Galaxy);
    steam.fail_next(Operation::CreateLobby);
    galaxy.fail_next(Operation::CreateLobby);
    let mut host = context("host", &[&steam, &galaxy]);

    host.create_lobby(LobbyPrivacy::Public, 8, None).unwrap();
    host.run_callbacks();
    assert_eq!(host.status(), ContextStatus::Idle);
    assert!(host.lobby().is_none());
    assert!(matches!(
        drain(&mut host).as_slice(),
        [Event::LobbyCreated(result)] if result.code == ResultCode::Error && result.lobby.is_none()
    ));
}

#[test]
fn listing_merges_entry_points_by_guid() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let galaxy = MemoryNetwork::new(ServiceKind::Galaxy);
    let mut host = context("host", &[&steam, &galaxy]);
    let mut guest = context("guest", &[&steam, &galaxy]);
    let created = host_lobby(&mut host, "both");

    let listed = first_lobby(&mut guest);
    assert_eq!(listed.guid, created.guid);
    assert_eq!(listed.entry_points.len(), 2);

    guest.join_lobby(&listed).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    let member = host.lobby().and_then(|l| l.member(1)).unwrap();
    assert_eq!(member.ids.len(), 2);
    assert_eq!(member.primary, Some(ServiceKind::Steam));
}

#[test]
fn application_channels_are_offset_past_the_reserved_ones() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let config = ContextConfig::default().with_channels(2);
    let mut host = context_with("host", &[&steam], config.clone());
    let mut guest = context_with("guest", &[&steam], config);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);

    guest.send_to_host(b"on one", PacketType::Reliable, 1).unwrap();
    let steam_host = host.service(ServiceKind::Steam).unwrap();
    assert_eq!(steam_host.is_packet_available(3), Some(6));
    assert_eq!(steam_host.is_packet_available(2), None);

    assert!(host.is_message_available(1));
    assert!(!host.is_message_available(0));
    let message = host.read_message(1).unwrap();
    assert_eq!(message.data, b"on one");
    assert_eq!(message.app_channel(), Some(1));
    assert!(matches!(
        guest.send_to_host(b"x", PacketType::Reliable, 2),
        Err(ContextError::InvalidChannel { channel: 2, channels: 2 })
    ));
}

#[test]
fn large_messages_are_fragmented_on_limited_transports() {
    let galaxy = MemoryNetwork::with_packet_limit(ServiceKind::Galaxy, 64);
    let mut host = context("host", &[&galaxy]);
    let mut guest = context("guest", &[&galaxy]);
    host_lobby(&mut host, "tiny packets");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    assert_eq!(guest.status(), ContextStatus::Connected);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
    guest.send_to_host(&payload, PacketType::Reliable, 0).unwrap();
    guest.send_to_host(b"ping", PacketType::Unreliable, 0).unwrap();
    pump(&mut [&mut host, &mut guest], 1);

    let first = host.read_message(0).unwrap();
    assert_eq!(first.data, payload);
    assert_eq!(host.read_message(0).unwrap().data, b"ping");
    assert!(host.read_message(0).is_none());
    assert_eq!(host.hash_mismatches(), 0);
    assert_eq!(galaxy.dropped_packets(), 0);
}

#[test]
fn peers_without_a_shared_service_go_through_the_host() {
    let steam = MemoryNetwork::with_packet_limit(ServiceKind::Steam, 48);
    let galaxy = MemoryNetwork::with_packet_limit(ServiceKind::Galaxy, 48);
    let mut host = context("host", &[&steam, &galaxy]);
    let mut a = context("a", &[&steam]);
    let mut b = context("b", &[&galaxy]);
    host_lobby(&mut host, "bridge");

    let info = first_lobby(&mut a);
    a.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut a, &mut b], 4);
    let info = first_lobby(&mut b);
    b.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut a, &mut b], 4);

    let to_b = peer_named(&a, "b");
    let to_a = peer_named(&b, "a");
    assert_eq!((to_a, to_b), (1, 2));

    let long: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
    a.send_to(to_b, &long, PacketType::Reliable, 0).unwrap();
    b.send_to(to_a, b"back", PacketType::Reliable, 0).unwrap();
    pump(&mut [&mut host, &mut a, &mut b], 2);

    let at_b = b.read_message(0).unwrap();
    assert_eq!(at_b.data, long);
    let sender = b.lobby().and_then(|l| l.member_by_service_id(at_b.peer)).unwrap();
    assert_eq!(sender.name, "a");

    let at_a = a.read_message(0).unwrap();
    assert_eq!(at_a.data, b"back");
    assert_eq!(a.lobby().and_then(|l| l.member_by_service_id(at_a.peer)).unwrap().peer, to_b);
    assert!(host.read_message(0).is_none());
    assert_eq!(steam.dropped_packets() + galaxy.dropped_packets(), 0);
}

#[test]
fn kicked_member_leaves() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    drain(&mut host);
    drain(&mut guest);

    assert!(matches!(
        guest.kick_member(0, "no"),
        Err(ContextError::Lobby(_))
    ));
    host.kick_member(1, "afk").unwrap();
    pump(&mut [&mut host, &mut guest], 4);

    assert_eq!(guest.status(), ContextStatus::Idle);
    assert!(drain(&mut guest).iter().any(|e| matches!(
        e,
        Event::LobbyLeft(result) if result.reason == LeaveReason::Kicked
    )));
    assert!(drain(&mut host).contains(&Event::PlayerLeft {
        peer: 1,
        name: "guest".into()
    }));
    assert!(host.lobby().and_then(|l| l.member(1)).is_none());
}

#[test]
fn host_leaving_disconnects_guests() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    drain(&mut guest);

    host.leave_lobby(LeaveReason::UserLeave);
    pump(&mut [&mut host, &mut guest], 3);

    assert_eq!(host.status(), ContextStatus::Idle);
    assert!(drain(&mut host).iter().any(|e| matches!(
        e,
        Event::LobbyLeft(result) if result.reason == LeaveReason::UserLeave
    )));
    assert_eq!(guest.status(), ContextStatus::Idle);
    let events = drain(&mut guest);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::LobbyLeft(result) if result.reason == LeaveReason::Disconnected
    )));
    assert_eq!(steam.lobby_count(), 0);
}

#[test]
fn lobby_and_member_data_replicate() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    drain(&mut host);
    drain(&mut guest);

    host.set_lobby_data("mode", "ctf").unwrap();
    host.set_lobby_name("renamed").unwrap();
    host.set_lobby_max_players(3).unwrap();
    assert!(matches!(
        guest.set_lobby_data("mode", "dm"),
        Err(ContextError::Lobby(_))
    ));
    guest.set_member_data(1, "ready", "yes").unwrap();
    pump(&mut [&mut host, &mut guest], 2);

    let at_guest = drain(&mut guest);
    assert!(at_guest.contains(&Event::LobbyDataChanged { name: "mode".into() }));
    assert!(at_guest.contains(&Event::LobbyNameChanged {
        old: "room".into(),
        new: "renamed".into()
    }));
    assert!(at_guest.contains(&Event::LobbyMaxPlayersChanged { old: 8, new: 3 }));
    let lobby = guest.lobby().unwrap();
    assert_eq!(lobby.data().get_data("mode"), Some("ctf"));
    assert_eq!(lobby.info().name, "renamed");

    let at_host = drain(&mut host);
    assert_eq!(
        at_host,
        vec![Event::MemberDataChanged {
            peer: 1,
            name: "ready".into()
        }]
    );
    assert_eq!(
        host.lobby().and_then(|l| l.member(1)).unwrap().data.get_data("ready"),
        Some("yes")
    );

    let listed = first_lobby(&mut guest);
    assert_eq!(listed.name, "renamed");
}

#[test]
fn chat_reaches_everyone_but_the_sender() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut a = context("a", &[&steam]);
    let mut b = context("b", &[&steam]);
    host_lobby(&mut host, "room");
    for guest in [&mut a, &mut b] {
        let info = first_lobby(guest);
        guest.join_lobby(&info).unwrap();
    }
    pump(&mut [&mut host, &mut a, &mut b], 5);
    drain(&mut host);
    drain(&mut a);
    drain(&mut b);

    a.send_chat("gg").unwrap();
    pump(&mut [&mut host, &mut a, &mut b], 2);

    let said = Event::Chat {
        peer: peer_named(&host, "a"),
        text: "gg".into(),
    };
    assert_eq!(drain(&mut host), vec![said.clone()]);
    assert_eq!(drain(&mut b), vec![said]);
    assert!(drain(&mut a).is_empty());
}

#[test]
fn files_transfer_in_chunks() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let config = ContextConfig {
        file_chunk_size: 4096,
        ..ContextConfig::default()
    };
    let mut host = context_with("host", &[&steam], config.clone());
    let mut guest = context_with("guest", &[&steam], config);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    drain(&mut guest);

    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 97) as u8).collect();
    host.add_file("map.bin", content.clone()).unwrap();
    pump(&mut [&mut host, &mut guest], 1);
    assert!(drain(&mut guest).contains(&Event::FileAdded {
        peer: 0,
        filename: "map.bin".into()
    }));

    guest.request_file(0, "map.bin").unwrap();
    pump(&mut [&mut host, &mut guest], 6);

    let received = drain(&mut guest);
    let progress = received
        .iter()
        .filter(|e| matches!(e, Event::FileReceiveProgress { .. }))
        .count();
    assert_eq!(progress, 3);
    assert!(received.contains(&Event::FileReceiveFinished {
        sender: 0,
        filename: "map.bin".into(),
        valid: true
    }));
    let file = guest
        .lobby()
        .and_then(|l| l.member(0))
        .and_then(|m| m.file("map.bin"))
        .unwrap();
    assert_eq!(file.data(), content.as_slice());

    let sent = drain(&mut host);
    assert!(sent.contains(&Event::FileRequested {
        receiver: 1,
        filename: "map.bin".into()
    }));
    assert!(sent.contains(&Event::FileSendFinished {
        receiver: 1,
        filename: "map.bin".into()
    }));
}

#[test]
fn requesting_a_file_again_restarts_the_upload() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let config = ContextConfig {
        file_chunk_size: 100,
        file_chunks_per_tick: 1,
        ..ContextConfig::default()
    };
    let mut host = context_with("host", &[&steam], config.clone());
    let mut guest = context_with("guest", &[&steam], config);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);

    let content: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
    host.add_file("f", content.clone()).unwrap();
    pump(&mut [&mut host, &mut guest], 1);
    drain(&mut host);
    drain(&mut guest);

    guest.request_file(0, "f").unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    guest.request_file(0, "f").unwrap();
    pump(&mut [&mut host, &mut guest], 40);

    let finished: Vec<Event> = drain(&mut guest)
        .into_iter()
        .filter(|e| matches!(e, Event::FileReceiveFinished { .. }))
        .collect();
    assert_eq!(
        finished,
        [Event::FileReceiveFinished {
            sender: 0,
            filename: "f".into(),
            valid: true
        }]
    );
    let file = guest
        .lobby()
        .and_then(|l| l.member(0))
        .and_then(|m| m.file("f"))
        .unwrap();
    assert_eq!(file.data(), content.as_slice());

    let uploads = drain(&mut host)
        .iter()
        .filter(|e| matches!(e, Event::FileSendFinished { .. }))
        .count();
    assert_eq!(uploads, 1);
}

#[test]
fn file_chunks_shrink_to_fit_small_packet_limits() {
    let steam = MemoryNetwork::with_packet_limit(ServiceKind::Steam, 64);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 4);
    assert_eq!(guest.status(), ContextStatus::Connected);

    // far more than 256 fragments of 64 bytes at the default chunk size
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    host.add_file("map.bin", content.clone()).unwrap();
    pump(&mut [&mut host, &mut guest], 1);
    guest.request_file(0, "map.bin").unwrap();
    pump(&mut [&mut host, &mut guest], 10);

    let received = drain(&mut guest);
    assert!(received.contains(&Event::FileReceiveFinished {
        sender: 0,
        filename: "map.bin".into(),
        valid: true
    }));
    let chunks = received
        .iter()
        .filter(|e| matches!(e, Event::FileReceiveProgress { .. }))
        .count();
    assert_eq!(chunks, 2);
    assert_eq!(steam.dropped_packets(), 0);
}

#[test]
fn snapshot_over_the_fragment_ceiling_leaves_the_joiner_connecting() {
    let steam = MemoryNetwork::with_packet_limit(ServiceKind::Steam, 16);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let huge = "x".repeat(4000);
    host.set_lobby_data("motd", &huge).unwrap();

    let info = first_lobby(&mut guest);
    guest.join_lobby(&info).unwrap();
    pump(&mut [&mut host, &mut guest], 6);

    assert_eq!(guest.status(), ContextStatus::Connecting);
    let peer = peer_named(&host, "guest");
    assert!(matches!(
        host.send_to(peer, huge.as_bytes(), PacketType::Reliable, 0),
        Err(ContextError::Reassembly(ReassemblyError::TooManyFragments {
            size: 4000,
            limit: 16,
            ..
        }))
    ));
}

#[test]
fn losing_one_service_drops_only_members_behind_it() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let galaxy = MemoryNetwork::new(ServiceKind::Galaxy);
    let mut host = context("host", &[&steam, &galaxy]);
    let mut a = context("a", &[&steam, &galaxy]);
    let mut b = context("b", &[&galaxy]);
    host_lobby(&mut host, "room");
    for guest in [&mut a, &mut b] {
        let info = first_lobby(guest);
        guest.join_lobby(&info).unwrap();
    }
    pump(&mut [&mut host, &mut a, &mut b], 5);
    drain(&mut host);
    drain(&mut a);
    drain(&mut b);
    let b_peer = peer_named(&host, "b");

    host.simulate_service_outage(ServiceKind::Galaxy).unwrap();
    pump(&mut [&mut host, &mut a, &mut b], 3);

    assert_eq!(host.status(), ContextStatus::Connected);
    assert!(drain(&mut host).contains(&Event::PlayerLeft {
        peer: b_peer,
        name: "b".into()
    }));
    assert_eq!(a.status(), ContextStatus::Connected);
    assert!(drain(&mut a).contains(&Event::PlayerLeft {
        peer: b_peer,
        name: "b".into()
    }));
    assert_eq!(b.status(), ContextStatus::Idle);
    assert!(drain(&mut b).iter().any(|e| matches!(
        e,
        Event::LobbyLeft(result) if result.reason == LeaveReason::Disconnected
    )));

    a.send_to_host(b"still here", PacketType::Reliable, 0).unwrap();
    pump(&mut [&mut host, &mut a], 1);
    assert_eq!(host.read_message(0).unwrap().data, b"still here");
}

#[test]
fn leave_during_join_is_carried_out_after_it() {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let mut host = context("host", &[&steam]);
    let mut guest = context("guest", &[&steam]);
    host_lobby(&mut host, "room");
    let info = first_lobby(&mut guest);

    guest.join_lobby(&info).unwrap();
    guest.leave_lobby(LeaveReason::UserLeave);
    pump(&mut [&mut host, &mut guest], 4);

    assert_eq!(guest.status(), ContextStatus::Idle);
    let events = drain(&mut guest);
    assert!(!events.iter().any(|e| matches!(e, Event::LobbyJoined(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::LobbyLeft(result) if result.reason == LeaveReason::UserLeave
    )));
    assert!(!drain(&mut host)
        .iter()
        .any(|e| matches!(e, Event::PlayerJoined { .. })));
}
