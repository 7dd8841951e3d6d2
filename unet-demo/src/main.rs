// unet demo: a scripted multi-backend lobby session over in-process transports.

mod config;

use anyhow::{bail, Context as _};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unet_core::{
    Context, ContextConfig, ContextStatus, Event, LeaveReason, LobbyPrivacy, MemoryNetwork,
    PacketType, ServiceKind,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("unet-demo {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    info!(?cfg, "starting demo");
    run(&cfg)
}

/// Every context of the demo, index 0 being the host.
#[derive(Default)]
struct Session {
    contexts: Vec<Context>,
}

impl Session {
    fn add(&mut self, name: &str, networks: &[&MemoryNetwork], config: &ContextConfig) -> anyhow::Result<()> {
        let mut ctx = Context::new(ContextConfig {
            persona: Some(name.to_string()),
            ..config.clone()
        });
        for net in networks {
            ctx.enable_service(Box::new(net.connect(name)))?;
        }
        self.contexts.push(ctx);
        Ok(())
    }

    /// Run `rounds` ticks over every context and collect (context index, event).
    fn tick(&mut self, rounds: usize) -> Vec<(usize, Event)> {
        let mut events = Vec::new();
        for _ in 0..rounds {
            for (index, ctx) in self.contexts.iter_mut().enumerate() {
                ctx.run_callbacks();
                while let Some(event) = ctx.poll_event() {
                    info!(who = ctx.persona_name(), ?event, "event");
                    events.push((index, event));
                }
            }
        }
        events
    }

    fn join(&mut self, index: usize) -> anyhow::Result<()> {
        self.contexts[index].get_lobby_list()?;
        let listed = self
            .tick(1)
            .into_iter()
            .find_map(|(who, event)| match event {
                Event::LobbyList(result) if who == index => result.lobbies.into_iter().next(),
                _ => None,
            })
            .context("no lobby listed")?;
        self.contexts[index].join_lobby(&listed)?;
        self.tick(4);
        if self.contexts[index].status() != ContextStatus::Connected {
            bail!("{} failed to join", self.contexts[index].persona_name());
        }
        Ok(())
    }

    /// Peer index of the member called `name`, as seen by context `viewer`.
    fn peer(&self, viewer: usize, name: &str) -> anyhow::Result<u8> {
        self.contexts[viewer]
            .lobby()
            .and_then(|l| l.members().iter().find(|m| m.name == name))
            .map(|m| m.peer)
            .with_context(|| format!("{name} is not in the lobby"))
    }

    fn sender_name(&self, viewer: usize, message: &unet_core::NetworkMessage) -> String {
        self.contexts[viewer]
            .lobby()
            .and_then(|l| l.member_by_service_id(message.peer))
            .map(|m| m.name.clone())
            .unwrap_or_else(|| message.peer.to_string())
    }
}

fn run(cfg: &config::DemoConfig) -> anyhow::Result<()> {
    let steam = MemoryNetwork::new(ServiceKind::Steam);
    let galaxy = MemoryNetwork::with_packet_limit(ServiceKind::Galaxy, cfg.packet_limit);
    let context_config = ContextConfig {
        channels: cfg.channels,
        file_chunk_size: cfg.chunk_size,
        ..ContextConfig::default()
    };

    let mut session = Session::default();
    session.add("host", &[&steam, &galaxy], &context_config)?;
    for i in 0..cfg.clients {
        let net = if i % 2 == 0 { &steam } else { &galaxy };
        session.add(&format!("client-{i}"), &[net], &context_config)?;
    }

    session.contexts[0].create_lobby(LobbyPrivacy::Public, cfg.clients as u32 + 1, Some("demo"))?;
    session.tick(1);
    if session.contexts[0].status() != ContextStatus::Connected {
        bail!("host could not create the lobby");
    }
    for index in 1..session.contexts.len() {
        session.join(index)?;
    }

    // Replicated state.
    session.contexts[0].set_lobby_data("mode", "capture-the-flag")?;
    let own = session.peer(1, "client-0")?;
    session.contexts[1].set_member_data(own, "ready", "yes")?;
    session.contexts[1].send_chat("hello from steam")?;
    session.tick(2);

    // client-0 is Steam only and client-1 Galaxy only, so this goes through the host.
    let target = session.peer(1, "client-1")?;
    session.contexts[1].send_to(target, b"relayed hello", PacketType::Reliable, 0)?;
    session.tick(2);
    match session.contexts[2].read_message(0) {
        Some(message) => info!(
            from = %session.sender_name(2, &message),
            text = %String::from_utf8_lossy(&message.data),
            "relayed message delivered"
        ),
        None => warn!("relayed message did not arrive"),
    }

    // Larger than a Galaxy packet: split and reassembled.
    let bulk: Vec<u8> = (0..8 * 1024u32).map(|i| (i % 251) as u8).collect();
    session.contexts[2].send_to_host(&bulk, PacketType::Reliable, 0)?;
    session.tick(1);
    match session.contexts[0].read_message(0) {
        Some(message) if message.data == bulk => info!(size = message.len(), "fragmented message reassembled"),
        Some(message) => warn!(size = message.len(), "fragmented message corrupted"),
        None => warn!("fragmented message did not arrive"),
    }

    let map: Vec<u8> = (0..40 * 1024u32).map(|i| (i * 31 % 256) as u8).collect();
    session.contexts[0].add_file("map.dat", map)?;
    session.tick(1);
    session.contexts[2].request_file(0, "map.dat")?;
    let mut received = false;
    for _ in 0..32 {
        received = session.tick(1).iter().any(|(who, event)| {
            *who == 2 && matches!(event, Event::FileReceiveFinished { valid: true, .. })
        });
        if received {
            break;
        }
    }
    if !received {
        warn!("file transfer did not finish");
    }

    let last = session.contexts.len() - 1;
    let victim = session.peer(0, session.contexts[last].persona_name())?;
    session.contexts[0].kick_member(victim, "demo is over for you")?;
    session.tick(3);

    session.contexts[0].leave_lobby(LeaveReason::UserLeave);
    session.tick(3);

    let idle = session
        .contexts
        .iter()
        .filter(|c| c.status() == ContextStatus::Idle)
        .count();
    info!(idle, total = session.contexts.len(), "demo finished");
    Ok(())
}
