//! Voice-relay soak tester: connects a fleet of clients over the real UDP
//! transport, joins and handshakes each one, then streams synthetic voice
//! frames for a fixed duration and reports what came back.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use vr_codec::{decode, MessageCodec};
use vr_transport::{
    ConnectionRequest, DisconnectReason, EventListener, Peer, Reliability, Transport,
    TransportConfig,
};
use vr_voice::payload::{self, PayloadKind, CODEC_SETTINGS_LEN};
use vr_voice::{ClientId, JoinAnnounce, PlayerId, VoiceDown, VoiceUp};

mod stats;
use stats::{dur_ms, quantiles_ms, SoakReport};

#[derive(Parser, Debug, Clone)]
#[command(name = "vr-soak", about = "UDP voice relay soak tester")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:10515")]
    server: String,

    /// Bind address for client sockets (port 0 = ephemeral)
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(long, default_value = "vr-relay/1")]
    connection_key: String,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Run duration in seconds
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Voice frames per second per client
    #[arg(long, default_value_t = 50)]
    rate_pps: u32,

    /// Synthetic voice frame size in bytes (before the payload prefix)
    #[arg(long, default_value_t = 120)]
    payload_bytes: usize,

    /// Write a JSON report to this path
    #[arg(long)]
    report_json: Option<String>,
}

#[derive(Default)]
struct ClientState {
    server: Option<Peer>,
    handshake_sent: Option<Instant>,
    handshake_ms: Option<u64>,
    client_id: Option<ClientId>,
    connect_failed: bool,
    voice_received: u64,
    bytes_received: u64,
}

struct ClientListener {
    player: PlayerId,
    state: Rc<RefCell<ClientState>>,
}

impl EventListener for ClientListener {
    fn connection_requested(&mut self, request: ConnectionRequest) {
        // Clients never accept inbound connections.
        request.reject();
    }

    fn peer_connected(&mut self, peer: Peer) {
        let mut state = self.state.borrow_mut();
        // Announce the player identity, then handshake for a client id.
        let join = MessageCodec::<Peer>::encode(&JoinAnnounce { player: self.player });
        let handshake = MessageCodec::<Peer>::encode(&VoiceUp {
            reliable: true,
            payload: payload::build_handshake_request(&[0x5A; CODEC_SETTINGS_LEN], "soak"),
        });
        if peer.send(&join, Reliability::ReliableOrdered).is_err()
            || peer.send(&handshake, Reliability::ReliableOrdered).is_err()
        {
            warn!(player = %self.player, "join/handshake send failed");
            return;
        }
        state.handshake_sent = Some(Instant::now());
        state.server = Some(peer);
    }

    fn peer_disconnected(&mut self, _peer: Peer, reason: DisconnectReason) {
        let mut state = self.state.borrow_mut();
        state.server = None;
        if reason == DisconnectReason::ConnectFailed {
            state.connect_failed = true;
        }
    }

    fn receive(&mut self, _peer: Peer, data: Bytes, _class: Reliability) {
        let Ok(down) = decode::<VoiceDown>(data) else {
            return;
        };
        let mut state = self.state.borrow_mut();
        match payload::classify(&down.payload) {
            Ok(PayloadKind::HandshakeResponse) => {
                if state.client_id.is_none() && down.payload.len() >= 9 {
                    state.client_id = Some(ClientId(u16::from_be_bytes([
                        down.payload[7],
                        down.payload[8],
                    ])));
                    if let Some(sent) = state.handshake_sent {
                        state.handshake_ms = Some(dur_ms(sent.elapsed()));
                    }
                }
            }
            Ok(PayloadKind::VoiceData) => {
                state.voice_received += 1;
                state.bytes_received += down.payload.len() as u64;
            }
            _ => {}
        }
    }
}

struct SoakClient {
    transport: Transport,
    listener: ClientListener,
    state: Rc<RefCell<ClientState>>,
    next_voice_at: Instant,
    voice_sent: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();
    let server: SocketAddr = args.server.parse().context("bad --server address")?;
    let bind: SocketAddr = args.bind.parse().context("bad --bind address")?;

    let voice_interval = Duration::from_secs(1) / args.rate_pps.max(1);
    let frame: Vec<u8> = (0..args.payload_bytes).map(|_| rand::random::<u8>()).collect();
    let voice = MessageCodec::<Peer>::encode(&VoiceUp {
        reliable: false,
        payload: payload::build_payload(PayloadKind::VoiceData, &frame),
    });

    let mut clients = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let transport = Transport::start(TransportConfig::new(bind, args.connection_key.clone()))?;
        transport.connect(server)?;
        let state = Rc::new(RefCell::new(ClientState::default()));
        clients.push(SoakClient {
            transport,
            listener: ClientListener {
                player: PlayerId(uuid::Uuid::new_v4()),
                state: state.clone(),
            },
            state,
            next_voice_at: Instant::now(),
            voice_sent: 0,
        });
    }
    info!(clients = clients.len(), %server, "soak started");

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    while Instant::now() < deadline {
        let now = Instant::now();
        for client in clients.iter_mut() {
            client.transport.poll(&mut client.listener);
            if now >= client.next_voice_at {
                let connected = client.state.borrow().server.clone();
                if let Some(peer) = connected {
                    if peer.send(&voice, Reliability::Unreliable).is_ok() {
                        client.voice_sent += 1;
                    }
                }
                client.next_voice_at = now + voice_interval;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    for client in &clients {
        client.transport.stop();
    }

    let mut report = SoakReport::default();
    let mut handshake_samples = Vec::new();
    for client in &clients {
        let state = client.state.borrow();
        report.counters.voice_sent += client.voice_sent;
        report.counters.voice_received += state.voice_received;
        report.counters.bytes_received += state.bytes_received;
        if state.connect_failed {
            report.counters.connect_failed += 1;
        } else {
            report.counters.connected += 1;
        }
        if let Some(ms) = state.handshake_ms {
            report.counters.handshakes_ok += 1;
            handshake_samples.push(ms);
        }
    }
    let (p50, p95) = quantiles_ms(&mut handshake_samples);
    report.timings.handshake_ms_p50 = p50;
    report.timings.handshake_ms_p95 = p95;

    info!(
        connected = report.counters.connected,
        handshakes = report.counters.handshakes_ok,
        sent = report.counters.voice_sent,
        received = report.counters.voice_received,
        handshake_p50_ms = report.timings.handshake_ms_p50,
        handshake_p95_ms = report.timings.handshake_ms_p95,
        "soak finished"
    );

    if let Some(path) = args.report_json {
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("writing report to {path}"))?;
        info!(%path, "report written");
    }

    Ok(())
}
