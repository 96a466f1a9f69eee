//! The poll-loop driver.
//!
//! Owns the transport, the message codec, and the relay core. One thread
//! calls [`Driver::run`], which polls the transport, lets the callbacks
//! run to completion, then sleeps briefly. All relay state is mutated
//! inside those callbacks, strictly serially; the shutdown flag is only
//! checked between cycles so no fan-out is interrupted mid-destination.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};

use vr_codec::{CodecError, MessageCodec};
use vr_transport::{
    ConnectionRequest, DisconnectReason, EventListener, Peer, Reliability, Transport,
    TransportConfig, TransportErrorKind, TransportMetrics,
};
use vr_voice::{JoinAnnounce, VoiceDirected, VoiceDown, VoiceUp};

use crate::config::Config;
use crate::relay::{RelayMetrics, VoiceRelay};

/// A poll cycle longer than this is an overrun.
const POLL_BUDGET: Duration = Duration::from_millis(50);

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

pub struct Driver {
    transport: Transport,
    listener: RelayListener,
    relay: Rc<RefCell<VoiceRelay<Peer>>>,
    metrics: Arc<dyn RelayMetrics>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Driver {
    pub fn new(
        cfg: &Config,
        shutdown: Arc<AtomicBool>,
        relay_metrics: Arc<dyn RelayMetrics>,
        transport_metrics: Arc<dyn TransportMetrics>,
    ) -> Result<Driver> {
        let listen: SocketAddr = cfg
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", cfg.listen))?;

        let mut transport_cfg = TransportConfig::new(listen, cfg.connection_key.clone());
        transport_cfg.metrics = transport_metrics;
        let transport = Transport::start(transport_cfg).context("binding relay socket")?;

        let session_id: u32 = rand::random();
        let relay = Rc::new(RefCell::new(VoiceRelay::new(
            session_id,
            relay_metrics.clone(),
        )));

        let codec = build_codec(&relay)?;

        info!(
            listen = %transport.local_addr(),
            session_id,
            "voice relay ready"
        );

        Ok(Driver {
            transport,
            listener: RelayListener {
                codec,
                relay: relay.clone(),
                metrics: relay_metrics.clone(),
            },
            relay,
            metrics: relay_metrics,
            shutdown,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Poll until the shutdown flag is raised, then stop the transport.
    pub fn run(&mut self) -> Result<()> {
        let mut window_start = Instant::now();
        let mut polls: u64 = 0;
        let mut busy = Duration::ZERO;

        while !self.shutdown.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();
            self.transport.poll(&mut self.listener);
            let cycle = cycle_start.elapsed();

            polls += 1;
            busy += cycle;
            self.metrics.poll_duration(cycle.as_secs_f64());
            if cycle >= POLL_BUDGET {
                self.metrics.poll_overrun();
                warn!(cycle_ms = cycle.as_millis() as u64, "poll cycle overran its budget");
            }

            let window = window_start.elapsed();
            if window >= SUMMARY_INTERVAL {
                let avg_us = busy.as_micros() as f64 / polls.max(1) as f64;
                info!(
                    polls_per_sec = format_args!("{:.0}", polls as f64 / window.as_secs_f64()),
                    avg_cycle_us = format_args!("{avg_us:.0}"),
                    clients = self.relay.borrow().connected_players(),
                    "relay status"
                );
                window_start = Instant::now();
                polls = 0;
                busy = Duration::ZERO;
            }

            std::thread::sleep(self.poll_interval);
        }

        info!("relay stopping");
        self.transport.stop();
        Ok(())
    }
}

/// Wire the codec: register every envelope type, then subscribe the relay
/// handlers. Registration order is part of the protocol.
fn build_codec(relay: &Rc<RefCell<VoiceRelay<Peer>>>) -> Result<MessageCodec<Peer>> {
    let mut codec: MessageCodec<Peer> = MessageCodec::new();
    codec.register::<JoinAnnounce>()?;
    codec.register::<VoiceUp>()?;
    codec.register::<VoiceDown>()?;
    codec.register::<VoiceDirected>()?;

    {
        let relay = relay.clone();
        codec.subscribe::<JoinAnnounce, _>(move |msg, peer: &Peer| {
            relay
                .borrow_mut()
                .register_peer(peer.id(), peer.clone(), msg.player);
        })?;
    }
    {
        let relay = relay.clone();
        codec.subscribe::<VoiceUp, _>(move |msg, peer: &Peer| {
            relay.borrow_mut().handle_voice_up(peer.id(), msg);
        })?;
    }
    {
        let relay = relay.clone();
        codec.subscribe::<VoiceDirected, _>(move |msg, peer: &Peer| {
            relay.borrow_mut().handle_voice_directed(peer.id(), msg);
        })?;
    }
    Ok(codec)
}

struct RelayListener {
    codec: MessageCodec<Peer>,
    relay: Rc<RefCell<VoiceRelay<Peer>>>,
    metrics: Arc<dyn RelayMetrics>,
}

impl EventListener for RelayListener {
    fn connection_requested(&mut self, request: ConnectionRequest) {
        // Admission is unconditional; trust comes from the game-level join
        // that must follow before any voice flows.
        debug!(addr = %request.peer_addr(), "admitting connection");
        let _ = request.accept();
    }

    fn peer_connected(&mut self, peer: Peer) {
        debug!(peer = %peer.id(), addr = %peer.addr(), "peer connected");
    }

    fn peer_disconnected(&mut self, peer: Peer, reason: DisconnectReason) {
        debug!(peer = %peer.id(), reason = reason.as_str(), "peer disconnected");
        self.metrics.disconnect(reason.as_str());
        self.relay.borrow_mut().handle_disconnect(peer.id());
    }

    fn receive(&mut self, peer: Peer, data: Bytes, _class: Reliability) {
        if let Err(error) = self.codec.dispatch(data, &peer) {
            if !matches!(error, CodecError::ShortMessage { .. }) {
                debug!(peer = %peer.id(), %error, "message dispatch failed");
            }
            self.metrics.error("codec");
        }
    }

    fn error(&mut self, endpoint: Option<SocketAddr>, kind: TransportErrorKind) {
        debug!(?endpoint, kind = kind.as_str(), "transport error");
        self.metrics.error("transport");
    }
}
