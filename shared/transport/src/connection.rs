//! Per-peer reliability state: send queues, retransmission, ordered
//! reassembly, sequenced latest-wins filtering, and keepalive bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::frame::{seq_newer, Frame};
use crate::{
    DisconnectReason, Reliability, TransportError, MAX_FRAGMENT_PAYLOAD, MAX_MESSAGE_SIZE,
};

pub(crate) const RESEND_INTERVAL: Duration = Duration::from_millis(200);
pub(crate) const MAX_SEND_ATTEMPTS: u32 = 12;
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const RECEIVE_TIMEOUT: Duration = Duration::from_secs(8);
pub(crate) const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// How far ahead of the delivery cursor an ordered frame may be held.
const RECEIVE_WINDOW: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Outbound connect in progress; only handshake frames flow.
    Connecting,
    Connected,
}

struct PendingFrame {
    encoded: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
}

pub(crate) struct Connection {
    pub state: ConnState,
    pub last_ingress: Instant,
    pub last_egress: Instant,
    pub connect_attempts: u32,
    pub next_connect_attempt: Instant,

    send_queue: VecDeque<Vec<u8>>,

    next_ordered: u16,
    next_sequenced: u16,
    pending_ordered: HashMap<u16, PendingFrame>,
    pending_sequenced: HashMap<u16, PendingFrame>,

    expected_ordered: u16,
    ordered_held: HashMap<u16, (u8, u8, Bytes)>,
    assembly: Vec<u8>,
    assembly_next: u8,
    latest_sequenced: Option<u16>,
}

impl Connection {
    pub fn new(state: ConnState, now: Instant) -> Connection {
        Connection {
            state,
            last_ingress: now,
            last_egress: now,
            connect_attempts: 0,
            next_connect_attempt: now,
            send_queue: VecDeque::new(),
            next_ordered: 0,
            next_sequenced: 0,
            pending_ordered: HashMap::new(),
            pending_sequenced: HashMap::new(),
            expected_ordered: 0,
            ordered_held: HashMap::new(),
            assembly: Vec::new(),
            assembly_next: 0,
            latest_sequenced: None,
        }
    }

    pub fn queue_frame(&mut self, encoded: Vec<u8>) {
        self.send_queue.push_back(encoded);
    }

    pub fn front_outgoing(&self) -> Option<&Vec<u8>> {
        self.send_queue.front()
    }

    pub fn pop_outgoing(&mut self) {
        self.send_queue.pop_front();
    }

    pub fn has_egress(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Queue one application message, fragmenting reliable-ordered messages
    /// that exceed a single frame.
    pub fn enqueue_message(
        &mut self,
        data: &[u8],
        class: Reliability,
        now: Instant,
    ) -> Result<(), TransportError> {
        match class {
            Reliability::Unreliable => {
                if data.len() > MAX_FRAGMENT_PAYLOAD {
                    return Err(TransportError::MessageTooLarge {
                        len: data.len(),
                        max: MAX_FRAGMENT_PAYLOAD,
                    });
                }
                let frame = Frame::Data {
                    class,
                    seq: 0,
                    frag_index: 0,
                    frag_count: 1,
                    payload: Bytes::copy_from_slice(data),
                };
                self.queue_frame(frame.encode());
            }
            Reliability::ReliableSequenced => {
                if data.len() > MAX_FRAGMENT_PAYLOAD {
                    return Err(TransportError::MessageTooLarge {
                        len: data.len(),
                        max: MAX_FRAGMENT_PAYLOAD,
                    });
                }
                let seq = self.next_sequenced;
                self.next_sequenced = seq.wrapping_add(1);
                // Only the newest sequenced message matters; older in-flight
                // ones stop being retransmitted.
                self.pending_sequenced.clear();
                let encoded = Frame::Data {
                    class,
                    seq,
                    frag_index: 0,
                    frag_count: 1,
                    payload: Bytes::copy_from_slice(data),
                }
                .encode();
                self.pending_sequenced.insert(
                    seq,
                    PendingFrame {
                        encoded: encoded.clone(),
                        last_sent: now,
                        attempts: 1,
                    },
                );
                self.queue_frame(encoded);
            }
            Reliability::ReliableOrdered => {
                if data.len() > MAX_MESSAGE_SIZE {
                    return Err(TransportError::MessageTooLarge {
                        len: data.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                let chunks: Vec<&[u8]> = if data.is_empty() {
                    vec![&[][..]]
                } else {
                    data.chunks(MAX_FRAGMENT_PAYLOAD).collect()
                };
                let frag_count = chunks.len() as u8;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let seq = self.next_ordered;
                    self.next_ordered = seq.wrapping_add(1);
                    let encoded = Frame::Data {
                        class,
                        seq,
                        frag_index: i as u8,
                        frag_count,
                        payload: Bytes::copy_from_slice(chunk),
                    }
                    .encode();
                    self.pending_ordered.insert(
                        seq,
                        PendingFrame {
                            encoded: encoded.clone(),
                            last_sent: now,
                            attempts: 1,
                        },
                    );
                    self.queue_frame(encoded);
                }
            }
        }
        Ok(())
    }

    /// Handle an inbound data frame, pushing any messages that became
    /// deliverable onto `out`.
    pub fn on_data(
        &mut self,
        class: Reliability,
        seq: u16,
        frag_index: u8,
        frag_count: u8,
        payload: Bytes,
        out: &mut Vec<(Bytes, Reliability)>,
    ) {
        match class {
            Reliability::Unreliable => out.push((payload, class)),
            Reliability::ReliableSequenced => {
                // Duplicates are acked too, or the sender retries forever.
                self.queue_frame(Frame::Ack { class, seq }.encode());
                let fresh = self.latest_sequenced.map_or(true, |latest| seq_newer(seq, latest));
                if fresh {
                    self.latest_sequenced = Some(seq);
                    out.push((payload, class));
                }
            }
            Reliability::ReliableOrdered => {
                let behind = seq != self.expected_ordered && !seq_newer(seq, self.expected_ordered);
                // Too far ahead to hold: leave it unacked so the sender
                // retries once the window has moved.
                if !behind && seq.wrapping_sub(self.expected_ordered) >= RECEIVE_WINDOW {
                    return;
                }
                self.queue_frame(Frame::Ack { class, seq }.encode());
                // Duplicates behind the cursor are acked and dropped.
                if behind {
                    return;
                }
                self.ordered_held
                    .entry(seq)
                    .or_insert((frag_index, frag_count, payload));
                while let Some((fi, fc, data)) = self.ordered_held.remove(&self.expected_ordered) {
                    self.expected_ordered = self.expected_ordered.wrapping_add(1);
                    self.take_fragment(fi, fc, data, out);
                }
            }
        }
    }

    fn take_fragment(
        &mut self,
        frag_index: u8,
        frag_count: u8,
        data: Bytes,
        out: &mut Vec<(Bytes, Reliability)>,
    ) {
        if frag_count <= 1 {
            out.push((data, Reliability::ReliableOrdered));
            return;
        }
        if frag_index == 0 {
            self.assembly.clear();
            self.assembly_next = 0;
        }
        if frag_index != self.assembly_next {
            // Fragment stream desync; drop the partial message.
            self.assembly.clear();
            self.assembly_next = 0;
            return;
        }
        self.assembly.extend_from_slice(&data);
        self.assembly_next += 1;
        if frag_index == frag_count - 1 {
            out.push((
                Bytes::from(std::mem::take(&mut self.assembly)),
                Reliability::ReliableOrdered,
            ));
            self.assembly_next = 0;
        }
    }

    pub fn on_ack(&mut self, class: Reliability, seq: u16) {
        match class {
            Reliability::ReliableOrdered => {
                self.pending_ordered.remove(&seq);
            }
            Reliability::ReliableSequenced => {
                self.pending_sequenced.remove(&seq);
            }
            Reliability::Unreliable => {}
        }
    }

    /// Retransmission and keepalive timers. `Some(reason)` means the peer
    /// must be dropped.
    pub fn tick(&mut self, now: Instant) -> Option<DisconnectReason> {
        if now.duration_since(self.last_ingress) >= RECEIVE_TIMEOUT {
            return Some(DisconnectReason::Timeout);
        }

        let mut resend: Vec<Vec<u8>> = Vec::new();
        for pending in self
            .pending_ordered
            .values_mut()
            .chain(self.pending_sequenced.values_mut())
        {
            if now.duration_since(pending.last_sent) >= RESEND_INTERVAL {
                if pending.attempts >= MAX_SEND_ATTEMPTS {
                    return Some(DisconnectReason::Timeout);
                }
                pending.attempts += 1;
                pending.last_sent = now;
                resend.push(pending.encoded.clone());
            }
        }
        for encoded in resend {
            self.queue_frame(encoded);
        }

        if self.send_queue.is_empty()
            && now.duration_since(self.last_egress) >= KEEPALIVE_INTERVAL
        {
            self.queue_frame(Frame::Ping.encode());
        }

        None
    }
}
