//! UDP mesh link.
//!
//! Every node joins the ff02::1 group on one interface and port. A datagram
//! is a `LinkHeader` followed by one mesh envelope. Best-effort frames are
//! flooded: each node relays a frame it has not seen yet while its TTL allows.
//! Reliable frames go to one target, are retransmitted every retry interval,
//! and complete when the target answers with `Reply` or `Ack`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use static_assertions::assert_eq_size;
use tokio::net::UdpSocket;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use stonemesh_core::config::{NetworkConfig, ReliableConfig};
use stonemesh_core::wire::{StoneId, BROADCAST_ID, MAX_MESH_MSG_SIZE};
use stonemesh_services::{Inbound, MeshNode, MeshTransport, ReliableStatus, TransportError};

pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// How many `(opcode, source, seq)` triples are remembered for flood dedupe.
const RECENT_FRAMES: usize = 64;

// ── Link header ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Best-effort envelope, flooded.
    Msg = 1,
    /// Envelope for one target that expects an answer.
    ReliableMsg = 2,
    /// Answer carrying a `Result` envelope.
    Reply = 3,
    /// Answer without an envelope.
    Ack = 4,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Msg),
            2 => Ok(Opcode::ReliableMsg),
            3 => Ok(Opcode::Reply),
            4 => Ok(Opcode::Ack),
            other => Err(other),
        }
    }
}

/// Prefix of every datagram. Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LinkHeader {
    pub opcode: u8,
    pub src: StoneId,
    /// `BROADCAST_ID` for flooded frames.
    pub dst: StoneId,
    /// Remaining relays.
    pub ttl: u8,
    /// Relays taken so far.
    pub hops: u8,
    /// Per-sender sequence number. `Reply`/`Ack` carry the request's.
    pub seq: U16<LittleEndian>,
}

assert_eq_size!(LinkHeader, [u8; 7]);

pub const LINK_HEADER_SIZE: usize = std::mem::size_of::<LinkHeader>();
pub const MAX_DATAGRAM: usize = LINK_HEADER_SIZE + MAX_MESH_MSG_SIZE;

/// Split a datagram into header and envelope.
pub fn parse_datagram(datagram: &[u8]) -> Option<(LinkHeader, Opcode, &[u8])> {
    let header = LinkHeader::read_from_prefix(datagram)?;
    let opcode = Opcode::try_from(header.opcode).ok()?;
    let envelope = &datagram[LINK_HEADER_SIZE..];
    if envelope.len() > MAX_MESH_MSG_SIZE {
        return None;
    }
    Some((header, opcode, envelope))
}

// ── Dedupe ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RecentFrames {
    seen: VecDeque<(u8, StoneId, u16)>,
}

impl RecentFrames {
    /// Record a frame. Returns false if it was already seen.
    fn insert(&mut self, opcode: Opcode, src: StoneId, seq: u16) -> bool {
        let key = (opcode as u8, src, seq);
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() == RECENT_FRAMES {
            self.seen.pop_front();
        }
        self.seen.push_back(key);
        true
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct PendingReliable {
    datagram: Vec<u8>,
    target: StoneId,
    seq: u16,
    deadline: Instant,
    next_retry: Instant,
    attempts: u32,
}

/// Answer sent for the last reliable request, resent if the request is
/// retransmitted.
struct LastAnswer {
    to: StoneId,
    seq: u16,
    datagram: Vec<u8>,
}

struct LinkState {
    socket: Rc<UdpSocket>,
    dest: SocketAddr,
    own_id: StoneId,
    ttl: u8,
    retry_interval: Duration,
    next_seq: u16,
    recent: RecentFrames,
    pending: Option<PendingReliable>,
    /// `(source, seq)` of the reliable request being dispatched.
    answering: Option<(StoneId, u16)>,
    last_answer: Option<LastAnswer>,
}

impl LinkState {
    fn next_seq(&mut self) -> u16 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    fn datagram(&self, opcode: Opcode, dst: StoneId, seq: u16, envelope: &[u8]) -> Vec<u8> {
        let header = LinkHeader {
            opcode: opcode as u8,
            src: self.own_id,
            dst,
            ttl: self.ttl,
            hops: 0,
            seq: U16::new(seq),
        };
        let mut datagram = Vec::with_capacity(LINK_HEADER_SIZE + envelope.len());
        datagram.extend_from_slice(header.as_bytes());
        datagram.extend_from_slice(envelope);
        datagram
    }

    fn transmit(&self, datagram: &[u8]) -> Result<(), TransportError> {
        match self.socket.try_send_to(datagram, self.dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Busy),
            Err(e) => Err(TransportError::LinkDown(e.to_string())),
        }
    }

    fn answer(
        &mut self,
        opcode: Opcode,
        to: StoneId,
        seq: u16,
        envelope: &[u8],
    ) -> Result<(), TransportError> {
        let datagram = self.datagram(opcode, to, seq, envelope);
        let sent = self.transmit(&datagram);
        self.last_answer = Some(LastAnswer { to, seq, datagram });
        sent
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// The engine's side of the link.
pub struct UdpTransport {
    state: Rc<RefCell<LinkState>>,
}

impl MeshTransport for UdpTransport {
    fn send_best_effort(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let own_id = state.own_id;
        let seq = state.next_seq();
        let datagram = state.datagram(Opcode::Msg, BROADCAST_ID, seq, frame);
        state.recent.insert(Opcode::Msg, own_id, seq);
        state.transmit(&datagram)
    }

    fn send_reliable(
        &mut self,
        target: StoneId,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.pending.is_some() {
            return Err(TransportError::Busy);
        }
        let seq = state.next_seq();
        let datagram = state.datagram(Opcode::ReliableMsg, target, seq, frame);
        state.transmit(&datagram)?;
        let now = Instant::now();
        let next_retry = now + state.retry_interval;
        state.pending = Some(PendingReliable {
            datagram,
            target,
            seq,
            deadline: now + timeout,
            next_retry,
            attempts: 1,
        });
        Ok(())
    }

    fn reliable_slot_free(&self) -> bool {
        self.state.borrow().pending.is_none()
    }

    fn send_reply(&mut self, to: StoneId, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let answering = state.answering;
        match answering {
            Some((src, seq)) if src == to => {
                state.answering = None;
                state.answer(Opcode::Reply, to, seq, frame)
            }
            _ => Err(TransportError::Rejected(format!(
                "no reliable request from {to} to answer"
            ))),
        }
    }
}

// ── Run loop handle ───────────────────────────────────────────────────────────

/// The run loop's side of the link: receive, retransmit, time out.
pub struct Link {
    socket: Rc<UdpSocket>,
    state: Rc<RefCell<LinkState>>,
}

impl Link {
    /// Bind the multicast socket and build both halves of the link.
    pub fn open(
        network: &NetworkConfig,
        reliable: &ReliableConfig,
        own_id: StoneId,
    ) -> Result<(Link, UdpTransport)> {
        let interface_index = if_index(&network.interface)?;
        let socket = make_link_socket(interface_index, network.port)
            .context("failed to create mesh link socket")?;
        let socket =
            Rc::new(UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?);

        tracing::info!(
            interface = %network.interface,
            interface_index,
            port = network.port,
            ttl = network.ttl,
            "mesh link open"
        );

        let state = Rc::new(RefCell::new(LinkState {
            socket: socket.clone(),
            dest: SocketAddrV6::new(MULTICAST_ADDR, network.port, 0, interface_index).into(),
            own_id,
            ttl: network.ttl,
            retry_interval: Duration::from_millis(reliable.retry_interval_ms),
            next_seq: 0,
            recent: RecentFrames::default(),
            pending: None,
            answering: None,
            last_answer: None,
        }));
        Ok((
            Link {
                socket,
                state: state.clone(),
            },
            UdpTransport { state },
        ))
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, _from) = self.socket.recv_from(buf).await?;
        Ok(len)
    }

    /// Handle one received datagram: relay it, hand its envelope to the
    /// node, and settle the reliable slot.
    pub fn on_datagram(&self, datagram: &[u8], node: &mut MeshNode) {
        let Some((header, opcode, envelope)) = parse_datagram(datagram) else {
            tracing::trace!(len = datagram.len(), "unparseable datagram");
            return;
        };
        let src = header.src;
        let dst = header.dst;
        let seq = header.seq.get();

        {
            let mut state = self.state.borrow_mut();
            if src == state.own_id {
                return;
            }
            if !state.recent.insert(opcode, src, seq) {
                if opcode == Opcode::ReliableMsg && dst == state.own_id {
                    resend_answer(&state, src, seq);
                }
                tracing::trace!(src, seq, ?opcode, "duplicate datagram");
                return;
            }
            if opcode == Opcode::Msg && header.ttl > 1 {
                let mut relayed = header;
                relayed.ttl -= 1;
                relayed.hops = relayed.hops.saturating_add(1);
                let mut out = relayed.as_bytes().to_vec();
                out.extend_from_slice(envelope);
                if let Err(e) = state.transmit(&out) {
                    tracing::debug!(error = %e, src, seq, "relay failed");
                }
            }
        }

        let own_id = node.own_id();
        match opcode {
            Opcode::Msg => {
                if dst == BROADCAST_ID || dst == own_id {
                    node.on_frame(Inbound {
                        data: envelope,
                        source_id: src,
                        hops: header.hops,
                        rssi: None,
                        reply_requested: false,
                    });
                }
            }
            Opcode::ReliableMsg => {
                if dst != own_id {
                    return;
                }
                self.state.borrow_mut().answering = Some((src, seq));
                node.on_frame(Inbound {
                    data: envelope,
                    source_id: src,
                    hops: header.hops,
                    rssi: None,
                    reply_requested: true,
                });
                let mut state = self.state.borrow_mut();
                if state.answering.take().is_some() {
                    if let Err(e) = state.answer(Opcode::Ack, src, seq, &[]) {
                        tracing::debug!(error = %e, to = src, "ack not sent");
                    }
                }
            }
            Opcode::Reply | Opcode::Ack => {
                if dst != own_id {
                    return;
                }
                let matched = {
                    let mut state = self.state.borrow_mut();
                    let matches = state
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.target == src && p.seq == seq);
                    if matches {
                        state.pending = None;
                    }
                    matches
                };
                if opcode == Opcode::Reply && !envelope.is_empty() {
                    node.on_frame(Inbound {
                        data: envelope,
                        source_id: src,
                        hops: header.hops,
                        rssi: None,
                        reply_requested: false,
                    });
                }
                if matched {
                    node.on_reliable_complete(ReliableStatus::Success);
                } else {
                    tracing::debug!(src, seq, "answer for no pending request");
                }
            }
        }
    }

    /// Retransmit or expire the outstanding reliable send.
    pub fn poll(&self, now: Instant, node: &mut MeshNode) {
        let timed_out = {
            let mut state = self.state.borrow_mut();
            let retry_interval = state.retry_interval;
            let expired = state.pending.as_ref().is_some_and(|p| now >= p.deadline);
            if expired {
                if let Some(p) = state.pending.take() {
                    tracing::info!(
                        target_id = p.target,
                        seq = p.seq,
                        attempts = p.attempts,
                        "reliable send expired"
                    );
                }
                true
            } else {
                let retry = match state.pending.as_mut() {
                    Some(p) if now >= p.next_retry => {
                        p.next_retry = now + retry_interval;
                        p.attempts += 1;
                        Some(p.datagram.clone())
                    }
                    _ => None,
                };
                if let Some(datagram) = retry {
                    if let Err(e) = state.transmit(&datagram) {
                        tracing::debug!(error = %e, "reliable retransmit failed");
                    }
                }
                false
            }
        };
        if timed_out {
            node.on_reliable_complete(ReliableStatus::Timeout);
        }
    }

    /// Drop the outstanding reliable send on shutdown.
    pub fn cancel_pending(&self, node: &mut MeshNode) {
        let cancelled = self.state.borrow_mut().pending.take().is_some();
        if cancelled {
            node.on_reliable_complete(ReliableStatus::Cancelled);
        }
    }
}

fn resend_answer(state: &LinkState, src: StoneId, seq: u16) {
    if let Some(last) = &state.last_answer {
        if last.to == src && last.seq == seq {
            if let Err(e) = state.transmit(&last.datagram) {
                tracing::debug!(error = %e, to = src, "answer resend failed");
            }
        }
    }
}

// ── Socket setup ──────────────────────────────────────────────────────────────

/// Bound to the shared port, joined to ff02::1, sending on the same group.
fn make_link_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    // Several nodes may share one host.
    socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

/// OS interface index for a named interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
