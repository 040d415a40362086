//! In-process relay server backing `/host`.
//!
//! A single room on the client's own reactor: it fans inputs out between
//! peers, assigns netplay ports at game start, and measures latency with a
//! periodic ping round. It lives exactly as long as the hosting client's
//! session; `close()` tears it down.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use padlink_proto::{
    framing::{encode_frame, encode_frame_bytes},
    MsgId, Packet, ProtoError, MAX_PLAYERS, PROTOCOL_VERSION,
};

use crate::{
    controller::{Controller, ControllerMap},
    error::ClientError,
    session::{put_controller, put_name, read_controller},
    tcp::{read_frame, writer_loop},
};

const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Frame period the automatic lag calculation assumes.
const FRAME_MS: f64 = 1000.0 / 60.0;

/// Automatic lag never exceeds this many frames.
const MAX_AUTOLAG: u8 = 30;

/// Owned handle to the hosted server. Aborting the room task drops every
/// per-connection writer, which collapses the connections.
pub(crate) struct ServerHandle {
    port: u16,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn shutdown(&self) {
        self.task.abort();
    }
}

/// Bind the listener and start the room. Port 0 picks an ephemeral port;
/// the actual port is in the returned handle. Must be called on the
/// reactor.
pub(crate) fn open(port: u16, lag: u8) -> Result<ServerHandle, ClientError> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let port = listener.local_addr()?.port();

    info!(port, "hosting relay server");
    let task = tokio::spawn(run(listener, lag));
    Ok(ServerHandle { port, task })
}

enum PeerEvent {
    Packet { id: u32, packet: Packet },
    Closed { id: u32 },
}

struct Peer {
    name: String,
    /// False until the JOIN handshake lands.
    joined: bool,
    controllers: [Controller; MAX_PLAYERS],
    map: ControllerMap,
    /// Last measured round trip, in milliseconds.
    latency: u32,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Room {
    peers: BTreeMap<u32, Peer>,
    next_id: u32,
    lag: u8,
    autolag: bool,
    started: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

async fn run(listener: TcpListener, lag: u8) {
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut room = Room::new(lag, event_tx);
    let mut ping = time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => room.accept(stream, addr),
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(event) = events.recv() => match event {
                PeerEvent::Packet { id, packet } => {
                    if let Err(e) = room.handle_packet(id, packet) {
                        debug!(id, error = %e, "malformed packet from peer");
                        room.remove_peer(id);
                    }
                }
                PeerEvent::Closed { id } => room.remove_peer(id),
            },
            _ = ping.tick() => room.ping_round(),
        }
    }
}

impl Room {
    fn new(lag: u8, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: 1,
            lag,
            autolag: false,
            started: false,
            events,
        }
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (mut read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(write, rx));

        let id = self.next_id;
        self.next_id += 1;
        debug!(id, %addr, "peer connected");

        let mut version = Packet::for_msg(MsgId::Version);
        version.put_u32(PROTOCOL_VERSION);
        send_to(&tx, &version);

        if self.started {
            // Late joiners are turned away; the writer drains the refusal
            // before the dropped channel closes the socket.
            send_message(&tx, -2, "Game is already in progress");
            return;
        }

        self.peers.insert(
            id,
            Peer {
                name: String::new(),
                joined: false,
                controllers: Default::default(),
                map: ControllerMap::default(),
                latency: 0,
                tx,
            },
        );

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read).await {
                    Ok(Some(packet)) => {
                        if packet.is_empty() {
                            continue;
                        }
                        if events.send(PeerEvent::Packet { id, packet }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(id, error = %e, "peer read failed");
                        break;
                    }
                }
            }
            let _ = events.send(PeerEvent::Closed { id });
        });
    }

    fn handle_packet(&mut self, id: u32, mut p: Packet) -> Result<(), ProtoError> {
        let kind = p.read_u8()?;
        let Some(kind) = MsgId::from_repr(kind) else {
            return Ok(());
        };

        match kind {
            MsgId::Join => self.handle_join(id, &mut p)?,

            MsgId::Name => {
                let len = p.read_u8()? as usize;
                let name = p.read_string(len)?;
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.name = name.clone();
                }
                let mut out = Packet::for_msg(MsgId::Name);
                out.put_u32(id);
                put_name(&mut out, &name);
                self.broadcast(&out);
            }

            MsgId::Message => {
                let len = p.read_u16()? as usize;
                let text = p.read_string(len)?;
                let mut out = Packet::for_msg(MsgId::Message);
                out.put_i32(id as i32);
                out.put_u16(text.len().min(u16::MAX as usize) as u16);
                out.put_str(&text);
                self.send_to_others(id, &out);
            }

            MsgId::Controllers => {
                let mut controllers = [Controller::default(); MAX_PLAYERS];
                for controller in &mut controllers {
                    *controller = read_controller(&mut p)?;
                    controller.raw_data = false;
                }
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.controllers = controllers;
                }
                self.broadcast_user_controllers(id);
            }

            MsgId::Start => self.start_game(),

            MsgId::InputData => self.relay_to_others(id, p.as_slice()),

            MsgId::Lag => {
                self.lag = p.read_u8()?;
                self.relay_to_others(id, p.as_slice());
            }

            MsgId::Autolag => self.toggle_autolag(),

            MsgId::Pong => {
                let sent = p.read_u64()?;
                let rtt = now_ms().saturating_sub(sent) as u32;
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.latency = rtt;
                }
            }

            // Frame markers only matter between the peers themselves.
            MsgId::Frame => {}

            other => debug!(id, ?other, "ignoring unexpected message"),
        }

        Ok(())
    }

    fn handle_join(&mut self, id: u32, p: &mut Packet) -> Result<(), ProtoError> {
        let version = p.read_u32()?;
        let len = p.read_u8()? as usize;
        let name = p.read_string(len)?;
        let mut controllers = [Controller::default(); MAX_PLAYERS];
        for controller in &mut controllers {
            *controller = read_controller(p)?;
            controller.raw_data = false;
        }

        if version != PROTOCOL_VERSION {
            if let Some(peer) = self.peers.remove(&id) {
                send_message(
                    &peer.tx,
                    -2,
                    "Client protocol version does not match server protocol version",
                );
            }
            return Ok(());
        }

        // Replay the room to the newcomer before announcing them.
        if let Some(peer) = self.peers.get(&id) {
            for (&other_id, other) in &self.peers {
                if other_id != id && other.joined {
                    let mut join = Packet::for_msg(MsgId::Join);
                    join.put_u32(other_id);
                    put_name(&mut join, &other.name);
                    send_to(&peer.tx, &join);
                }
            }
            let mut lag = Packet::for_msg(MsgId::Lag);
            lag.put_u8(self.lag);
            send_to(&peer.tx, &lag);
        }

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.name = name.clone();
            peer.controllers = controllers;
            peer.joined = true;
        }
        info!(id, name = %name, "peer joined");

        let mut join = Packet::for_msg(MsgId::Join);
        join.put_u32(id);
        put_name(&mut join, &name);
        self.broadcast(&join);

        Ok(())
    }

    /// Share one user's layout (and current assignment) with the room.
    fn broadcast_user_controllers(&mut self, id: u32) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let mut out = Packet::for_msg(MsgId::Controllers);
        out.put_i32(id as i32);
        for controller in &peer.controllers {
            put_controller(&mut out, controller);
        }
        for slot in peer.map.local_to_netplay {
            out.put_i8(slot);
        }
        self.broadcast(&out);
    }

    /// Freeze port assignment and start the game everywhere.
    ///
    /// Netplay ports go to present local pads in user-id order; each peer
    /// then receives the authoritative layout together with its own
    /// local→netplay map.
    fn start_game(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let mut netplay = [Controller::default(); MAX_PLAYERS];
        let mut next = 0usize;
        for peer in self.peers.values_mut().filter(|p| p.joined) {
            peer.map = ControllerMap::default();
            for local in 0..MAX_PLAYERS {
                if peer.controllers[local].present && next < MAX_PLAYERS {
                    netplay[next] = peer.controllers[local];
                    peer.map.insert(local, next);
                    next += 1;
                }
            }
        }

        for peer in self.peers.values().filter(|p| p.joined) {
            let mut out = Packet::for_msg(MsgId::Controllers);
            out.put_i32(-1);
            for controller in &netplay {
                put_controller(&mut out, controller);
            }
            for slot in peer.map.local_to_netplay {
                out.put_i8(slot);
            }
            send_to(&peer.tx, &out);
        }

        info!(ports = next, "starting game");
        self.broadcast(&Packet::for_msg(MsgId::Start));
    }

    fn toggle_autolag(&mut self) {
        self.autolag = !self.autolag;
        let text = if self.autolag {
            "Automatic lag is enabled"
        } else {
            "Automatic lag is disabled"
        };
        for peer in self.peers.values().filter(|p| p.joined) {
            send_message(&peer.tx, -1, text);
        }
    }

    /// Broadcast the latency table, recompute automatic lag, and start the
    /// next measurement.
    fn ping_round(&mut self) {
        let mut latency = Packet::for_msg(MsgId::Latency);
        for (&id, peer) in self.peers.iter().filter(|(_, p)| p.joined) {
            latency.put_u32(id);
            latency.put_u32(peer.latency);
        }
        if latency.len() > 1 {
            self.broadcast(&latency);
        }

        self.apply_autolag();

        let mut ping = Packet::for_msg(MsgId::Ping);
        ping.put_u64(now_ms());
        self.broadcast(&ping);
    }

    fn apply_autolag(&mut self) {
        if !self.autolag {
            return;
        }
        let Some(worst) = self
            .peers
            .values()
            .filter(|p| p.joined)
            .map(|p| p.latency)
            .max()
        else {
            return;
        };

        let target = autolag_target(worst);
        if target != self.lag {
            self.lag = target;
            let mut out = Packet::for_msg(MsgId::Lag);
            out.put_u8(target);
            self.broadcast(&out);
        }
    }

    fn remove_peer(&mut self, id: u32) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        debug!(id, name = %peer.name, "peer disconnected");
        if peer.joined {
            let mut quit = Packet::for_msg(MsgId::Quit);
            quit.put_u32(id);
            self.broadcast(&quit);
        }
    }

    fn broadcast(&self, packet: &Packet) {
        let Ok(frame) = encode_frame(packet) else {
            return;
        };
        for peer in self.peers.values().filter(|p| p.joined) {
            let _ = peer.tx.send(frame.clone());
        }
    }

    fn send_to_others(&self, from: u32, packet: &Packet) {
        let Ok(frame) = encode_frame(packet) else {
            return;
        };
        for (&id, peer) in &self.peers {
            if id != from && peer.joined {
                let _ = peer.tx.send(frame.clone());
            }
        }
    }

    /// Forward an inbound payload verbatim to everyone but the sender.
    fn relay_to_others(&self, from: u32, payload: &[u8]) {
        let Ok(frame) = encode_frame_bytes(payload) else {
            return;
        };
        for (&id, peer) in &self.peers {
            if id != from && peer.joined {
                let _ = peer.tx.send(frame.clone());
            }
        }
    }
}

fn send_to(tx: &mpsc::UnboundedSender<Bytes>, packet: &Packet) {
    if let Ok(frame) = encode_frame(packet) {
        let _ = tx.send(frame);
    }
}

fn send_message(tx: &mpsc::UnboundedSender<Bytes>, from: i32, text: &str) {
    let mut p = Packet::for_msg(MsgId::Message);
    p.put_i32(from);
    p.put_u16(text.len().min(u16::MAX as usize) as u16);
    p.put_str(text);
    send_to(tx, &p);
}

/// Lag that hides one-way latency at a 60 Hz frame rate, with one frame of
/// margin.
fn autolag_target(worst_rtt_ms: u32) -> u8 {
    let one_way = worst_rtt_ms as f64 / 2.0;
    let frames = (one_way / FRAME_MS).ceil() as u8;
    frames.saturating_add(1).min(MAX_AUTOLAG)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
