//! The reactor-owned session: connection lifecycle, protocol state machine,
//! frame engine, and slash-command processing.
//!
//! Everything here runs on the reactor thread. The only structures touched
//! from outside are the [`Shared`] queues/latch/mask, which is what lets
//! the emulator's `get_input` stay off the reactor entirely.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use padlink_proto::{
    framing::encode_frame, MsgId, Packet, DEFAULT_LAG, DEFAULT_PORT, MAX_PLAYERS, PROTOCOL_VERSION,
};

use crate::{
    controller::{Buttons, Controller, ControllerMap},
    events::{ClientEvent, UserInfo},
    server::{self, ServerHandle},
    shared::Shared,
    tcp::{self, CloseReason, NetEvent},
};

/// A remote participant as reported by the server.
#[derive(Debug, Clone, Default)]
struct User {
    name: String,
    latency: u32,
    controllers: [Controller; MAX_PLAYERS],
    control_map: ControllerMap,
}

pub(crate) struct Session {
    name: String,
    lag: u8,
    frame: u32,
    golf: bool,

    local_controllers: [Controller; MAX_PLAYERS],
    netplay_controllers: [Controller; MAX_PLAYERS],
    controller_map: ControllerMap,
    users: BTreeMap<u32, User>,

    shared: Arc<Shared>,

    /// Writer channel of the live connection, if any.
    socket_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// The connect/read task for the current epoch; aborting it cancels the
    /// in-flight resolve, connect, or read.
    net_task: Option<JoinHandle<()>>,
    /// Bumped on every connect and close; socket events from older epochs
    /// are stale and ignored.
    epoch: u64,
    /// In-process server owned after `/host`.
    server: Option<ServerHandle>,

    events: mpsc::UnboundedSender<ClientEvent>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<ClientEvent>,
        net_tx: mpsc::UnboundedSender<NetEvent>,
    ) -> Self {
        let session = Self {
            name: String::new(),
            lag: DEFAULT_LAG,
            frame: 0,
            golf: false,
            local_controllers: Default::default(),
            netplay_controllers: Default::default(),
            controller_map: ControllerMap::default(),
            users: BTreeMap::new(),
            shared,
            socket_tx: None,
            net_task: None,
            epoch: 0,
            server: None,
            events,
            net_tx,
        };

        session.status(
            "List of available commands:\n\
             - /name <name>            Set your name\n\
             - /host [port]            Host a server\n\
             - /join <address> [port]  Join a server\n\
             - /start                  Start the game\n\
             - /lag <lag>              Set the netplay input lag\n\
             - /autolag                Toggle automatic lag on and off\n\
             - /golf                   Toggle golf mode on and off",
        );

        session
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    // ---- dialog feed ----------------------------------------------------

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, text: impl Into<String>) {
        self.emit(ClientEvent::Status(text.into()));
    }

    fn report_error(&self, text: impl Into<String>) {
        self.emit(ClientEvent::Error(text.into()));
    }

    fn roster_changed(&self) {
        let roster = self
            .users
            .iter()
            .map(|(&id, user)| UserInfo {
                id,
                name: user.name.clone(),
                latency: user.latency,
            })
            .collect();
        self.emit(ClientEvent::Roster(roster));
    }

    // ---- facade entry points --------------------------------------------

    pub(crate) fn set_name(&mut self, name: String) {
        self.status(format!("Your name is {name}"));
        self.name = name;
    }

    pub(crate) fn set_local_controllers(&mut self, mut controllers: [Controller; MAX_PLAYERS]) {
        // Raw pads cannot be relayed; admit them as cooked.
        for controller in &mut controllers {
            controller.raw_data = false;
        }
        self.local_controllers = controllers;
        self.send_controllers();
    }

    pub(crate) fn set_netplay_controllers(&mut self, controllers: [Controller; MAX_PLAYERS]) {
        self.netplay_controllers = controllers;
        self.sync_present_mask();
    }

    /// One emulator frame: publish local inputs under the lag discipline,
    /// then announce the frame boundary.
    pub(crate) fn process_input(&mut self, input: [Buttons; MAX_PLAYERS]) {
        for port in 0..MAX_PLAYERS {
            if let Some(local) = self.controller_map.to_local(port) {
                let buttons = input[local];
                if self.golf && self.lag != 0 && buttons.z_trig() {
                    // Commit to the swing: everyone else keeps the old lag,
                    // we drop to zero.
                    let lag = self.lag;
                    self.send_lag(lag);
                    self.set_lag(0, false);
                }
                // First call primes the pipeline with lag+1 copies; steady
                // state pushes exactly once. Depth lands at lag+1.
                while self.shared.queues.len(port) <= self.lag as usize {
                    self.shared.queues.push(port, buttons);
                    self.send_input(port as u8, buttons);
                }
            } else if self.netplay_controllers[port].present && self.socket_tx.is_none() {
                // Standalone: nobody feeds this port, keep it neutral.
                while self.shared.queues.len(port) <= self.lag as usize {
                    self.shared.queues.push(port, Buttons::default());
                }
            }
        }

        self.send_frame();
        self.frame += 1;
    }

    /// Tear-down posted by the emulator: drop the connection, then run the
    /// rest of the session standalone so blocked callers drain out.
    pub(crate) fn post_close(&mut self) {
        let had_socket = self.socket_tx.is_some();
        self.close();
        if had_socket {
            self.shared.queues.push_sentinels();
        }
        self.map_local_to_netplay();
        self.start_game();
    }

    /// Final teardown when the reactor loop exits.
    pub(crate) fn shutdown(&mut self) {
        self.close();
        self.shared.queues.push_sentinels();
    }

    // ---- slash commands --------------------------------------------------

    pub(crate) fn process_message(&mut self, message: &str) {
        if !message.starts_with('/') {
            let name = self.name.clone();
            self.emit(ClientEvent::Chat {
                name,
                message: message.to_string(),
            });
            self.send_chat(message);
            return;
        }

        let params: Vec<&str> = message.split_whitespace().collect();
        let Some(&command) = params.first() else {
            return;
        };

        match command {
            "/name" => match params.get(1) {
                Some(&name) => {
                    self.name = name.to_string();
                    self.status(format!("Your name is now {name}"));
                    self.send_name();
                }
                None => self.report_error("Missing parameter"),
            },

            "/host" | "/server" => {
                if self.shared.start.is_set() {
                    self.report_error("Game has already started");
                    return;
                }
                let port = match params.get(1) {
                    Some(arg) => match arg.parse::<u16>() {
                        Ok(port) => port,
                        Err(e) => return self.report_error(e.to_string()),
                    },
                    None => DEFAULT_PORT,
                };

                self.close();
                match server::open(port, self.lag) {
                    Ok(handle) => {
                        let port = handle.port();
                        self.server = Some(handle);
                        self.status(format!("Server is listening on port {port}..."));
                        self.emit(ClientEvent::HostStarted { port });
                        self.connect("127.0.0.1".to_string(), port);
                    }
                    Err(e) => self.report_error(e.to_string()),
                }
            }

            "/join" | "/connect" => {
                if self.shared.start.is_set() {
                    self.report_error("Game has already started");
                    return;
                }
                let Some(&host) = params.get(1) else {
                    return self.report_error("Missing parameter");
                };
                let port = match params.get(2) {
                    Some(arg) => match arg.parse::<u16>() {
                        Ok(port) => port,
                        Err(e) => return self.report_error(e.to_string()),
                    },
                    None => DEFAULT_PORT,
                };

                self.close();
                self.connect(host.to_string(), port);
            }

            "/start" => {
                if self.shared.start.is_set() {
                    self.report_error("Game has already started");
                    return;
                }
                if self.socket_tx.is_some() {
                    self.send_start_game();
                } else {
                    self.map_local_to_netplay();
                    self.set_lag(0, true);
                    self.start_game();
                }
            }

            "/lag" => {
                if let Some(lag) = self.lag_param(&params) {
                    self.set_lag(lag, true);
                    self.send_lag(lag);
                }
            }

            "/my_lag" => {
                if let Some(lag) = self.lag_param(&params) {
                    self.set_lag(lag, true);
                }
            }

            "/your_lag" => {
                if let Some(lag) = self.lag_param(&params) {
                    self.send_lag(lag);
                }
            }

            "/autolag" => self.send_autolag(),

            "/golf" => {
                self.golf = !self.golf;
                self.status(if self.golf {
                    "Golf mode is enabled"
                } else {
                    "Golf mode is disabled"
                });
            }

            other => self.report_error(format!("Unknown command: {other}")),
        }
    }

    fn lag_param(&mut self, params: &[&str]) -> Option<u8> {
        let Some(arg) = params.get(1) else {
            self.report_error("Missing parameter");
            return None;
        };
        match arg.parse::<u8>() {
            Ok(lag) => Some(lag),
            Err(e) => {
                self.report_error(e.to_string());
                None
            }
        }
    }

    // ---- session state ---------------------------------------------------

    fn set_lag(&mut self, lag: u8, announce: bool) {
        self.lag = lag;
        if announce {
            self.status(format!("Your lag is set to {lag}"));
        }
    }

    /// Adopt the local layout as the netplay layout with the identity port
    /// mapping. Standalone sessions start from here.
    fn map_local_to_netplay(&mut self) {
        self.netplay_controllers = self.local_controllers;
        for port in 0..MAX_PLAYERS {
            if self.local_controllers[port].present {
                self.controller_map.insert(port, port);
            }
        }
        self.sync_present_mask();
    }

    fn sync_present_mask(&self) {
        let mut mask = 0u8;
        for (port, controller) in self.netplay_controllers.iter().enumerate() {
            if controller.present {
                mask |= 1 << port;
            }
        }
        self.shared.set_present_mask(mask);
    }

    fn start_game(&mut self) {
        if self.shared.start.set() {
            info!("game started");
            self.status("Starting game...");
        }
    }

    fn remove_user(&mut self, user_id: u32) {
        if let Some(user) = self.users.remove(&user_id) {
            self.status(format!("{} has quit", user.name));
        }
        self.roster_changed();
    }

    fn chat_received(&mut self, user_id: i32, message: String) {
        match user_id {
            -2 => self.report_error(message),
            -1 => self.status(message),
            id => {
                let name = self
                    .users
                    .get(&(id as u32))
                    .map(|user| user.name.clone())
                    .unwrap_or_default();
                self.emit(ClientEvent::Chat { name, message });
            }
        }
    }

    // ---- connection lifecycle --------------------------------------------

    pub(crate) fn connect(&mut self, host: String, port: u16) {
        self.status(format!("Connecting to {host}:{port}..."));
        self.epoch += 1;
        let epoch = self.epoch;
        self.net_task = Some(tokio::spawn(tcp::connect_and_read(
            host,
            port,
            epoch,
            self.net_tx.clone(),
        )));
    }

    /// Deliberate disconnect: cancel any in-flight resolve/read, drop the
    /// socket, shut down the owned server, clear the roster.
    fn close(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.net_task.take() {
            task.abort();
        }
        self.socket_tx = None;
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        self.users.clear();
        self.roster_changed();
    }

    /// Failure path: close, unblock the emulator, tell the user.
    fn fail(&mut self, message: impl Into<String>) {
        self.close();
        self.shared.queues.push_sentinels();
        self.report_error(message.into());
    }

    pub(crate) fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { epoch, tx } if epoch == self.epoch => {
                self.socket_tx = Some(tx);
                self.status("Connected!");
                self.send_join();
            }
            NetEvent::ConnectFailed { epoch, error } if epoch == self.epoch => {
                self.net_task = None;
                self.report_error(error.to_string());
            }
            NetEvent::Packet { epoch, packet } if epoch == self.epoch => {
                if packet.is_empty() {
                    // Keep-alive.
                    return;
                }
                if let Err(e) = self.handle_packet(packet) {
                    self.fail(format!("Protocol error: {e}"));
                }
            }
            NetEvent::Closed { epoch, reason } if epoch == self.epoch => {
                self.net_task = None;
                match reason {
                    CloseReason::Eof => self.fail("Disconnected from server"),
                    CloseReason::Error(message) => self.fail(message),
                }
            }
            stale => debug!(?stale, "dropping event from superseded connection"),
        }
    }

    // ---- inbound protocol ------------------------------------------------

    fn handle_packet(&mut self, mut p: Packet) -> Result<(), padlink_proto::ProtoError> {
        let kind = p.read_u8()?;
        let Some(kind) = MsgId::from_repr(kind) else {
            debug!(kind, "ignoring unknown message type");
            return Ok(());
        };

        match kind {
            MsgId::Version => {
                let version = p.read_u32()?;
                if version != PROTOCOL_VERSION {
                    self.fail(
                        "Server protocol version does not match client protocol version",
                    );
                }
            }

            MsgId::Join => {
                let user_id = p.read_u32()?;
                let len = p.read_u8()? as usize;
                let name = p.read_string(len)?;
                self.status(format!("{name} has joined"));
                self.users.entry(user_id).or_default().name = name;
                self.roster_changed();
            }

            MsgId::Ping => {
                let timestamp = p.read_u64()?;
                self.send_pong(timestamp);
            }

            MsgId::Latency => {
                while p.bytes_remaining() >= 8 {
                    let user_id = p.read_u32()?;
                    let latency = p.read_u32()?;
                    if let Some(user) = self.users.get_mut(&user_id) {
                        user.latency = latency;
                    }
                }
                self.roster_changed();
            }

            MsgId::Name => {
                let user_id = p.read_u32()?;
                let len = p.read_u8()? as usize;
                let name = p.read_string(len)?;
                let user = self.users.entry(user_id).or_default();
                let old = std::mem::replace(&mut user.name, name.clone());
                self.status(format!("{old} is now {name}"));
                self.roster_changed();
            }

            MsgId::Quit => {
                let user_id = p.read_u32()?;
                self.remove_user(user_id);
            }

            MsgId::Message => {
                let user_id = p.read_i32()?;
                let len = p.read_u16()? as usize;
                let message = p.read_string(len)?;
                self.chat_received(user_id, message);
            }

            MsgId::Controllers => {
                let user_id = p.read_i32()?;
                let mut controllers = [Controller::default(); MAX_PLAYERS];
                for controller in &mut controllers {
                    *controller = read_controller(&mut p)?;
                }
                let mut map = ControllerMap::default();
                for slot in &mut map.local_to_netplay {
                    *slot = p.read_i8()?;
                }

                if user_id == -1 {
                    // Authoritative layout plus this peer's assignment.
                    self.netplay_controllers = controllers;
                    self.controller_map = map;
                    self.sync_present_mask();
                } else {
                    let user = self.users.entry(user_id as u32).or_default();
                    user.controllers = controllers;
                    user.control_map = map;
                    self.roster_changed();
                }
            }

            MsgId::Start => self.start_game(),

            MsgId::InputData => {
                let port = p.read_u8()? as usize;
                let buttons = Buttons(p.read_u32()?);
                // A bogus port must not kill the session; drop it on the
                // floor instead.
                match self.shared.queues.get(port) {
                    Some(queue) => queue.push(buttons),
                    None => debug!(port, "input for nonexistent port"),
                }
            }

            MsgId::Lag => {
                let lag = p.read_u8()?;
                self.set_lag(lag, false);
            }

            other => debug!(?other, "ignoring unexpected message"),
        }

        Ok(())
    }

    // ---- outbound protocol -----------------------------------------------

    fn send(&self, packet: Packet) {
        let Some(tx) = &self.socket_tx else {
            return;
        };
        match encode_frame(&packet) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => warn!(error = %e, "dropping oversized outbound packet"),
        }
    }

    fn send_join(&self) {
        let mut p = Packet::for_msg(MsgId::Join);
        p.put_u32(PROTOCOL_VERSION);
        put_name(&mut p, &self.name);
        for controller in &self.local_controllers {
            put_controller(&mut p, controller);
        }
        self.send(p);
    }

    fn send_name(&self) {
        let mut p = Packet::for_msg(MsgId::Name);
        put_name(&mut p, &self.name);
        self.send(p);
    }

    fn send_chat(&self, message: &str) {
        let bytes = message.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        let mut p = Packet::for_msg(MsgId::Message);
        p.put_u16(len as u16);
        p.put_slice(&bytes[..len]);
        self.send(p);
    }

    fn send_controllers(&self) {
        let mut p = Packet::for_msg(MsgId::Controllers);
        for controller in &self.local_controllers {
            put_controller(&mut p, controller);
        }
        self.send(p);
    }

    fn send_start_game(&self) {
        let mut p = Packet::for_msg(MsgId::Start);
        // The peer expects one trailing octet here.
        p.put_u8(0);
        self.send(p);
    }

    fn send_lag(&self, lag: u8) {
        let mut p = Packet::for_msg(MsgId::Lag);
        p.put_u8(lag);
        self.send(p);
    }

    fn send_autolag(&self) {
        if self.socket_tx.is_none() {
            return self.report_error("Cannot toggle automatic lag unless connected to server");
        }
        self.send(Packet::for_msg(MsgId::Autolag));
    }

    fn send_input(&self, port: u8, buttons: Buttons) {
        let mut p = Packet::for_msg(MsgId::InputData);
        p.put_u8(port);
        p.put_u32(buttons.0);
        self.send(p);
    }

    fn send_frame(&self) {
        let mut p = Packet::for_msg(MsgId::Frame);
        p.put_u32(self.frame);
        self.send(p);
    }

    fn send_pong(&self, timestamp: u64) {
        let mut p = Packet::for_msg(MsgId::Pong);
        p.put_u64(timestamp);
        self.send(p);
    }
}

pub(crate) fn put_name(p: &mut Packet, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    p.put_u8(len as u8);
    p.put_slice(&bytes[..len]);
}

pub(crate) fn put_controller(p: &mut Packet, controller: &Controller) {
    p.put_u8(controller.plugin);
    p.put_u8(controller.present as u8);
    p.put_u8(controller.raw_data as u8);
}

pub(crate) fn read_controller(p: &mut Packet) -> Result<Controller, padlink_proto::ProtoError> {
    Ok(Controller {
        plugin: p.read_u8()?,
        present: p.read_u8()? != 0,
        raw_data: p.read_u8()? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        session: Session,
        events: UnboundedReceiver<ClientEvent>,
        wire: UnboundedReceiver<Bytes>,
        _net: UnboundedReceiver<NetEvent>,
    }

    impl Harness {
        fn standalone() -> Self {
            let (event_tx, events) = mpsc::unbounded_channel();
            let (net_tx, net_rx) = mpsc::unbounded_channel();
            let (_, wire) = mpsc::unbounded_channel();
            let session = Session::new(Arc::new(Shared::default()), event_tx, net_tx);
            let mut harness = Self {
                session,
                events,
                wire,
                _net: net_rx,
            };
            harness.drain_events();
            harness
        }

        fn connected() -> Self {
            let mut harness = Self::standalone();
            let (wire_tx, wire) = mpsc::unbounded_channel();
            harness.session.socket_tx = Some(wire_tx);
            harness.wire = wire;
            harness
        }

        /// Feed an inbound packet as if the read loop produced it.
        fn deliver(&mut self, packet: Packet) {
            let epoch = self.session.epoch;
            self.session.handle_net_event(NetEvent::Packet { epoch, packet });
        }

        fn next_wire(&mut self) -> Packet {
            let frame = self.wire.try_recv().expect("expected an outbound frame");
            Packet::from_payload(&frame[4..])
        }

        fn assert_wire_idle(&mut self) {
            assert!(self.wire.try_recv().is_err(), "unexpected outbound frame");
        }

        fn next_event(&mut self) -> ClientEvent {
            self.events.try_recv().expect("expected a dialog event")
        }

        fn drain_events(&mut self) -> Vec<ClientEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }

        fn queue_len(&self, port: usize) -> usize {
            self.session.shared.queues.len(port)
        }
    }

    fn pad(b: Buttons) -> [Buttons; MAX_PLAYERS] {
        [b, Buttons(0), Buttons(0), Buttons(0)]
    }

    fn join_packet(user_id: u32, name: &str) -> Packet {
        let mut p = Packet::for_msg(MsgId::Join);
        p.put_u32(user_id);
        put_name(&mut p, name);
        p
    }

    fn message_packet(user_id: i32, text: &str) -> Packet {
        let mut p = Packet::for_msg(MsgId::Message);
        p.put_i32(user_id);
        p.put_u16(text.len() as u16);
        p.put_str(text);
        p
    }

    #[test]
    fn first_frame_primes_queue_to_lag_plus_one() {
        let mut h = Harness::connected();
        h.session.lag = 2;
        h.session.controller_map.insert(0, 0);
        h.session.netplay_controllers[0].present = true;
        h.session.sync_present_mask();

        let a = Buttons(0x10);
        h.session.process_input(pad(a));

        // Priming: lag+1 pushes, each mirrored on the wire.
        assert_eq!(h.queue_len(0), 3);
        for _ in 0..3 {
            let mut p = h.next_wire();
            assert_eq!(p.read_u8().unwrap(), MsgId::InputData as u8);
            assert_eq!(p.read_u8().unwrap(), 0);
            assert_eq!(p.read_u32().unwrap(), 0x10);
        }
        let mut frame = h.next_wire();
        assert_eq!(frame.read_u8().unwrap(), MsgId::Frame as u8);
        assert_eq!(frame.read_u32().unwrap(), 0);
        h.assert_wire_idle();

        assert_eq!(h.session.shared.queues.pop(0), a);
        assert_eq!(h.queue_len(0), 2);
    }

    #[test]
    fn steady_frame_pushes_exactly_once() {
        let mut h = Harness::connected();
        h.session.lag = 2;
        h.session.controller_map.insert(0, 0);
        h.session.netplay_controllers[0].present = true;
        h.session.sync_present_mask();

        let a = Buttons(0x10);
        h.session.process_input(pad(a));
        assert_eq!(h.session.shared.queues.pop(0), a);
        h.drain_events();
        while h.wire.try_recv().is_ok() {}

        let b = Buttons(0x20);
        h.session.process_input(pad(b));

        let mut input = h.next_wire();
        assert_eq!(input.read_u8().unwrap(), MsgId::InputData as u8);
        assert_eq!(input.read_u8().unwrap(), 0);
        assert_eq!(input.read_u32().unwrap(), 0x20);
        let mut frame = h.next_wire();
        assert_eq!(frame.read_u8().unwrap(), MsgId::Frame as u8);
        assert_eq!(frame.read_u32().unwrap(), 1);
        h.assert_wire_idle();

        assert_eq!(h.queue_len(0), 3);
        assert_eq!(h.session.shared.queues.pop(0), a);
        assert_eq!(h.queue_len(0), 2);
    }

    #[test]
    fn golf_z_press_drops_lag_and_tells_the_server() {
        let mut h = Harness::connected();
        h.session.golf = true;
        h.session.controller_map.insert(0, 0);
        h.session.netplay_controllers[0].present = true;
        h.session.sync_present_mask();
        assert_eq!(h.session.lag, 5);

        let z = Buttons(Buttons::Z_TRIG);
        h.session.process_input(pad(z));

        assert_eq!(h.session.lag, 0);
        // LAG carries the old value, before any input goes out.
        let mut lag = h.next_wire();
        assert_eq!(lag.read_u8().unwrap(), MsgId::Lag as u8);
        assert_eq!(lag.read_u8().unwrap(), 5);
        let mut input = h.next_wire();
        assert_eq!(input.read_u8().unwrap(), MsgId::InputData as u8);
        let mut frame = h.next_wire();
        assert_eq!(frame.read_u8().unwrap(), MsgId::Frame as u8);
        h.assert_wire_idle();

        assert_eq!(h.queue_len(0), 1);
        // The drop is silent.
        assert!(h
            .drain_events()
            .iter()
            .all(|e| !matches!(e, ClientEvent::Status(s) if s.contains("lag"))));
    }

    #[test]
    fn standalone_start_runs_without_a_server() {
        let mut h = Harness::standalone();
        h.session.local_controllers[0].present = true;
        h.session.local_controllers[1].present = true;

        h.session.process_message("/start");

        assert!(h.session.shared.start.is_set());
        assert_eq!(h.session.lag, 0);
        assert_eq!(h.session.controller_map.to_local(0), Some(0));
        assert_eq!(h.session.controller_map.to_local(1), Some(1));
        assert!(h.session.shared.is_present(0));
        assert!(h.session.shared.is_present(1));
        assert!(!h.session.shared.is_present(2));

        let a = Buttons(1);
        let b = Buttons(2);
        h.session
            .process_input([a, b, Buttons(0), Buttons(0)]);

        assert_eq!(h.queue_len(0), 1);
        assert_eq!(h.queue_len(1), 1);
        assert_eq!(h.queue_len(2), 0);
        h.assert_wire_idle();
        assert_eq!(h.session.shared.queues.pop(0), a);
        assert_eq!(h.session.shared.queues.pop(1), b);
    }

    #[test]
    fn start_is_sticky_and_idempotent() {
        let mut h = Harness::standalone();
        h.session.process_message("/start");
        assert!(h.session.shared.start.is_set());
        h.drain_events();

        h.session.process_message("/start");
        assert!(matches!(
            h.next_event(),
            ClientEvent::Error(e) if e == "Game has already started"
        ));

        // A START packet after the fact changes nothing and says nothing.
        h.session.start_game();
        assert!(h
            .drain_events()
            .iter()
            .all(|e| !matches!(e, ClientEvent::Status(s) if s.contains("Starting"))));
    }

    #[test]
    fn version_mismatch_closes_and_unblocks_every_port() {
        let mut h = Harness::connected();
        let mut p = Packet::for_msg(MsgId::Version);
        p.put_u32(PROTOCOL_VERSION + 999_998);
        h.deliver(p);

        assert!(h.session.socket_tx.is_none());
        for port in 0..MAX_PLAYERS {
            assert_eq!(h.queue_len(port), 1);
            assert_eq!(h.session.shared.queues.pop(port), Buttons(0));
        }
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            ClientEvent::Error(msg)
                if msg == "Server protocol version does not match client protocol version"
        )));
    }

    #[test]
    fn matching_version_is_accepted() {
        let mut h = Harness::connected();
        let mut p = Packet::for_msg(MsgId::Version);
        p.put_u32(PROTOCOL_VERSION);
        h.deliver(p);

        assert!(h.session.socket_tx.is_some());
        assert!(h
            .drain_events()
            .iter()
            .all(|e| !matches!(e, ClientEvent::Error(_))));
    }

    #[test]
    fn message_routing_by_sender_id() {
        let mut h = Harness::connected();
        h.deliver(join_packet(7, "alice"));
        h.drain_events();

        h.deliver(message_packet(-2, "oops"));
        assert!(matches!(h.next_event(), ClientEvent::Error(e) if e == "oops"));

        h.deliver(message_packet(-1, "ready"));
        assert!(matches!(h.next_event(), ClientEvent::Status(s) if s == "ready"));

        h.deliver(message_packet(7, "hi"));
        assert!(matches!(
            h.next_event(),
            ClientEvent::Chat { name, message } if name == "alice" && message == "hi"
        ));
    }

    #[test]
    fn roster_follows_join_name_latency_quit() {
        let mut h = Harness::connected();

        h.deliver(join_packet(3, "alice"));
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::Status(s) if s == "alice has joined")));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::Roster(r) if r == &[UserInfo { id: 3, name: "alice".into(), latency: 0 }]
        )));

        let mut rename = Packet::for_msg(MsgId::Name);
        rename.put_u32(3);
        put_name(&mut rename, "bob");
        h.deliver(rename);
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::Status(s) if s == "alice is now bob")));

        let mut latency = Packet::for_msg(MsgId::Latency);
        latency.put_u32(3);
        latency.put_u32(42);
        // A trailing partial entry is tolerated.
        latency.put_u32(9);
        h.deliver(latency);
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            ClientEvent::Roster(r) if r == &[UserInfo { id: 3, name: "bob".into(), latency: 42 }]
        )));

        let mut quit = Packet::for_msg(MsgId::Quit);
        quit.put_u32(3);
        h.deliver(quit);
        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::Status(s) if s == "bob has quit")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::Roster(r) if r.is_empty())));
    }

    #[test]
    fn authoritative_controllers_replace_layout_and_map() {
        let mut h = Harness::connected();

        let mut p = Packet::for_msg(MsgId::Controllers);
        p.put_i32(-1);
        for present in [true, true, false, false] {
            put_controller(
                &mut p,
                &Controller {
                    plugin: 1,
                    present,
                    raw_data: false,
                },
            );
        }
        for slot in [1i8, -1, -1, -1] {
            p.put_i8(slot);
        }
        h.deliver(p);

        assert!(h.session.netplay_controllers[0].present);
        assert!(h.session.netplay_controllers[1].present);
        assert!(!h.session.netplay_controllers[2].present);
        assert_eq!(h.session.controller_map.to_local(1), Some(0));
        assert_eq!(h.session.controller_map.to_local(0), None);
        assert!(h.session.shared.is_present(0));
        assert!(h.session.shared.is_present(1));
        assert!(!h.session.shared.is_present(2));
    }

    #[test]
    fn per_user_controllers_touch_only_that_record() {
        let mut h = Harness::connected();
        h.deliver(join_packet(5, "carol"));
        let before_map = h.session.controller_map;
        let before_layout = h.session.netplay_controllers;

        let mut p = Packet::for_msg(MsgId::Controllers);
        p.put_i32(5);
        for _ in 0..MAX_PLAYERS {
            put_controller(
                &mut p,
                &Controller {
                    plugin: 2,
                    present: true,
                    raw_data: false,
                },
            );
        }
        for slot in [0i8, 1, 2, 3] {
            p.put_i8(slot);
        }
        h.deliver(p);

        assert_eq!(h.session.controller_map, before_map);
        assert_eq!(h.session.netplay_controllers, before_layout);
        let user = h.session.users.get(&5).unwrap();
        assert!(user.controllers.iter().all(|c| c.present));
        assert_eq!(user.control_map.to_local(2), Some(2));
    }

    #[test]
    fn ping_is_answered_with_the_same_timestamp() {
        let mut h = Harness::connected();
        let mut p = Packet::for_msg(MsgId::Ping);
        p.put_u64(0xFEED_F00D);
        h.deliver(p);

        let mut pong = h.next_wire();
        assert_eq!(pong.read_u8().unwrap(), MsgId::Pong as u8);
        assert_eq!(pong.read_u64().unwrap(), 0xFEED_F00D);
    }

    #[test]
    fn inbound_lag_is_silent() {
        let mut h = Harness::connected();
        let mut p = Packet::for_msg(MsgId::Lag);
        p.put_u8(9);
        h.deliver(p);

        assert_eq!(h.session.lag, 9);
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn input_for_a_bogus_port_is_dropped_not_fatal() {
        let mut h = Harness::connected();

        let mut p = Packet::for_msg(MsgId::InputData);
        p.put_u8(200);
        p.put_u32(1);
        h.deliver(p);
        assert!(h.session.socket_tx.is_some());

        let mut p = Packet::for_msg(MsgId::InputData);
        p.put_u8(2);
        p.put_u32(0xAB);
        h.deliver(p);
        assert_eq!(h.session.shared.queues.pop(2), Buttons(0xAB));
    }

    #[test]
    fn truncated_packet_fails_the_session() {
        let mut h = Harness::connected();
        let mut p = Packet::for_msg(MsgId::Join);
        p.put_u32(1);
        p.put_u8(10); // claims a 10-byte name, sends none
        h.deliver(p);

        assert!(h.session.socket_tx.is_none());
        assert_eq!(h.queue_len(0), 1);
        assert!(h.drain_events().iter().any(
            |e| matches!(e, ClientEvent::Error(msg) if msg.starts_with("Protocol error:"))
        ));
    }

    #[test]
    fn empty_packet_is_a_keep_alive() {
        let mut h = Harness::connected();
        h.deliver(Packet::new());
        assert!(h.session.socket_tx.is_some());
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn stale_epoch_events_are_ignored() {
        let mut h = Harness::connected();
        let old_epoch = h.session.epoch;
        h.session.handle_net_event(NetEvent::Closed {
            epoch: old_epoch,
            reason: CloseReason::Eof,
        });
        h.drain_events();

        // The close bumped the epoch; a late event from the dead socket
        // must not disturb the session again.
        h.session.handle_net_event(NetEvent::Closed {
            epoch: old_epoch,
            reason: CloseReason::Eof,
        });
        assert!(h.drain_events().is_empty());
        assert_eq!(h.queue_len(0), 1);
    }

    #[test]
    fn eof_surfaces_as_disconnected() {
        let mut h = Harness::connected();
        let epoch = h.session.epoch;
        h.session.handle_net_event(NetEvent::Closed {
            epoch,
            reason: CloseReason::Eof,
        });
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::Error(msg) if msg == "Disconnected from server")));
    }

    #[test]
    fn unknown_slash_command_is_reported() {
        let mut h = Harness::standalone();
        h.session.process_message("/warp 9");
        assert!(matches!(
            h.next_event(),
            ClientEvent::Error(e) if e == "Unknown command: /warp"
        ));
    }

    #[test]
    fn chat_echoes_locally_and_goes_out() {
        let mut h = Harness::connected();
        h.session.set_name("dana".to_string());
        h.drain_events();

        h.session.process_message("hello there");
        assert!(matches!(
            h.next_event(),
            ClientEvent::Chat { name, message } if name == "dana" && message == "hello there"
        ));

        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Message as u8);
        let len = p.read_u16().unwrap() as usize;
        assert_eq!(p.read_string(len).unwrap(), "hello there");
    }

    #[test]
    fn local_controllers_are_admitted_cooked() {
        let mut h = Harness::connected();
        let mut controllers = [Controller::default(); MAX_PLAYERS];
        controllers[0] = Controller {
            plugin: 1,
            present: true,
            raw_data: true,
        };
        h.session.set_local_controllers(controllers);

        assert!(!h.session.local_controllers[0].raw_data);
        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Controllers as u8);
        assert_eq!(p.read_u8().unwrap(), 1); // plugin
        assert_eq!(p.read_u8().unwrap(), 1); // present
        assert_eq!(p.read_u8().unwrap(), 0); // raw_data forced off
    }

    #[test]
    fn join_handshake_carries_version_name_and_pads() {
        let mut h = Harness::connected();
        h.session.name = "eve".to_string();
        h.session.local_controllers[0].present = true;
        h.session.send_join();

        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Join as u8);
        assert_eq!(p.read_u32().unwrap(), PROTOCOL_VERSION);
        let len = p.read_u8().unwrap() as usize;
        assert_eq!(p.read_string(len).unwrap(), "eve");
        let first = read_controller(&mut p).unwrap();
        assert!(first.present);
        for _ in 1..MAX_PLAYERS {
            read_controller(&mut p).unwrap();
        }
        assert_eq!(p.bytes_remaining(), 0);
    }

    #[test]
    fn start_request_carries_the_trailing_octet() {
        let mut h = Harness::connected();
        h.session.send_start_game();
        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Start as u8);
        assert_eq!(p.read_u8().unwrap(), 0);
        assert_eq!(p.bytes_remaining(), 0);
    }

    #[test]
    fn autolag_requires_a_connection() {
        let mut h = Harness::standalone();
        h.session.process_message("/autolag");
        assert!(matches!(
            h.next_event(),
            ClientEvent::Error(e) if e == "Cannot toggle automatic lag unless connected to server"
        ));
    }

    #[test]
    fn lag_commands_split_local_and_remote() {
        let mut h = Harness::connected();
        h.drain_events();

        h.session.process_message("/my_lag 3");
        assert_eq!(h.session.lag, 3);
        h.assert_wire_idle();

        h.session.process_message("/your_lag 7");
        assert_eq!(h.session.lag, 3);
        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Lag as u8);
        assert_eq!(p.read_u8().unwrap(), 7);

        h.session.process_message("/lag 4");
        assert_eq!(h.session.lag, 4);
        let mut p = h.next_wire();
        assert_eq!(p.read_u8().unwrap(), MsgId::Lag as u8);
        assert_eq!(p.read_u8().unwrap(), 4);

        h.session.process_message("/lag banana");
        assert_eq!(h.session.lag, 4);
    }
}
