//! The synchronous, emulator-facing facade.
//!
//! The plugin ABI is blocking: the emulator calls in from its own threads
//! and expects plain values back. Mutating calls are marshalled onto the
//! reactor thread and awaited on a oneshot completion. `get_input` is the
//! exception: it talks straight to the blocking queues, because it sits on
//! the hard real-time frame path.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::{
    controller::{Buttons, Controller},
    error::ClientError,
    events::ClientEvent,
    reactor::{self, Command},
    session::Session,
    shared::Shared,
};

use padlink_proto::MAX_PLAYERS;

/// Handle to a running netplay client.
///
/// Dropping the handle shuts the reactor down and joins its thread, unless
/// the drop happens on the reactor thread itself, in which case the thread
/// is left to wind down on its own.
pub struct NetplayClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    reactor: Option<std::thread::JoinHandle<()>>,
}

impl NetplayClient {
    /// Start the reactor thread. Returns the client handle and the dialog
    /// event stream.
    pub fn spawn() -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let session_shared = shared.clone();
        let reactor = std::thread::Builder::new()
            .name("padlink-reactor".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "failed to build reactor runtime");
                        return;
                    }
                };
                let session = Session::new(session_shared, event_tx, net_tx);
                runtime.block_on(reactor::run(session, cmd_rx, net_rx));
            })?;

        Ok((
            Self {
                cmd_tx,
                shared,
                reactor: Some(reactor),
            },
            event_rx,
        ))
    }

    /// Post a command and block until the reactor completes it.
    fn post<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| ClientError::ReactorGone)?;
        reply_rx.blocking_recv().map_err(|_| ClientError::ReactorGone)
    }

    pub fn get_name(&self) -> Result<String, ClientError> {
        self.post(Command::GetName)
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ClientError> {
        let name = name.into();
        self.post(|reply| Command::SetName(name, reply))
    }

    /// Admit the emulator's controller layout. Raw-data pads are converted
    /// to cooked.
    pub fn set_local_controllers(
        &self,
        controllers: [Controller; MAX_PLAYERS],
    ) -> Result<(), ClientError> {
        self.post(|reply| Command::SetLocalControllers(controllers, reply))
    }

    pub fn set_netplay_controllers(
        &self,
        controllers: [Controller; MAX_PLAYERS],
    ) -> Result<(), ClientError> {
        self.post(|reply| Command::SetNetplayControllers(controllers, reply))
    }

    /// Publish this frame's local inputs; called once per emulator frame.
    pub fn process_input(&self, input: [Buttons; MAX_PLAYERS]) -> Result<(), ClientError> {
        self.post(|reply| Command::ProcessInput(input, reply))
    }

    /// Read the authoritative input for a netplay port. Blocks until the
    /// input for the current frame is available; absent ports read neutral.
    pub fn get_input(&self, port: usize) -> Buttons {
        if self.shared.is_present(port) {
            if let Some(queue) = self.shared.queues.get(port) {
                return queue.pop();
            }
        }
        Buttons::default()
    }

    /// Feed a line from the chat dialog: chat text or a slash command.
    pub fn process_message(&self, message: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Message(message.into()));
    }

    /// Block until the game starts (via `/start`, a server START, or
    /// `post_close`).
    pub fn wait_until_start(&self) {
        self.shared.start.wait();
    }

    /// Asynchronous teardown request from the emulator: disconnect and let
    /// the session run out standalone.
    pub fn post_close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

impl Drop for NetplayClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(handle) = self.reactor.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
