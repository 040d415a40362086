//! The reactor event loop: a current-thread runtime that owns the session
//! and multiplexes facade commands with socket events.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use padlink_proto::MAX_PLAYERS;

use crate::{
    controller::{Buttons, Controller},
    session::Session,
    tcp::NetEvent,
};

/// Work posted from the emulator-facing facade. Calls that the plugin ABI
/// treats as synchronous carry a oneshot the caller blocks on.
pub(crate) enum Command {
    GetName(oneshot::Sender<String>),
    SetName(String, oneshot::Sender<()>),
    SetLocalControllers([Controller; MAX_PLAYERS], oneshot::Sender<()>),
    SetNetplayControllers([Controller; MAX_PLAYERS], oneshot::Sender<()>),
    ProcessInput([Buttons; MAX_PLAYERS], oneshot::Sender<()>),
    /// Dialog text: chat or a slash command. Fire-and-forget.
    Message(String),
    /// Emulator teardown (`post_close`). Fire-and-forget.
    Close,
    /// Facade dropped; wind the reactor down.
    Shutdown,
}

pub(crate) async fn run(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut net: mpsc::UnboundedReceiver<NetEvent>,
) {
    loop {
        tokio::select! {
            // Socket events first: inbound inputs must not sit behind a
            // backlog of posted calls.
            biased;

            Some(event) = net.recv() => session.handle_net_event(event),

            command = commands.recv() => match command {
                Some(Command::GetName(reply)) => {
                    let _ = reply.send(session.name().to_string());
                }
                Some(Command::SetName(name, reply)) => {
                    session.set_name(name);
                    let _ = reply.send(());
                }
                Some(Command::SetLocalControllers(controllers, reply)) => {
                    session.set_local_controllers(controllers);
                    let _ = reply.send(());
                }
                Some(Command::SetNetplayControllers(controllers, reply)) => {
                    session.set_netplay_controllers(controllers);
                    let _ = reply.send(());
                }
                Some(Command::ProcessInput(input, reply)) => {
                    session.process_input(input);
                    let _ = reply.send(());
                }
                Some(Command::Message(text)) => session.process_message(&text),
                Some(Command::Close) => session.post_close(),
                Some(Command::Shutdown) | None => break,
            },
        }
    }

    debug!("reactor loop exiting");
    session.shutdown();
}
