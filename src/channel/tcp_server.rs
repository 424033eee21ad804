use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use super::{read_once, ChannelCore, LinkState, ListenerEvent, OpenFailure};
use crate::command::{BipCommand, CommandKind};
use crate::response::{ResultCode, TerminalResponse};
use crate::session::{Emitter, SessionInput};
use crate::{QUALIFIER_KEEP_LISTENING, TCP_BUFFER_LIMIT};

/// TCP server channel: binds a local port and serves one client at a time.
///
/// Server channels ride no mobile bearer, so they are exempt from
/// bearer-loss teardown and never carry a data-call id.
pub(crate) struct TcpServerChannel {
    pub(super) core: ChannelCore,
    listener: Option<Arc<TcpListener>>,
    client: Option<Arc<TcpStream>>,
}

impl TcpServerChannel {
    pub(super) fn new(
        slot: u8,
        emitter: Emitter,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            core: ChannelCore::new(slot, emitter, inbox),
            listener: None,
            client: None,
        }
    }

    pub(super) async fn open(&mut self, cmd: &mut BipCommand) -> Result<(), OpenFailure> {
        let Some(settings) = cmd.channel_settings.as_mut() else {
            return Err(OpenFailure::default());
        };
        let result = self.core.reconfigure(settings, TCP_BUFFER_LIMIT);

        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.port)).await {
            Ok(listener) => {
                debug!(slot = self.core.slot, port = settings.port, "server bound");
                self.listener = Some(Arc::new(listener));
                let status = self.core.set_link(LinkState::Listening);
                let payload = self.core.open_payload(Some(status));
                self.core.respond(TerminalResponse {
                    command: CommandKind::OpenChannel,
                    result,
                    additional_info: None,
                    data: payload,
                });
                self.spawn_worker();
                Ok(())
            }
            Err(e) => {
                debug!(slot = self.core.slot, port = settings.port, "bind failed: {e}");
                let status = self.core.status_word();
                let payload = self.core.open_payload(Some(status));
                self.core.respond(TerminalResponse {
                    command: CommandKind::OpenChannel,
                    result: ResultCode::BipError,
                    additional_info: Some(0x00),
                    data: payload,
                });
                Err(OpenFailure::default())
            }
        }
    }

    pub(super) async fn send(&mut self, qualifier: u8, data: &[u8]) {
        self.core.tx.push(data);
        if qualifier == crate::QUALIFIER_SEND_IMMEDIATELY {
            let payload = self.core.tx.take();
            let Some(client) = self.client.clone() else {
                self.core.respond_send_error();
                return;
            };
            if let Err(e) = super::write_stream(&client, &payload).await {
                debug!(slot = self.core.slot, "write failed: {e}");
                self.core.respond_send_error();
                return;
            }
        }
        self.core.respond_send_ok();
    }

    /// A close with the keep-listening qualifier drops only the client link
    /// and answers with a plain terminal response; anything else is a full
    /// teardown that releases the port, resets the buffers, and emits a
    /// status-changed event.
    pub(super) fn close(&mut self, qualifier: u8) -> Option<u32> {
        self.core.abort_worker();
        self.client = None;
        if qualifier & QUALIFIER_KEEP_LISTENING != 0 && self.listener.is_some() {
            debug!(slot = self.core.slot, "client connection closed, still listening");
            self.core.set_link(LinkState::Listening);
            self.core
                .respond(TerminalResponse::plain(CommandKind::CloseChannel, ResultCode::Ok));
        } else {
            self.listener = None;
            self.core.reset_buffers();
            self.core.set_link(LinkState::Closed);
            self.core
                .respond(TerminalResponse::plain(CommandKind::CloseChannel, ResultCode::Ok));
            self.core.emit_status_event();
        }
        None
    }

    pub(super) fn accepted(&mut self, stream: Arc<TcpStream>) -> u16 {
        self.client = Some(stream);
        self.core.set_link(LinkState::Established)
    }

    /// The client link went away; fall back to listening. The accept round
    /// restarts at session end.
    pub(super) fn listener_closed(&mut self) {
        self.core.abort_worker();
        self.client = None;
        self.core.reset_buffers();
        if self.listener.is_some() {
            self.core.set_link(LinkState::Listening);
        } else {
            self.core.set_link(LinkState::Closed);
        }
        self.core.emit_status_event();
    }

    /// Session end closes any accepted client connection so the next
    /// waiting client can be served, and restarts the accept round.
    pub(super) fn on_session_end(&mut self) {
        if self.client.take().is_some() {
            self.core.abort_worker();
        }
        if self.core.worker_idle() {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let client = self.client.clone();
        let slot = self.core.slot;
        let capacity = self.core.rx.capacity();
        let inbox = self.core.inbox.clone();
        self.core.abort_worker();
        self.core.worker = Some(tokio::spawn(async move {
            serve_once(slot, listener, client, capacity, inbox).await;
        }));
    }
}

/// Accept one client (unless one is already connected) and perform one read.
async fn serve_once(
    slot: u8,
    listener: Arc<TcpListener>,
    client: Option<Arc<TcpStream>>,
    capacity: usize,
    inbox: mpsc::UnboundedSender<SessionInput>,
) {
    let stream = match client {
        Some(stream) => stream,
        None => {
            let _ = inbox.send(SessionInput::Listener(ListenerEvent::Listening { slot }));
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(slot, %peer, "client connected");
                    let stream = Arc::new(stream);
                    let _ = inbox.send(SessionInput::Listener(ListenerEvent::Accepted {
                        slot,
                        stream: stream.clone(),
                    }));
                    stream
                }
                Err(e) => {
                    debug!(slot, "accept failed: {e}");
                    return;
                }
            }
        }
    };
    read_once(slot, &stream, capacity, &inbox).await;
}
