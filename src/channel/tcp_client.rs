use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{read_once, write_stream, ChannelCore, LinkState, OpenFailure};
use crate::command::{BipCommand, CommandKind, TransportProtocol};
use crate::response::{ResultCode, TerminalResponse};
use crate::session::{Emitter, SessionInput};
use crate::{QUALIFIER_SEND_IMMEDIATELY, TCP_BUFFER_LIMIT};

/// TCP client channel, connecting out to the SIM-designated peer (or to
/// loopback for the local variant).
pub(crate) struct TcpClientChannel {
    pub(super) core: ChannelCore,
    stream: Option<Arc<TcpStream>>,
}

impl TcpClientChannel {
    pub(super) fn new(
        slot: u8,
        emitter: Emitter,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            core: ChannelCore::new(slot, emitter, inbox),
            stream: None,
        }
    }

    pub(super) async fn open(&mut self, cmd: &mut BipCommand) -> Result<(), OpenFailure> {
        let Some(settings) = cmd.channel_settings.as_mut() else {
            return Err(OpenFailure::default());
        };
        let result = self.core.reconfigure(settings, TCP_BUFFER_LIMIT);
        let teardown_cid = settings.cid;

        let addr = match settings.protocol {
            TransportProtocol::TcpClientLocal => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => match settings.dest_address {
                Some(addr) => addr,
                None => {
                    debug!(slot = self.core.slot, "no destination address");
                    self.respond_open_failed();
                    return Err(OpenFailure { teardown_cid });
                }
            },
        };

        match TcpStream::connect((addr, settings.port)).await {
            Ok(stream) => {
                debug!(slot = self.core.slot, %addr, port = settings.port, "connected");
                self.stream = Some(Arc::new(stream));
                let status = self.core.set_link(LinkState::Established);
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
                debug!(slot = self.core.slot, %addr, "connect failed: {e}");
                self.respond_open_failed();
                Err(OpenFailure { teardown_cid })
            }
        }
    }

    fn respond_open_failed(&self) {
        let status = self.core.status_word();
        let payload = self.core.open_payload(Some(status));
        self.core.respond(TerminalResponse {
            command: CommandKind::OpenChannel,
            result: ResultCode::BipError,
            additional_info: Some(0x00),
            data: payload,
        });
    }

    pub(super) async fn send(&mut self, qualifier: u8, data: &[u8]) {
        self.core.tx.push(data);
        if qualifier == QUALIFIER_SEND_IMMEDIATELY {
            // Cursors rewind before the write; a failed flush loses the
            // staged bytes.
            let payload = self.core.tx.take();
            let Some(stream) = self.stream.clone() else {
                self.core.respond_send_error();
                return;
            };
            if let Err(e) = write_stream(&stream, &payload).await {
                debug!(slot = self.core.slot, "write failed: {e}");
                self.core.respond_send_error();
                return;
            }
        }
        self.core.respond_send_ok();
    }

    /// Returns the dedicated data-call id to tear down, if the channel was
    /// riding one.
    pub(super) fn close(&mut self) -> Option<u32> {
        self.core.abort_worker();
        self.stream = None;
        self.core.reset_buffers();
        self.core.set_link(LinkState::Closed);
        self.core
            .respond(TerminalResponse::plain(CommandKind::CloseChannel, ResultCode::Ok));
        self.core.emit_status_event();
        self.core.settings.as_ref().and_then(|s| s.cid)
    }

    pub(super) fn dropped(&mut self) {
        self.core.abort_worker();
        self.stream = None;
        self.core.reset_buffers();
        self.core.set_link(LinkState::Dropped);
        self.core.emit_status_event();
    }

    pub(super) fn listener_closed(&mut self) {
        self.core.abort_worker();
        self.stream = None;
        self.core.reset_buffers();
        self.core.set_link(LinkState::Dropped);
        self.core.emit_status_event();
    }

    pub(super) fn on_session_end(&mut self) {
        if self.core.worker_idle() {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let Some(stream) = self.stream.clone() else {
            return;
        };
        let slot = self.core.slot;
        let capacity = self.core.rx.capacity();
        let inbox = self.core.inbox.clone();
        self.core.abort_worker();
        self.core.worker = Some(tokio::spawn(async move {
            read_once(slot, &stream, capacity, &inbox).await;
        }));
    }
}
