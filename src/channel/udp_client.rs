use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChannelCore, LinkState, ListenerEvent, OpenFailure};
use crate::command::{BipCommand, CommandKind, TransportProtocol};
use crate::response::{ResultCode, TerminalResponse};
use crate::session::{Emitter, SessionInput};
use crate::{QUALIFIER_SEND_IMMEDIATELY, UDP_BUFFER_LIMIT};

/// UDP client channel. The socket is connected so that sends need no
/// explicit destination and stray datagrams from other peers are filtered.
pub(crate) struct UdpClientChannel {
    pub(super) core: ChannelCore,
    socket: Option<Arc<UdpSocket>>,
}

impl UdpClientChannel {
    pub(super) fn new(
        slot: u8,
        emitter: Emitter,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            core: ChannelCore::new(slot, emitter, inbox),
            socket: None,
        }
    }

    pub(super) async fn open(&mut self, cmd: &mut BipCommand) -> Result<(), OpenFailure> {
        let Some(settings) = cmd.channel_settings.as_mut() else {
            return Err(OpenFailure::default());
        };
        let result = self.core.reconfigure(settings, UDP_BUFFER_LIMIT);
        let teardown_cid = settings.cid;

        let addr = match settings.protocol {
            TransportProtocol::UdpClientLocal => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => match settings.dest_address {
                Some(addr) => addr,
                None => {
                    debug!(slot = self.core.slot, "no destination address");
                    self.respond_open_failed();
                    return Err(OpenFailure { teardown_cid });
                }
            },
        };

        match Self::connect(addr, settings.port).await {
            Ok(socket) => {
                debug!(slot = self.core.slot, %addr, port = settings.port, "socket ready");
                self.socket = Some(Arc::new(socket));
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
                debug!(slot = self.core.slot, %addr, "socket setup failed: {e}");
                self.respond_open_failed();
                Err(OpenFailure { teardown_cid })
            }
        }
    }

    async fn connect(addr: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((addr, port)).await?;
        Ok(socket)
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
            let payload = self.core.tx.take();
            let Some(socket) = self.socket.clone() else {
                self.core.respond_send_error();
                return;
            };
            if let Err(e) = socket.send(&payload).await {
                debug!(slot = self.core.slot, "send failed: {e}");
                self.core.respond_send_error();
                return;
            }
        }
        self.core.respond_send_ok();
    }

    pub(super) fn close(&mut self) -> Option<u32> {
        self.core.abort_worker();
        self.socket = None;
        self.core.reset_buffers();
        self.core.set_link(LinkState::Closed);
        self.core
            .respond(TerminalResponse::plain(CommandKind::CloseChannel, ResultCode::Ok));
        self.core.emit_status_event();
        self.core.settings.as_ref().and_then(|s| s.cid)
    }

    pub(super) fn dropped(&mut self) {
        self.core.abort_worker();
        self.socket = None;
        self.core.reset_buffers();
        self.core.set_link(LinkState::Dropped);
        self.core.emit_status_event();
    }

    pub(super) fn listener_closed(&mut self) {
        self.core.abort_worker();
        self.socket = None;
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
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let slot = self.core.slot;
        let capacity = self.core.rx.capacity();
        let inbox = self.core.inbox.clone();
        self.core.abort_worker();
        self.core.worker = Some(tokio::spawn(async move {
            recv_once(slot, socket, capacity, inbox).await;
        }));
    }
}

/// Receive one datagram and hand it to the session; the next round starts
/// at session end.
async fn recv_once(
    slot: u8,
    socket: Arc<UdpSocket>,
    capacity: usize,
    inbox: mpsc::UnboundedSender<SessionInput>,
) {
    let mut buf = vec![0u8; capacity.max(1)];
    match socket.recv(&mut buf).await {
        Ok(n) if n > 0 => {
            buf.truncate(n);
            let _ = inbox.send(SessionInput::Listener(ListenerEvent::Data { slot, data: buf }));
        }
        Ok(_) => {
            let _ = inbox.send(SessionInput::Listener(ListenerEvent::Closed { slot }));
        }
        Err(e) => {
            debug!(slot, "recv failed: {e}");
            let _ = inbox.send(SessionInput::Listener(ListenerEvent::Closed { slot }));
        }
    }
}
