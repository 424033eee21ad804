//! Transport channel state machines.
//!
//! Each open slot holds one [`Channel`]: a TCP server, TCP client, or UDP
//! client. The variants share their buffer handling and response plumbing
//! through [`ChannelCore`] and differ in socket management. Every open
//! channel runs one background listener task which performs at most one
//! accept (server) and one read, reports the outcome as a [`ListenerEvent`]
//! on the session's input queue, and exits; session end restarts idle
//! listeners.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffer::ChannelBuffer;
use crate::command::{BipCommand, ChannelSettings, CommandKind, TransportProtocol};
use crate::response::{ResponseData, ResultCode, TerminalResponse};
use crate::session::{Emitter, SessionInput};
use crate::RECEIVE_LIMIT;

mod tcp_client;
mod tcp_server;
mod udp_client;

pub(crate) use tcp_client::TcpClientChannel;
pub(crate) use tcp_server::TcpServerChannel;
pub(crate) use udp_client::UdpClientChannel;

/// Link state of a channel, encoded in the high byte of its status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// No link.
    Closed = 0x00,
    /// The link was lost to a bearer failure rather than a CLOSE_CHANNEL.
    Dropped = 0x05,
    /// TCP server bound and awaiting a client.
    Listening = 0x40,
    /// Link established.
    Established = 0x80,
}

impl LinkState {
    /// Status word for this state on channel slot `slot`: link state in the
    /// high byte, slot index in the low byte.
    pub fn word(self, slot: u8) -> u16 {
        ((self as u16) << 8) | u16::from(slot)
    }
}

/// Why an open failed, and what the session has to unwind.
#[derive(Debug, Default)]
pub(crate) struct OpenFailure {
    /// Dedicated data call to tear down, when one was already allocated for
    /// this channel.
    pub(crate) teardown_cid: Option<u32>,
}

/// Report from a channel's background listener task.
#[derive(Debug)]
pub(crate) enum ListenerEvent {
    /// A server channel is waiting for a client.
    Listening {
        /// Reporting slot.
        slot: u8,
    },
    /// A server channel accepted a client connection.
    Accepted {
        /// Reporting slot.
        slot: u8,
        /// The accepted stream; the channel keeps it for SEND_DATA.
        stream: Arc<TcpStream>,
    },
    /// The listener read inbound bytes.
    Data {
        /// Reporting slot.
        slot: u8,
        /// The bytes, at most one buffer's worth.
        data: Vec<u8>,
    },
    /// The socket failed or reached end of stream; the channel's socket
    /// reference must be discarded.
    Closed {
        /// Reporting slot.
        slot: u8,
    },
}

/// Sentinel headroom reported before any channel settings are known.
const HEADROOM_UNKNOWN: u8 = 0xee;

/// State and plumbing shared by all channel variants.
pub(crate) struct ChannelCore {
    slot: u8,
    settings: Option<ChannelSettings>,
    link: LinkState,
    rx: ChannelBuffer,
    tx: ChannelBuffer,
    worker: Option<JoinHandle<()>>,
    emitter: Emitter,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl ChannelCore {
    fn new(slot: u8, emitter: Emitter, inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            slot,
            settings: None,
            link: LinkState::Closed,
            rx: ChannelBuffer::new(0),
            tx: ChannelBuffer::new(0),
            worker: None,
            emitter,
            inbox,
        }
    }

    /// Negotiate the buffer size against the transport limit and size the
    /// buffer pair. Returns the result code for the open response.
    fn reconfigure(&mut self, settings: &mut ChannelSettings, limit: usize) -> ResultCode {
        let mut result = ResultCode::Ok;
        if settings.buffer_size > limit {
            result = ResultCode::PerformedWithModification;
            settings.buffer_size = limit;
        } else if settings.buffer_size == 0 {
            settings.buffer_size = limit;
        }
        self.rx = ChannelBuffer::new(settings.buffer_size);
        self.tx = ChannelBuffer::new(settings.buffer_size);
        self.settings = Some(settings.clone());
        result
    }

    fn status_word(&self) -> u16 {
        self.link.word(self.slot)
    }

    fn set_link(&mut self, link: LinkState) -> u16 {
        self.link = link;
        self.status_word()
    }

    fn respond(&self, response: TerminalResponse) {
        self.emitter.respond(response);
    }

    fn emit_status_event(&self) {
        self.emitter.event(crate::ChannelEvent::StatusChanged {
            status: self.status_word(),
        });
    }

    /// Open-channel response payload from the current settings.
    fn open_payload(&self, status: Option<u16>) -> Option<ResponseData> {
        self.settings.as_ref().map(|s| ResponseData::OpenChannel {
            buffer_size: s.buffer_size,
            status,
            bearer: s.bearer.clone(),
        })
    }

    /// Transmit headroom for the SEND_DATA response, clipped to one byte.
    fn headroom_byte(&self) -> u8 {
        match self.settings {
            Some(_) => self.tx.headroom().min(0xff) as u8,
            None => HEADROOM_UNKNOWN,
        }
    }

    fn respond_send_ok(&self) {
        let available = self.headroom_byte();
        debug!(
            slot = self.slot,
            available, "SEND_DATA done, reporting tx headroom"
        );
        self.respond(TerminalResponse {
            command: CommandKind::SendData,
            result: ResultCode::Ok,
            additional_info: None,
            data: Some(ResponseData::SendData { available }),
        });
    }

    fn respond_send_error(&self) {
        self.respond(TerminalResponse {
            command: CommandKind::SendData,
            result: ResultCode::BipError,
            additional_info: Some(0x00),
            data: Some(ResponseData::SendData { available: 0 }),
        });
    }

    /// RECEIVE_DATA against the receive buffer; shared by every variant.
    fn receive(&mut self, length: usize) {
        let mut result = ResultCode::Ok;
        let mut requested = length;
        if requested > RECEIVE_LIMIT {
            result = ResultCode::PerformedWithModification;
            requested = RECEIVE_LIMIT;
        }
        if requested > self.rx.len() {
            requested = self.rx.len();
            result = ResultCode::PerformedWithMissingInfo;
        }

        let data = if requested > 0 {
            Some(self.rx.read(requested))
        } else {
            None
        };
        let available = self.rx.len().min(0xff) as u8;
        debug!(slot = self.slot, requested, available, "RECEIVE_DATA");

        self.respond(TerminalResponse {
            command: CommandKind::ReceiveData,
            result,
            additional_info: None,
            data: Some(ResponseData::ReceiveData { data, available }),
        });
    }

    /// Store inbound bytes handed off by the listener; returns the status
    /// word and clipped available count for the data-available event.
    fn on_data(&mut self, data: &[u8]) -> (u16, u8) {
        self.rx.refill(data);
        (self.status_word(), self.rx.len().min(0xff) as u8)
    }

    fn reset_buffers(&mut self) {
        self.rx.reset();
        self.tx.reset();
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }

    /// Whether no listener task is currently running.
    fn worker_idle(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.abort_worker();
    }
}

/// A channel slot's transport state machine.
pub(crate) enum Channel {
    TcpServer(TcpServerChannel),
    TcpClient(TcpClientChannel),
    UdpClient(UdpClientChannel),
}

impl Channel {
    /// Build the state machine matching the requested transport protocol.
    /// Returns `None` for protocols the terminal does not support.
    pub(crate) fn for_protocol(
        protocol: TransportProtocol,
        slot: u8,
        emitter: Emitter,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Option<Self> {
        match protocol {
            TransportProtocol::TcpServer => {
                Some(Self::TcpServer(TcpServerChannel::new(slot, emitter, inbox)))
            }
            TransportProtocol::TcpClientRemote | TransportProtocol::TcpClientLocal => {
                Some(Self::TcpClient(TcpClientChannel::new(slot, emitter, inbox)))
            }
            TransportProtocol::UdpClientRemote | TransportProtocol::UdpClientLocal => {
                Some(Self::UdpClient(UdpClientChannel::new(slot, emitter, inbox)))
            }
            TransportProtocol::Other(_) => None,
        }
    }

    pub(crate) async fn open(&mut self, cmd: &mut BipCommand) -> Result<(), OpenFailure> {
        match self {
            Self::TcpServer(ch) => ch.open(cmd).await,
            Self::TcpClient(ch) => ch.open(cmd).await,
            Self::UdpClient(ch) => ch.open(cmd).await,
        }
    }

    pub(crate) async fn send(&mut self, qualifier: u8, data: &[u8]) {
        match self {
            Self::TcpServer(ch) => ch.send(qualifier, data).await,
            Self::TcpClient(ch) => ch.send(qualifier, data).await,
            Self::UdpClient(ch) => ch.send(qualifier, data).await,
        }
    }

    pub(crate) fn receive(&mut self, length: usize) {
        match self {
            Self::TcpServer(ch) => ch.core.receive(length),
            Self::TcpClient(ch) => ch.core.receive(length),
            Self::UdpClient(ch) => ch.core.receive(length),
        }
    }

    /// Close the channel; returns a dedicated data call to tear down, if
    /// one was allocated.
    pub(crate) fn close(&mut self, qualifier: u8) -> Option<u32> {
        match self {
            Self::TcpServer(ch) => ch.close(qualifier),
            Self::TcpClient(ch) => ch.close(),
            Self::UdpClient(ch) => ch.close(),
        }
    }

    pub(crate) fn status_word(&self) -> u16 {
        match self {
            Self::TcpServer(ch) => ch.core.status_word(),
            Self::TcpClient(ch) => ch.core.status_word(),
            Self::UdpClient(ch) => ch.core.status_word(),
        }
    }

    pub(crate) fn on_session_end(&mut self) {
        match self {
            Self::TcpServer(ch) => ch.on_session_end(),
            Self::TcpClient(ch) => ch.on_session_end(),
            Self::UdpClient(ch) => ch.on_session_end(),
        }
    }

    /// The underlying bearer was lost outside of a CLOSE_CHANNEL.
    pub(crate) fn dropped(&mut self) {
        match self {
            // Server channels don't ride a bearer; nothing to drop.
            Self::TcpServer(_) => {}
            Self::TcpClient(ch) => ch.dropped(),
            Self::UdpClient(ch) => ch.dropped(),
        }
    }

    pub(crate) fn on_listening(&mut self) -> Option<u16> {
        match self {
            Self::TcpServer(ch) => Some(ch.core.set_link(LinkState::Listening)),
            _ => None,
        }
    }

    pub(crate) fn on_accepted(&mut self, stream: Arc<TcpStream>) -> Option<u16> {
        match self {
            Self::TcpServer(ch) => Some(ch.accepted(stream)),
            _ => None,
        }
    }

    pub(crate) fn on_data(&mut self, data: &[u8]) -> (u16, u8) {
        match self {
            Self::TcpServer(ch) => ch.core.on_data(data),
            Self::TcpClient(ch) => ch.core.on_data(data),
            Self::UdpClient(ch) => ch.core.on_data(data),
        }
    }

    pub(crate) fn on_listener_closed(&mut self) {
        match self {
            Self::TcpServer(ch) => ch.listener_closed(),
            Self::TcpClient(ch) => ch.listener_closed(),
            Self::UdpClient(ch) => ch.listener_closed(),
        }
    }
}

/// Write the whole buffer to a shared TCP stream.
async fn write_stream(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One blocking read from a shared TCP stream, reported to the session.
///
/// Exits after the first successful read; the next read round is started by
/// session end.
async fn read_once(
    slot: u8,
    stream: &TcpStream,
    capacity: usize,
    inbox: &mpsc::UnboundedSender<SessionInput>,
) {
    let mut buf = vec![0u8; capacity.max(1)];
    loop {
        if stream.readable().await.is_err() {
            let _ = inbox.send(SessionInput::Listener(ListenerEvent::Closed { slot }));
            return;
        }
        match stream.try_read(&mut buf) {
            Ok(0) => {
                debug!(slot, "stream closed by peer");
                let _ = inbox.send(SessionInput::Listener(ListenerEvent::Closed { slot }));
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                let _ = inbox.send(SessionInput::Listener(ListenerEvent::Data {
                    slot,
                    data: buf,
                }));
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                debug!(slot, "read failed: {e}");
                let _ = inbox.send(SessionInput::Listener(ListenerEvent::Closed { slot }));
                return;
            }
        }
    }
}
