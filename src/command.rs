use std::net::IpAddr;

use bytes::Bytes;

/// Command qualifier value requesting that buffered data be flushed to the
/// socket as part of this SEND_DATA.
pub const QUALIFIER_SEND_IMMEDIATELY: u8 = 0x01;

/// CLOSE_CHANNEL qualifier bit: close only the accepted client connection of
/// a TCP server channel and keep the listening socket.
pub const QUALIFIER_KEEP_LISTENING: u8 = 0x01;

/// BIP proactive command types handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Allocate a slot and establish a transport channel.
    OpenChannel,
    /// Tear down a channel and free its slot.
    CloseChannel,
    /// Queue (and optionally flush) outbound channel data.
    SendData,
    /// Drain buffered inbound channel data.
    ReceiveData,
    /// Report the status word of every slot.
    GetChannelStatus,
}

/// A decoded BIP command as delivered by the proactive-command dispatcher.
///
/// Exactly one of [`channel_settings`](Self::channel_settings) and
/// [`data_settings`](Self::data_settings) is expected to be present,
/// depending on [`kind`](Self::kind); commands violating that are answered
/// with [`ResultCode::CmdDataNotUnderstood`](crate::ResultCode::CmdDataNotUnderstood).
#[derive(Debug, Clone)]
pub struct BipCommand {
    /// Command type.
    pub kind: CommandKind,
    /// Raw command qualifier byte.
    pub qualifier: u8,
    /// OPEN_CHANNEL payload.
    pub channel_settings: Option<ChannelSettings>,
    /// SEND_DATA / RECEIVE_DATA / CLOSE_CHANNEL payload.
    pub data_settings: Option<DataSettings>,
}

/// Transport level requested by an OPEN_CHANNEL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// UICC server mode: listen for one inbound TCP connection.
    TcpServer,
    /// TCP connection to a remote destination address.
    TcpClientRemote,
    /// TCP connection to the terminal itself (terminal server mode).
    TcpClientLocal,
    /// UDP association with a remote destination address.
    UdpClientRemote,
    /// UDP association with the terminal itself.
    UdpClientLocal,
    /// A transport level this engine does not support.
    Other(u8),
}

impl TransportProtocol {
    /// Whether this variant reaches a remote host and therefore needs a
    /// network bearer before the socket can be opened.
    pub fn is_remote_client(self) -> bool {
        matches!(self, Self::TcpClientRemote | Self::UdpClientRemote)
    }
}

/// Bearer requested by an OPEN_CHANNEL command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerDescription {
    /// Bearer type.
    pub kind: BearerKind,
    /// Raw bearer parameter bytes, echoed back in the open-channel response.
    pub parameters: Vec<u8>,
}

/// Bearer types the card can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerKind {
    /// Whatever default data path the terminal currently has.
    Default,
    /// A dedicated packet-switched cellular context.
    MobilePs,
    /// Like [`MobilePs`](Self::MobilePs), with extended QoS parameters.
    MobilePsExtendedQos,
    /// Any other bearer type; rejected as beyond terminal capability.
    Other(u8),
}

/// OPEN_CHANNEL parameters.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Requested transport variant.
    pub protocol: TransportProtocol,
    /// Requested buffer size; clipped in place to the transport limit when
    /// the channel opens.
    pub buffer_size: usize,
    /// Destination address for the remote client variants.
    pub dest_address: Option<IpAddr>,
    /// Destination (client) or listening (server) port.
    pub port: u16,
    /// Requested bearer.
    pub bearer: BearerDescription,
    /// Access point name for dedicated bearers.
    pub apn: Option<String>,
    /// Data-call user name, passed through to the data-call service.
    pub user_login: Option<String>,
    /// Data-call password, passed through to the data-call service.
    pub user_password: Option<String>,
    /// Channel slot (1-based), assigned by the session; 0 until then.
    pub channel: u8,
    /// Dedicated data-connection id, filled in once bearer setup completes.
    pub cid: Option<u32>,
}

/// SEND_DATA / RECEIVE_DATA / CLOSE_CHANNEL parameters.
#[derive(Debug, Clone)]
pub struct DataSettings {
    /// Addressed channel slot (1-based).
    pub channel: u8,
    /// Payload bytes for SEND_DATA; empty otherwise.
    pub data: Bytes,
    /// Requested byte count for RECEIVE_DATA; 0 otherwise.
    pub length: usize,
}
