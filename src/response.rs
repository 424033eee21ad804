use crate::command::{BearerDescription, CommandKind};

/// General result coding of a terminal response, per TS 102 223 §8.12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Command performed successfully.
    Ok = 0x00,
    /// Command performed, with missing information.
    PerformedWithMissingInfo = 0x02,
    /// Command performed, with modification.
    PerformedWithModification = 0x07,
    /// Terminal currently unable to process the command; the additional-info
    /// byte carries a retry hint.
    TerminalCurrentlyUnable = 0x20,
    /// Network currently unable to process the command.
    NetworkCurrentlyUnable = 0x21,
    /// Command beyond the terminal's capabilities.
    BeyondTerminalCapability = 0x30,
    /// Command data not understood by the terminal.
    CmdDataNotUnderstood = 0x32,
    /// Bearer Independent Protocol error; the additional-info byte narrows
    /// the cause (0x01 no channel available, 0x03 channel id not valid).
    BipError = 0x3a,
}

/// Structured payload of a terminal response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    /// OPEN_CHANNEL response.
    OpenChannel {
        /// Negotiated buffer size, possibly clipped from the request.
        buffer_size: usize,
        /// Channel status word, when a channel got as far as having one.
        status: Option<u16>,
        /// Bearer the channel runs (or would have run) over.
        bearer: BearerDescription,
    },
    /// SEND_DATA response.
    SendData {
        /// Transmit headroom left, clipped to one byte. 0xee when the channel
        /// has no negotiated settings yet.
        available: u8,
    },
    /// RECEIVE_DATA response.
    ReceiveData {
        /// The drained bytes, absent when nothing could be returned.
        data: Option<Vec<u8>>,
        /// Bytes still buffered after this read, clipped to one byte.
        available: u8,
    },
    /// GET_CHANNEL_STATUS response: one status word per slot, 0 for free
    /// slots.
    ChannelStatus(Vec<u16>),
}

/// The mandatory reply to a proactive command.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResponse {
    /// Command this response answers.
    pub command: CommandKind,
    /// General result.
    pub result: ResultCode,
    /// Additional information byte, where the result coding defines one.
    pub additional_info: Option<u8>,
    /// Structured response payload.
    pub data: Option<ResponseData>,
}

impl TerminalResponse {
    /// A response with no additional info and no payload.
    pub fn plain(command: CommandKind, result: ResultCode) -> Self {
        Self {
            command,
            result,
            additional_info: None,
            data: None,
        }
    }

    /// A response carrying an additional-info byte.
    pub fn with_info(command: CommandKind, result: ResultCode, info: u8) -> Self {
        Self {
            command,
            result,
            additional_info: Some(info),
            data: None,
        }
    }
}
