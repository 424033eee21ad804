//! Channel engine for the SIM-toolkit Bearer Independent Protocol (BIP)
//!
//! A SIM application can instruct the terminal to open data channels (TCP
//! server, TCP client, UDP client), move bytes through them, and close them
//! again. This crate implements the terminal side of that protocol: a
//! [`Session`] owns a fixed table of channel slots, dispatches inbound BIP
//! commands to per-transport channel state machines, negotiates network
//! bearers, and maps every outcome onto a terminal response with the result
//! codes the card expects.
//!
//! The engine contains no command parsing and no radio code. Decoded
//! [`BipCommand`] values are fed in through a [`SessionHandle`]; terminal
//! responses and asynchronous channel events come back out on a single
//! ordered queue. The cellular data-call service, the routing service, and
//! the connectivity monitor are consumed behind traits (see [`services`]).
//!
//! All command handling is serialized through one driver task. Each open
//! channel runs one background listener task that blocks on its socket and
//! reports inbound data or disconnection back into the same queue, so
//! listener reports never race command processing for the same channel.

#![warn(missing_docs)]

mod bearer;
mod buffer;
mod channel;
mod command;
mod connectivity;
mod events;
mod response;
pub mod services;
mod session;


pub use crate::channel::LinkState;
pub use crate::command::{
    BearerDescription, BearerKind, BipCommand, ChannelSettings, CommandKind, DataSettings,
    TransportProtocol, QUALIFIER_KEEP_LISTENING, QUALIFIER_SEND_IMMEDIATELY,
};
pub use crate::connectivity::ConnectivityChange;
pub use crate::events::ChannelEvent;
pub use crate::response::{ResponseData, ResultCode, TerminalResponse};
pub use crate::session::{Outbound, Session, SessionHandle};

/// Number of channel slots, fixed by the terminal profile.
pub const MAX_CHANNELS: usize = 7;

/// Hard per-direction buffer limit for TCP channels.
pub const TCP_BUFFER_LIMIT: usize = 16384;

/// Hard per-direction buffer limit for UDP channels, bounded by the link MTU.
pub const UDP_BUFFER_LIMIT: usize = 1500;

/// Most channel bytes a single RECEIVE_DATA response can carry.
///
/// The terminal response APDU tops out at 0xff bytes; 0xec is what remains
/// once the mandatory TLVs are accounted for.
pub const RECEIVE_LIMIT: usize = 0xec;
