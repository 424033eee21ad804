//! Bearer negotiation for OPEN_CHANNEL.
//!
//! Server and local-loopback channels need no network bearer. Remote client
//! channels run either over the system default bearer (possibly waiting for
//! it to finish connecting) or over a dedicated packet-switched data call
//! requested from the data-call service.

use std::net::IpAddr;

use tracing::debug;

use crate::command::{BearerKind, BipCommand, ChannelSettings};
use crate::response::{ResponseData, ResultCode, TerminalResponse};
use crate::services::{
    DataCallRequest, NetworkInfo, NetworkKind, NetworkState, Services, SetupToken,
};
use crate::session::Emitter;

/// Retry-hint additional info for "currently unable to process": busy on a
/// voice call or the data path is suspended.
const RETRY_INFO_SUSPENDED: u8 = 0x02;

/// How an OPEN_CHANNEL proceeds after bearer negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetupOutcome {
    /// Connectivity is in place (or not needed); open the channel now.
    Ready,
    /// The default bearer is still connecting; the connectivity watcher will
    /// resolve the wait.
    AwaitingConnectivity,
    /// A dedicated data call was requested; the data-call service will
    /// report completion under the issued token.
    AwaitingDataCall,
    /// Negotiation failed; a terminal response was already sent and the
    /// reserved slot must be freed.
    Failed,
}

/// The last dedicated bearer brought up, kept until its teardown completes
/// so its routes can be removed.
#[derive(Debug, Clone)]
pub(crate) struct ActiveBearer {
    pub(crate) interface: String,
    pub(crate) gateways: Vec<IpAddr>,
}

pub(crate) struct Negotiator {
    services: Services,
}

impl Negotiator {
    pub(crate) fn new(services: Services) -> Self {
        Self { services }
    }

    /// Decide whether `cmd`'s channel needs a bearer and drive the setup.
    ///
    /// Failure responses are emitted here; the caller only has to free the
    /// reserved slot on [`SetupOutcome::Failed`].
    pub(crate) fn negotiate(
        &self,
        cmd: &BipCommand,
        token: SetupToken,
        out: &Emitter,
    ) -> SetupOutcome {
        let Some(settings) = cmd.channel_settings.as_ref() else {
            return SetupOutcome::Failed;
        };

        if !settings.protocol.is_remote_client() {
            debug!(channel = settings.channel, "no bearer needed");
            return SetupOutcome::Ready;
        }

        match settings.bearer.kind {
            BearerKind::Default => self.default_bearer(cmd, settings, out),
            BearerKind::MobilePs | BearerKind::MobilePsExtendedQos => {
                self.dedicated_bearer(cmd, settings, token, out)
            }
            BearerKind::Other(kind) => {
                debug!(kind, "unsupported bearer type");
                out.respond(TerminalResponse::plain(
                    cmd.kind,
                    ResultCode::BeyondTerminalCapability,
                ));
                SetupOutcome::Failed
            }
        }
    }

    fn default_bearer(
        &self,
        cmd: &BipCommand,
        settings: &ChannelSettings,
        out: &Emitter,
    ) -> SetupOutcome {
        let networks = self.services.connectivity.networks();
        let Some(candidate) = find_default_candidate(&networks) else {
            debug!("no default bearer available");
            out.respond(TerminalResponse::plain(
                cmd.kind,
                ResultCode::BeyondTerminalCapability,
            ));
            return SetupOutcome::Failed;
        };

        match candidate.state {
            NetworkState::Connected => {
                debug!("default bearer is connected");
                SetupOutcome::Ready
            }
            NetworkState::Connecting => {
                debug!("default bearer is connecting, waiting for connect");
                SetupOutcome::AwaitingConnectivity
            }
            NetworkState::Suspended => {
                // Only mobile data accounts suspend, and only during voice
                // calls.
                debug!("default bearer suspended, busy on voice call");
                out.respond(TerminalResponse {
                    command: cmd.kind,
                    result: ResultCode::TerminalCurrentlyUnable,
                    additional_info: Some(RETRY_INFO_SUSPENDED),
                    data: Some(open_payload(settings)),
                });
                SetupOutcome::Failed
            }
            NetworkState::Disconnected => {
                // Down due to error or user preference; nothing we can do.
                debug!("default bearer is disconnected");
                out.respond(TerminalResponse::plain(
                    cmd.kind,
                    ResultCode::BeyondTerminalCapability,
                ));
                SetupOutcome::Failed
            }
        }
    }

    fn dedicated_bearer(
        &self,
        cmd: &BipCommand,
        settings: &ChannelSettings,
        token: SetupToken,
        out: &Emitter,
    ) -> SetupOutcome {
        if !self.services.connectivity.mobile_data_enabled() {
            debug!("user does not allow mobile data connections");
            out.respond(TerminalResponse::plain(
                cmd.kind,
                ResultCode::BeyondTerminalCapability,
            ));
            return SetupOutcome::Failed;
        }

        let Some(apn) = settings.apn.as_ref() else {
            debug!("no access point name for PS bearer, falling back to default");
            return self.default_bearer(cmd, settings, out);
        };

        if self.services.connectivity.voice_call_active() {
            debug!("bearer not set up, busy on voice call");
            out.respond(TerminalResponse {
                command: cmd.kind,
                result: ResultCode::TerminalCurrentlyUnable,
                additional_info: Some(RETRY_INFO_SUSPENDED),
                data: Some(open_payload(settings)),
            });
            return SetupOutcome::Failed;
        }

        let request = DataCallRequest {
            apn: apn.clone(),
            user_login: settings.user_login.clone(),
            user_password: settings.user_password.clone(),
        };
        debug!(?token, apn, "requesting dedicated data call");
        self.services.data_calls.setup_data_call(token, &request);
        SetupOutcome::AwaitingDataCall
    }
}

/// Open-channel response payload reported from negotiation failures; no
/// channel status exists yet at that point.
fn open_payload(settings: &ChannelSettings) -> ResponseData {
    ResponseData::OpenChannel {
        buffer_size: settings.buffer_size,
        status: None,
        bearer: settings.bearer.clone(),
    }
}

/// Pick the network to treat as the default bearer: the first connected one
/// wins; otherwise the last one still trying.
fn find_default_candidate(networks: &[NetworkInfo]) -> Option<NetworkInfo> {
    let mut candidate = None;
    for info in networks {
        if !info.available || info.kind == NetworkKind::Other {
            continue;
        }
        match info.state {
            NetworkState::Connected => return Some(*info),
            NetworkState::Connecting | NetworkState::Suspended => candidate = Some(*info),
            NetworkState::Disconnected => {}
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(kind: NetworkKind, state: NetworkState) -> NetworkInfo {
        NetworkInfo {
            kind,
            available: true,
            state,
        }
    }

    #[test]
    fn connected_network_wins() {
        let networks = [
            net(NetworkKind::Mobile, NetworkState::Connecting),
            net(NetworkKind::Wifi, NetworkState::Connected),
            net(NetworkKind::Wimax, NetworkState::Connecting),
        ];
        let candidate = find_default_candidate(&networks).unwrap();
        assert_eq!(candidate.kind, NetworkKind::Wifi);
        assert_eq!(candidate.state, NetworkState::Connected);
    }

    #[test]
    fn connecting_network_is_a_fallback_candidate() {
        let networks = [
            net(NetworkKind::Mobile, NetworkState::Disconnected),
            net(NetworkKind::Mobile, NetworkState::Connecting),
        ];
        let candidate = find_default_candidate(&networks).unwrap();
        assert_eq!(candidate.state, NetworkState::Connecting);
    }

    #[test]
    fn unavailable_and_foreign_networks_are_ignored() {
        let networks = [
            NetworkInfo {
                kind: NetworkKind::Wifi,
                available: false,
                state: NetworkState::Connected,
            },
            net(NetworkKind::Other, NetworkState::Connected),
        ];
        assert!(find_default_candidate(&networks).is_none());
    }
}
