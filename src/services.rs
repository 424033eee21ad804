//! External services the engine consumes.
//!
//! The engine never talks to the radio or the routing table directly. The
//! embedding telephony stack supplies implementations of the traits below;
//! operations with asynchronous completions are fire-and-forget calls
//! carrying a [`SetupToken`], and the stack later reports the outcome
//! through the matching [`SessionHandle`](crate::SessionHandle) method.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

/// Correlation token for an in-flight data-call operation.
///
/// Issued by the session; the data-call service must hand the same token
/// back with the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetupToken(pub u32);

/// Parameters for a dedicated data-call setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCallRequest {
    /// Access point name.
    pub apn: String,
    /// Optional user name.
    pub user_login: Option<String>,
    /// Optional password.
    pub user_password: Option<String>,
}

/// A successfully established dedicated data call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCallInfo {
    /// Connection id, needed later to deactivate the call.
    pub cid: u32,
    /// Network interface the call came up on.
    pub interface: String,
    /// Gateways to route through.
    pub gateways: Vec<IpAddr>,
}

/// Outcome of a completed bearer setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataCallOutcome {
    /// The channel rides the system default bearer; no dedicated connection
    /// id exists.
    DefaultBearer,
    /// A dedicated data call was established.
    Dedicated(DataCallInfo),
}

/// Failure of a bearer setup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("data call setup failed: {reason}")]
pub struct DataCallError {
    /// Human-readable cause, logged and otherwise opaque to the protocol.
    pub reason: String,
}

impl DataCallError {
    /// Convenience constructor.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure of a routing-table operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("route operation failed: {reason}")]
pub struct RouteError {
    /// Human-readable cause.
    pub reason: String,
}

/// One entry of a data-call state report, fed into
/// [`SessionHandle::data_call_states`](crate::SessionHandle::data_call_states)
/// for bearer-loss detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCallStatus {
    /// Connection id.
    pub cid: u32,
    /// Whether the call is still up.
    pub active: bool,
}

/// Kind of a system network, as reported by the connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// Cellular data.
    Mobile,
    /// Wi-Fi.
    Wifi,
    /// WiMAX.
    Wimax,
    /// Anything else; unusable as a default bearer.
    Other,
}

/// Connection state of a system network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Up and usable.
    Connected,
    /// Coming up; a connectivity notification will follow.
    Connecting,
    /// Paused, typically mobile data during a voice call.
    Suspended,
    /// Down.
    Disconnected,
}

/// Snapshot of one system network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Network kind.
    pub kind: NetworkKind,
    /// Whether the network is available at all.
    pub available: bool,
    /// Current connection state.
    pub state: NetworkState,
}

/// Cellular data-call service (PDP context setup and teardown).
///
/// Both operations complete asynchronously: the implementation returns
/// immediately and later calls
/// [`SessionHandle::setup_complete`](crate::SessionHandle::setup_complete) or
/// [`SessionHandle::teardown_complete`](crate::SessionHandle::teardown_complete)
/// with the token it was given.
pub trait DataCallService: Send + Sync {
    /// Request a dedicated data call.
    fn setup_data_call(&self, token: SetupToken, request: &DataCallRequest);

    /// Deactivate a previously established data call.
    fn deactivate_data_call(&self, token: SetupToken, cid: u32);
}

/// Routing-table service for dedicated-bearer interfaces.
pub trait RouteManager: Send + Sync {
    /// Install routes over `interface` via the given gateways.
    fn add_route(&self, interface: &str, gateways: &[IpAddr]) -> Result<(), RouteError>;

    /// Remove routes previously installed with
    /// [`add_route`](Self::add_route).
    fn remove_route(&self, interface: &str, gateways: &[IpAddr]) -> Result<(), RouteError>;
}

/// Connectivity and call-state queries, plus control over connectivity
/// change notifications.
///
/// While notifications are started, the embedding stack forwards every
/// connectivity change to
/// [`SessionHandle::connectivity_changed`](crate::SessionHandle::connectivity_changed).
pub trait ConnectivityMonitor: Send + Sync {
    /// Snapshot of all system networks.
    fn networks(&self) -> Vec<NetworkInfo>;

    /// Whether the user allows mobile data connections.
    fn mobile_data_enabled(&self) -> bool;

    /// Whether a voice call is in progress.
    fn voice_call_active(&self) -> bool;

    /// Start delivering connectivity change notifications.
    fn start_notifications(&self);

    /// Stop delivering connectivity change notifications.
    fn stop_notifications(&self);
}

/// Bundle of the external services a [`Session`](crate::Session) needs.
#[derive(Clone)]
pub struct Services {
    /// Data-call service.
    pub data_calls: Arc<dyn DataCallService>,
    /// Routing service.
    pub routes: Arc<dyn RouteManager>,
    /// Connectivity monitor.
    pub connectivity: Arc<dyn ConnectivityMonitor>,
}
