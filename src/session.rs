//! The BIP session driver.
//!
//! A [`Session`] owns the channel-slot table and serializes all protocol
//! work through a single input queue: decoded commands from the SIM
//! dispatcher, completions from the data-call service, connectivity
//! notifications, and reports from the per-channel listener tasks. The
//! embedding stack talks to the driver through a cloneable
//! [`SessionHandle`] and drains responses and events from the outbound
//! receiver returned at construction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bearer::{ActiveBearer, Negotiator, SetupOutcome};
use crate::channel::{Channel, ListenerEvent};
use crate::command::{BipCommand, CommandKind, TransportProtocol};
use crate::connectivity::{ConnectivityChange, ConnectivityWatcher};
use crate::events::ChannelEvent;
use crate::response::{ResponseData, ResultCode, TerminalResponse};
use crate::services::{
    DataCallError, DataCallOutcome, DataCallStatus, Services, SetupToken,
};
use crate::MAX_CHANNELS;

/// Additional info for "no channel available".
const INFO_NO_CHANNEL_AVAILABLE: u8 = 0x01;
/// Additional info for "channel identifier not valid".
const INFO_CHANNEL_ID_INVALID: u8 = 0x03;

/// Something the engine wants delivered back toward the SIM.
#[derive(Debug)]
pub enum Outbound {
    /// Terminal response concluding a command.
    Response(TerminalResponse),
    /// Asynchronous event download.
    Event(ChannelEvent),
}

/// Sender side of the outbound queue, cloned into every channel.
#[derive(Clone)]
pub(crate) struct Emitter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Emitter {
    pub(crate) fn respond(&self, response: TerminalResponse) {
        if self.tx.send(Outbound::Response(response)).is_err() {
            debug!("outbound receiver dropped, response discarded");
        }
    }

    pub(crate) fn event(&self, event: ChannelEvent) {
        if self.tx.send(Outbound::Event(event)).is_err() {
            debug!("outbound receiver dropped, event discarded");
        }
    }
}

/// Everything the driver task consumes, in arrival order.
pub(crate) enum SessionInput {
    Command(BipCommand),
    SessionEnd,
    SetupComplete {
        token: SetupToken,
        result: Result<DataCallOutcome, DataCallError>,
    },
    TeardownComplete {
        token: SetupToken,
        success: bool,
    },
    Connectivity(ConnectivityChange),
    DataCallStates(Vec<DataCallStatus>),
    Listener(ListenerEvent),
}

/// Client side of a running session driver.
///
/// All methods are fire-and-forget posts onto the driver's input queue;
/// outcomes surface on the outbound receiver.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
    occupied: Arc<AtomicUsize>,
}

impl SessionHandle {
    /// Feed a decoded BIP command.
    pub fn handle_command(&self, cmd: BipCommand) {
        self.post(SessionInput::Command(cmd));
    }

    /// Signal the end of the proactive session; idle channel listeners are
    /// restarted.
    pub fn session_ended(&self) {
        self.post(SessionInput::SessionEnd);
    }

    /// Report completion of a data-call setup previously requested through
    /// [`DataCallService::setup_data_call`](crate::services::DataCallService::setup_data_call).
    pub fn setup_complete(
        &self,
        token: SetupToken,
        result: Result<DataCallOutcome, DataCallError>,
    ) {
        self.post(SessionInput::SetupComplete { token, result });
    }

    /// Report completion of a data-call teardown previously requested
    /// through
    /// [`DataCallService::deactivate_data_call`](crate::services::DataCallService::deactivate_data_call).
    pub fn teardown_complete(&self, token: SetupToken, success: bool) {
        self.post(SessionInput::TeardownComplete { token, success });
    }

    /// Forward a system connectivity change notification.
    pub fn connectivity_changed(&self, change: ConnectivityChange) {
        self.post(SessionInput::Connectivity(change));
    }

    /// Forward an unsolicited data-call state report, used to detect loss
    /// of a dedicated bearer.
    pub fn data_call_states(&self, states: Vec<DataCallStatus>) {
        self.post(SessionInput::DataCallStates(states));
    }

    /// Whether at least one channel slot is free.
    pub fn can_accept_new_channel(&self) -> bool {
        self.occupied.load(Ordering::SeqCst) < MAX_CHANNELS
    }

    fn post(&self, input: SessionInput) {
        if self.tx.send(input).is_err() {
            debug!("session driver gone, input discarded");
        }
    }
}

/// The channel engine: slot table, bearer negotiation, and command
/// dispatch, driven by [`run`](Self::run).
pub struct Session {
    channels: [Option<Channel>; MAX_CHANNELS],
    services: Services,
    negotiator: Negotiator,
    watcher: ConnectivityWatcher,
    active_bearer: Option<ActiveBearer>,
    /// Channel settings of the last successful open, consulted for
    /// bearer-loss detection.
    current_cmd: Option<BipCommand>,
    pending_setups: FxHashMap<SetupToken, BipCommand>,
    pending_teardowns: FxHashMap<SetupToken, BipCommand>,
    token_seq: u32,
    occupied: Arc<AtomicUsize>,
    input: mpsc::UnboundedReceiver<SessionInput>,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    out: Emitter,
}

impl Session {
    /// Build a session around the given external services.
    ///
    /// Returns the driver (to be polled via [`run`](Self::run)), the handle
    /// for feeding it, and the receiver carrying responses and events.
    pub fn new(
        services: Services,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (input_tx, input) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let occupied = Arc::new(AtomicUsize::new(0));
        let session = Self {
            channels: std::array::from_fn(|_| None),
            negotiator: Negotiator::new(services.clone()),
            watcher: ConnectivityWatcher::new(services.connectivity.clone()),
            services,
            active_bearer: None,
            current_cmd: None,
            pending_setups: FxHashMap::default(),
            pending_teardowns: FxHashMap::default(),
            token_seq: 0,
            occupied: occupied.clone(),
            input,
            input_tx: input_tx.clone(),
            out: Emitter { tx: out_tx },
        };
        let handle = SessionHandle {
            tx: input_tx,
            occupied,
        };
        (session, handle, out_rx)
    }

    /// Convenience constructor that spawns the driver on the current tokio
    /// runtime.
    pub fn spawn(services: Services) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (session, handle, out_rx) = Self::new(services);
        tokio::spawn(session.run());
        (handle, out_rx)
    }

    /// Drive the session until every handle and all listener tasks are
    /// gone.
    pub async fn run(mut self) {
        while let Some(input) = self.input.recv().await {
            match input {
                SessionInput::Command(cmd) => self.handle_command(cmd).await,
                SessionInput::SessionEnd => self.on_session_end(),
                SessionInput::SetupComplete { token, result } => {
                    self.on_setup_complete(token, result).await
                }
                SessionInput::TeardownComplete { token, success } => {
                    self.on_teardown_complete(token, success)
                }
                SessionInput::Connectivity(change) => self.on_connectivity(change).await,
                SessionInput::DataCallStates(states) => self.on_data_call_states(&states),
                SessionInput::Listener(event) => self.on_listener_event(event),
            }
        }
    }

    async fn handle_command(&mut self, cmd: BipCommand) {
        debug!(kind = ?cmd.kind, qualifier = cmd.qualifier, "handling command");
        match cmd.kind {
            CommandKind::OpenChannel => self.open_channel(cmd).await,
            CommandKind::CloseChannel => self.close_channel(cmd),
            CommandKind::SendData => self.send_data(cmd).await,
            CommandKind::ReceiveData => self.receive_data(cmd),
            CommandKind::GetChannelStatus => self.channel_status(),
        }
    }

    async fn open_channel(&mut self, mut cmd: BipCommand) {
        let Some(settings) = cmd.channel_settings.as_mut() else {
            self.out.respond(TerminalResponse::plain(
                CommandKind::OpenChannel,
                ResultCode::CmdDataNotUnderstood,
            ));
            return;
        };

        let Some(slot) = self.channels.iter().position(Option::is_none) else {
            debug!("all channel slots occupied");
            self.out.respond(TerminalResponse::with_info(
                CommandKind::OpenChannel,
                ResultCode::BipError,
                INFO_NO_CHANNEL_AVAILABLE,
            ));
            return;
        };
        let slot = slot as u8 + 1;

        let Some(channel) = Channel::for_protocol(
            settings.protocol,
            slot,
            self.out.clone(),
            self.input_tx.clone(),
        ) else {
            debug!(protocol = ?settings.protocol, "unsupported transport level");
            self.out.respond(TerminalResponse::plain(
                CommandKind::OpenChannel,
                ResultCode::CmdDataNotUnderstood,
            ));
            return;
        };

        settings.channel = slot;
        self.place(slot, channel);

        let token = self.next_token();
        match self.negotiator.negotiate(&cmd, token, &self.out) {
            SetupOutcome::Ready => self.open_reserved(cmd).await,
            SetupOutcome::AwaitingConnectivity => self.watcher.set_pending(cmd),
            SetupOutcome::AwaitingDataCall => {
                self.pending_setups.insert(token, cmd);
            }
            SetupOutcome::Failed => self.release_slot(slot),
        }
    }

    /// Open the transport of an already-reserved slot; unwinds the slot
    /// (and any dedicated bearer) on failure.
    async fn open_reserved(&mut self, mut cmd: BipCommand) {
        let slot = cmd
            .channel_settings
            .as_ref()
            .map(|s| s.channel)
            .unwrap_or_default();
        let Some(channel) = self.channel_mut(slot) else {
            debug!(slot, "reserved slot vanished before open");
            return;
        };
        match channel.open(&mut cmd).await {
            Ok(()) => self.current_cmd = Some(cmd),
            Err(failure) => {
                if let Some(cid) = failure.teardown_cid {
                    self.request_teardown(cid, cmd);
                }
                self.release_slot(slot);
            }
        }
    }

    fn close_channel(&mut self, cmd: BipCommand) {
        let Some(data) = cmd.data_settings.clone() else {
            self.out.respond(TerminalResponse::plain(
                CommandKind::CloseChannel,
                ResultCode::CmdDataNotUnderstood,
            ));
            return;
        };
        let slot = data.channel;
        let out = self.out.clone();
        let teardown_cid = match self.channel_mut(slot) {
            Some(channel) => channel.close(cmd.qualifier),
            None => {
                out.respond(TerminalResponse::with_info(
                    CommandKind::CloseChannel,
                    ResultCode::BipError,
                    INFO_CHANNEL_ID_INVALID,
                ));
                return;
            }
        };
        self.current_cmd = None;
        if let Some(cid) = teardown_cid {
            self.request_teardown(cid, cmd);
        }
        self.release_slot(slot);
    }

    async fn send_data(&mut self, cmd: BipCommand) {
        let Some(data) = cmd.data_settings else {
            self.out.respond(TerminalResponse::plain(
                CommandKind::SendData,
                ResultCode::CmdDataNotUnderstood,
            ));
            return;
        };
        let out = self.out.clone();
        match self.channel_mut(data.channel) {
            Some(channel) => channel.send(cmd.qualifier, data.data.as_ref()).await,
            None => out.respond(TerminalResponse::with_info(
                CommandKind::SendData,
                ResultCode::BipError,
                INFO_CHANNEL_ID_INVALID,
            )),
        }
    }

    fn receive_data(&mut self, cmd: BipCommand) {
        let Some(data) = cmd.data_settings else {
            self.out.respond(TerminalResponse::plain(
                CommandKind::ReceiveData,
                ResultCode::CmdDataNotUnderstood,
            ));
            return;
        };
        let out = self.out.clone();
        match self.channel_mut(data.channel) {
            Some(channel) => channel.receive(data.length),
            None => out.respond(TerminalResponse::with_info(
                CommandKind::ReceiveData,
                ResultCode::BipError,
                INFO_CHANNEL_ID_INVALID,
            )),
        }
    }

    fn channel_status(&self) {
        let status = self
            .channels
            .iter()
            .map(|slot| slot.as_ref().map_or(0, Channel::status_word))
            .collect();
        self.out.respond(TerminalResponse {
            command: CommandKind::GetChannelStatus,
            result: ResultCode::Ok,
            additional_info: None,
            data: Some(ResponseData::ChannelStatus(status)),
        });
    }

    fn on_session_end(&mut self) {
        debug!("session end");
        for channel in self.channels.iter_mut().flatten() {
            channel.on_session_end();
        }
    }

    async fn on_setup_complete(
        &mut self,
        token: SetupToken,
        result: Result<DataCallOutcome, DataCallError>,
    ) {
        let Some(cmd) = self.pending_setups.remove(&token) else {
            debug!(?token, "setup completion without a pending open, ignored");
            return;
        };
        self.on_setup_resolved(cmd, result).await;
    }

    async fn on_setup_resolved(
        &mut self,
        mut cmd: BipCommand,
        result: Result<DataCallOutcome, DataCallError>,
    ) {
        match result {
            Ok(DataCallOutcome::DefaultBearer) => self.open_reserved(cmd).await,
            Ok(DataCallOutcome::Dedicated(info)) => {
                if let Some(settings) = cmd.channel_settings.as_mut() {
                    settings.cid = Some(info.cid);
                }
                debug!(cid = info.cid, interface = %info.interface, "data call up");
                if !info.gateways.is_empty() {
                    if let Err(e) = self
                        .services
                        .routes
                        .add_route(&info.interface, &info.gateways)
                    {
                        warn!(interface = %info.interface, "adding routes failed: {e}");
                    }
                }
                self.active_bearer = Some(ActiveBearer {
                    interface: info.interface,
                    gateways: info.gateways,
                });
                self.open_reserved(cmd).await;
            }
            Err(e) => {
                warn!("bearer setup failed: {e}");
                let slot = match cmd.channel_settings.as_ref() {
                    Some(settings) => {
                        self.out.respond(TerminalResponse {
                            command: CommandKind::OpenChannel,
                            result: ResultCode::NetworkCurrentlyUnable,
                            additional_info: None,
                            data: Some(ResponseData::OpenChannel {
                                buffer_size: settings.buffer_size,
                                status: None,
                                bearer: settings.bearer.clone(),
                            }),
                        });
                        settings.channel
                    }
                    None => 0,
                };
                self.release_slot(slot);
            }
        }
    }

    fn on_teardown_complete(&mut self, token: SetupToken, success: bool) {
        let Some(cmd) = self.pending_teardowns.remove(&token) else {
            debug!(?token, "teardown completion without a pending request, ignored");
            return;
        };
        if !success {
            warn!(?token, "data call teardown reported failure");
        }
        self.remove_active_routes();
        let slot = match cmd.kind {
            CommandKind::OpenChannel => cmd
                .channel_settings
                .as_ref()
                .map(|s| s.channel)
                .unwrap_or_default(),
            _ => cmd
                .data_settings
                .as_ref()
                .map(|d| d.channel)
                .unwrap_or_default(),
        };
        // Usually a no-op; the slot was already freed when the close or the
        // failed open was processed.
        self.release_slot(slot);
    }

    async fn on_connectivity(&mut self, change: ConnectivityChange) {
        if let Some((cmd, result)) = self.watcher.on_change(change) {
            self.on_setup_resolved(cmd, result).await;
        }
    }

    /// Bearer-loss detection from unsolicited data-call state reports.
    ///
    /// When the dedicated data call of the most recently opened channel is
    /// no longer listed as active, that channel is dropped and the whole
    /// slot table is cleared. Server channels ride no bearer and never
    /// trigger this.
    fn on_data_call_states(&mut self, states: &[DataCallStatus]) {
        let (slot, cid) = match self
            .current_cmd
            .as_ref()
            .and_then(|cmd| cmd.channel_settings.as_ref())
        {
            Some(settings) if settings.protocol != TransportProtocol::TcpServer => {
                match settings.cid {
                    Some(cid) => (settings.channel, cid),
                    None => return,
                }
            }
            _ => return,
        };

        if states.iter().any(|s| s.cid == cid && s.active) {
            return;
        }

        warn!(cid, slot, "dedicated bearer lost, dropping channels");
        if let Some(channel) = self.channel_mut(slot) {
            channel.dropped();
        }
        self.remove_active_routes();
        for entry in self.channels.iter_mut() {
            *entry = None;
        }
        self.occupied.store(0, Ordering::SeqCst);
        self.watcher.stop_listening();
        self.current_cmd = None;
    }

    fn on_listener_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Listening { slot } => {
                if let Some(status) = self.channel_mut(slot).and_then(Channel::on_listening) {
                    self.out.event(ChannelEvent::StatusChanged { status });
                }
            }
            ListenerEvent::Accepted { slot, stream } => {
                if let Some(status) = self
                    .channel_mut(slot)
                    .and_then(|channel| channel.on_accepted(stream))
                {
                    self.out.event(ChannelEvent::StatusChanged { status });
                }
            }
            ListenerEvent::Data { slot, data } => {
                if let Some((status, available)) =
                    self.channel_mut(slot).map(|channel| channel.on_data(&data))
                {
                    self.out.event(ChannelEvent::DataAvailable { status, available });
                }
            }
            ListenerEvent::Closed { slot } => {
                if let Some(channel) = self.channel_mut(slot) {
                    channel.on_listener_closed();
                }
            }
        }
    }

    fn request_teardown(&mut self, cid: u32, cmd: BipCommand) {
        let token = self.next_token();
        debug!(cid, ?token, "requesting data call teardown");
        self.pending_teardowns.insert(token, cmd);
        self.services.data_calls.deactivate_data_call(token, cid);
    }

    fn remove_active_routes(&mut self) {
        if let Some(bearer) = self.active_bearer.take() {
            if bearer.gateways.is_empty() {
                return;
            }
            if let Err(e) = self
                .services
                .routes
                .remove_route(&bearer.interface, &bearer.gateways)
            {
                warn!(interface = %bearer.interface, "removing routes failed: {e}");
            }
        }
    }

    fn next_token(&mut self) -> SetupToken {
        self.token_seq = self.token_seq.wrapping_add(1);
        SetupToken(self.token_seq)
    }

    fn slot_index(slot: u8) -> Option<usize> {
        (1..=MAX_CHANNELS as u8)
            .contains(&slot)
            .then(|| usize::from(slot) - 1)
    }

    fn channel_mut(&mut self, slot: u8) -> Option<&mut Channel> {
        let idx = Self::slot_index(slot)?;
        self.channels[idx].as_mut()
    }

    fn place(&mut self, slot: u8, channel: Channel) {
        let Some(idx) = Self::slot_index(slot) else {
            return;
        };
        if self.channels[idx].replace(channel).is_none() {
            let prev = self.occupied.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                self.watcher.start_listening();
            }
        }
    }

    fn release_slot(&mut self, slot: u8) {
        let Some(idx) = Self::slot_index(slot) else {
            return;
        };
        if self.channels[idx].take().is_some() {
            let prev = self.occupied.fetch_sub(1, Ordering::SeqCst);
            if prev == 1 {
                self.watcher.stop_listening();
            }
        }
    }
}
