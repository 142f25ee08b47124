use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_lite::Stream;
use tokio::spawn;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{unbounded_channel, Receiver as BoundedReceiver, Sender as BoundedSender, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::hci::consts::{
    AddressWithType, AuthenticationRequirements, DisconnectReason, EncryptionMode, IoCapability, KeyFlag, LinkMode, RemoteAddr, Role, Status
};
use crate::hci::{AclSendError, Error, FlowSpecification, Hci, LeConnectionUpdate, LinkPolicy, QualityOfService, SniffMode};
use crate::log_assert;

/// Depth of the bounded per-link queues in either direction.
pub(crate) const CONNECTION_QUEUE_DEPTH: usize = 10;

/// Callbacks for classic connection lifecycle events.
pub trait ConnectionCallbacks: Send + 'static {
    fn on_connect_success(&mut self, connection: ClassicAclConnection);
    fn on_connect_fail(&mut self, addr: RemoteAddr, reason: Status);
}

/// Callbacks for LE connection lifecycle events.
pub trait LeConnectionCallbacks: Send + 'static {
    fn on_le_connect_success(&mut self, addr: AddressWithType, connection: LeAclConnection);
    fn on_le_connect_fail(&mut self, addr: AddressWithType, reason: Status);
}

/// Per-link events of an established classic connection.
///
/// Unhandled events are dropped.
#[allow(unused_variables)]
pub trait ConnectionManagementCallbacks: Send + 'static {
    fn on_authentication_complete(&mut self, status: Status) {}
    fn on_encryption_change(&mut self, status: Status, mode: EncryptionMode) {}
    fn on_mode_change(&mut self, status: Status, mode: LinkMode, interval: u16) {}
    fn on_role_change(&mut self, status: Status, role: Role) {}
    fn on_qos_setup_complete(&mut self, status: Status, qos: QualityOfService) {}
    fn on_flow_specification_complete(&mut self, status: Status, flow: FlowSpecification) {}
    fn on_read_clock_offset_complete(&mut self, status: Status, clock_offset: u16) {}
    fn on_read_remote_supported_features_complete(&mut self, status: Status, features: u64) {}
    fn on_master_link_key_complete(&mut self, status: Status, key_flag: KeyFlag) {}
    fn on_disconnection(&mut self, reason: Status) {}
}

/// Per-link events of an established LE connection.
#[allow(unused_variables)]
pub trait LeConnectionManagementCallbacks: Send + 'static {
    fn on_connection_update(&mut self, conn_interval: u16, conn_latency: u16, supervision_timeout: u16) {}
    fn on_disconnection(&mut self, reason: Status) {}
}

/// Hook for the security subsystem. Requests arriving while no hook is
/// registered are answered with negative replies.
#[allow(unused_variables)]
pub trait SecurityCallbacks: Send + 'static {
    fn on_link_key_request(&mut self, addr: RemoteAddr) {}
    fn on_pin_code_request(&mut self, addr: RemoteAddr) {}
    fn on_io_capability_request(&mut self, addr: RemoteAddr) {}
    fn on_io_capability_response(&mut self, addr: RemoteAddr, io: IoCapability, oob: bool, auth: AuthenticationRequirements) {}
    fn on_user_confirmation_request(&mut self, addr: RemoteAddr, passkey: u32) {}
    fn on_simple_pairing_complete(&mut self, status: Status, addr: RemoteAddr) {}
}

pub(crate) enum ClientEvent {
    ConnectSuccess(ClassicAclConnection),
    ConnectFail { addr: RemoteAddr, reason: Status },
}

pub(crate) enum LeClientEvent {
    ConnectSuccess { addr: AddressWithType, connection: LeAclConnection },
    ConnectFail { addr: AddressWithType, reason: Status },
}

pub(crate) enum ConnectionEvent {
    AuthenticationComplete { status: Status },
    EncryptionChange { status: Status, mode: EncryptionMode },
    ModeChange { status: Status, mode: LinkMode, interval: u16 },
    RoleChange { status: Status, role: Role },
    QosSetupComplete { status: Status, qos: QualityOfService },
    FlowSpecificationComplete { status: Status, flow: FlowSpecification },
    ReadClockOffsetComplete { status: Status, clock_offset: u16 },
    ReadRemoteSupportedFeaturesComplete { status: Status, features: u64 },
    MasterLinkKeyComplete { status: Status, key_flag: KeyFlag },
    Disconnected { reason: Status },
}

pub(crate) enum LeConnectionEvent {
    ConnectionUpdate {
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    Disconnected { reason: Status },
}

pub(crate) enum SecurityEvent {
    LinkKeyRequest { addr: RemoteAddr },
    PinCodeRequest { addr: RemoteAddr },
    IoCapabilityRequest { addr: RemoteAddr },
    IoCapabilityResponse {
        addr: RemoteAddr,
        io: IoCapability,
        oob: bool,
        auth: AuthenticationRequirements,
    },
    UserConfirmationRequest { addr: RemoteAddr, passkey: u32 },
    SimplePairingComplete { status: Status, addr: RemoteAddr },
}

/// Spawns a task translating queued event values into callback invocations.
///
/// Receivers never run on the manager's executor; a dropped dispatcher simply
/// discards further events.
pub(crate) fn spawn_dispatcher<E, F>(mut dispatch: F) -> UnboundedSender<E>
where
    E: Send + 'static,
    F: FnMut(E) + Send + 'static,
{
    let (tx, mut rx) = unbounded_channel();
    spawn(async move {
        while let Some(event) = rx.recv().await {
            dispatch(event);
        }
        trace!("Callback dispatcher finished");
    });
    tx
}

fn send_pdu(sender: &BoundedSender<Bytes>, pdu: Bytes) -> Result<(), AclSendError> {
    match sender.try_send(pdu) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(AclSendError::QueueFull),
        Err(TrySendError::Closed(_)) => Err(AclSendError::ConnectionClosed),
    }
}

/// A live BR/EDR ACL link.
///
/// Data written here is multiplexed onto the shared controller queue by the
/// round-robin scheduler; complete inbound L2CAP PDUs are read back in
/// arrival order. The link stays established until [`Self::disconnect`] is
/// called or the remote tears it down.
pub struct ClassicAclConnection {
    handle: u16,
    addr: RemoteAddr,
    role: Role,
    hci: Arc<Hci>,
    sender: BoundedSender<Bytes>,
    receiver: BoundedReceiver<Bytes>,
    events: Option<UnboundedReceiver<ConnectionEvent>>,
}

impl ClassicAclConnection {
    pub(crate) fn new(
        handle: u16, addr: RemoteAddr, role: Role, hci: Arc<Hci>, sender: BoundedSender<Bytes>, receiver: BoundedReceiver<Bytes>,
        events: UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            handle,
            addr,
            role,
            hci,
            sender,
            receiver,
            events: Some(events),
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn remote_addr(&self) -> RemoteAddr {
        self.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queues one complete L2CAP PDU for transmission.
    pub fn send(&self, pdu: Bytes) -> Result<(), AclSendError> {
        send_pdu(&self.sender, pdu)
    }

    /// Receives the next complete inbound L2CAP PDU.
    /// Returns `None` once the link is gone.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Registers the sink for per-link management events. One-shot; repeated
    /// registrations are rejected.
    pub fn register_callbacks(&mut self, mut callbacks: impl ConnectionManagementCallbacks) -> bool {
        log_assert!(self.events.is_some());
        let Some(mut events) = self.events.take() else {
            return false;
        };
        spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::AuthenticationComplete { status } => callbacks.on_authentication_complete(status),
                    ConnectionEvent::EncryptionChange { status, mode } => callbacks.on_encryption_change(status, mode),
                    ConnectionEvent::ModeChange { status, mode, interval } => callbacks.on_mode_change(status, mode, interval),
                    ConnectionEvent::RoleChange { status, role } => callbacks.on_role_change(status, role),
                    ConnectionEvent::QosSetupComplete { status, qos } => callbacks.on_qos_setup_complete(status, qos),
                    ConnectionEvent::FlowSpecificationComplete { status, flow } => callbacks.on_flow_specification_complete(status, flow),
                    ConnectionEvent::ReadClockOffsetComplete { status, clock_offset } => {
                        callbacks.on_read_clock_offset_complete(status, clock_offset)
                    }
                    ConnectionEvent::ReadRemoteSupportedFeaturesComplete { status, features } => {
                        callbacks.on_read_remote_supported_features_complete(status, features)
                    }
                    ConnectionEvent::MasterLinkKeyComplete { status, key_flag } => callbacks.on_master_link_key_complete(status, key_flag),
                    ConnectionEvent::Disconnected { reason } => callbacks.on_disconnection(reason),
                }
            }
        });
        true
    }

    /// ([Vol 4] Part E, Section 7.1.6).
    pub async fn disconnect(&self, reason: DisconnectReason) -> Result<(), Error> {
        self.hci.disconnect(self.handle, reason).await
    }

    /// ([Vol 4] Part E, Section 7.1.15).
    pub async fn authentication_requested(&self) -> Result<(), Error> {
        self.hci.authentication_requested(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.1.16).
    pub async fn set_connection_encryption(&self, enable: bool) -> Result<(), Error> {
        self.hci.set_connection_encryption(self.handle, enable).await
    }

    /// ([Vol 4] Part E, Section 7.2.8).
    pub async fn switch_role(&self, role: Role) -> Result<(), Error> {
        self.hci.switch_role(self.addr, role).await
    }

    /// ([Vol 4] Part E, Section 7.2.1).
    pub async fn hold_mode(&self, max_interval: u16, min_interval: u16) -> Result<(), Error> {
        self.hci.hold_mode(self.handle, max_interval, min_interval).await
    }

    /// ([Vol 4] Part E, Section 7.2.2).
    pub async fn sniff_mode(&self, params: SniffMode) -> Result<(), Error> {
        self.hci.sniff_mode(self.handle, params).await
    }

    /// ([Vol 4] Part E, Section 7.2.3).
    pub async fn exit_sniff_mode(&self) -> Result<(), Error> {
        self.hci.exit_sniff_mode(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.2.5).
    pub async fn park_state(&self, beacon_max_interval: u16, beacon_min_interval: u16) -> Result<(), Error> {
        self.hci.park_state(self.handle, beacon_max_interval, beacon_min_interval).await
    }

    /// ([Vol 4] Part E, Section 7.2.4).
    pub async fn exit_park_state(&self) -> Result<(), Error> {
        self.hci.exit_park_state(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.2.6).
    pub async fn qos_setup(&self, qos: QualityOfService) -> Result<(), Error> {
        self.hci.qos_setup(self.handle, qos).await
    }

    /// ([Vol 4] Part E, Section 7.2.13).
    pub async fn flow_specification(&self, flow: FlowSpecification) -> Result<(), Error> {
        self.hci.flow_specification(self.handle, flow).await
    }

    /// ([Vol 4] Part E, Section 7.2.7).
    pub async fn role_discovery(&self) -> Result<Role, Error> {
        self.hci.role_discovery(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.2.9).
    pub async fn read_link_policy_settings(&self) -> Result<LinkPolicy, Error> {
        self.hci.read_link_policy_settings(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.2.10).
    pub async fn write_link_policy_settings(&self, settings: LinkPolicy) -> Result<(), Error> {
        self.hci.write_link_policy_settings(self.handle, settings).await
    }

    /// ([Vol 4] Part E, Section 7.1.23). The offset arrives through
    /// [`ConnectionManagementCallbacks::on_read_clock_offset_complete`].
    pub async fn read_clock_offset(&self) -> Result<(), Error> {
        self.hci.read_clock_offset(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.1.21). The feature set arrives through
    /// [`ConnectionManagementCallbacks::on_read_remote_supported_features_complete`].
    pub async fn read_remote_supported_features(&self) -> Result<(), Error> {
        self.hci.read_remote_supported_features(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.5.4).
    pub async fn read_rssi(&self) -> Result<i8, Error> {
        self.hci.read_rssi(self.handle).await
    }

    /// ([Vol 4] Part E, Section 7.5.3).
    pub async fn read_link_quality(&self) -> Result<u8, Error> {
        self.hci.read_link_quality(self.handle).await
    }
}

impl Stream for ClassicAclConnection {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Debug for ClassicAclConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassicAclConnection")
            .field("handle", &format_args!("0x{:03X}", self.handle))
            .field("addr", &self.addr)
            .field("role", &self.role)
            .finish()
    }
}

/// A live LE ACL link.
pub struct LeAclConnection {
    handle: u16,
    local_addr: AddressWithType,
    remote_addr: AddressWithType,
    role: Role,
    hci: Arc<Hci>,
    sender: BoundedSender<Bytes>,
    receiver: BoundedReceiver<Bytes>,
    events: Option<UnboundedReceiver<LeConnectionEvent>>,
}

impl LeAclConnection {
    pub(crate) fn new(
        handle: u16, local_addr: AddressWithType, remote_addr: AddressWithType, role: Role, hci: Arc<Hci>, sender: BoundedSender<Bytes>,
        receiver: BoundedReceiver<Bytes>, events: UnboundedReceiver<LeConnectionEvent>,
    ) -> Self {
        Self {
            handle,
            local_addr,
            remote_addr,
            role,
            hci,
            sender,
            receiver,
            events: Some(events),
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn local_addr(&self) -> AddressWithType {
        self.local_addr
    }

    pub fn remote_addr(&self) -> AddressWithType {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queues one complete L2CAP PDU for transmission.
    pub fn send(&self, pdu: Bytes) -> Result<(), AclSendError> {
        send_pdu(&self.sender, pdu)
    }

    /// Receives the next complete inbound L2CAP PDU.
    /// Returns `None` once the link is gone.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Registers the sink for per-link management events. One-shot; repeated
    /// registrations are rejected.
    pub fn register_callbacks(&mut self, mut callbacks: impl LeConnectionManagementCallbacks) -> bool {
        log_assert!(self.events.is_some());
        let Some(mut events) = self.events.take() else {
            return false;
        };
        spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LeConnectionEvent::ConnectionUpdate { conn_interval, conn_latency, supervision_timeout } => {
                        callbacks.on_connection_update(conn_interval, conn_latency, supervision_timeout)
                    }
                    LeConnectionEvent::Disconnected { reason } => callbacks.on_disconnection(reason),
                }
            }
        });
        true
    }

    /// ([Vol 4] Part E, Section 7.1.6).
    pub async fn disconnect(&self, reason: DisconnectReason) -> Result<(), Error> {
        self.hci.disconnect(self.handle, reason).await
    }

    /// ([Vol 4] Part E, Section 7.8.18). The accepted parameters arrive
    /// through [`LeConnectionManagementCallbacks::on_connection_update`].
    pub async fn connection_update(&self, params: LeConnectionUpdate) -> Result<(), Error> {
        self.hci.le_connection_update(self.handle, params).await
    }
}

impl Stream for LeAclConnection {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Debug for LeAclConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeAclConnection")
            .field("handle", &format_args!("0x{:03X}", self.handle))
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("role", &self.role)
            .finish()
    }
}
