use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use instructor::Buffer;
use tokio::sync::mpsc::{channel, unbounded_channel, Sender as BoundedSender, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::acl::connection::{
    spawn_dispatcher, ClassicAclConnection, ClientEvent, ConnectionCallbacks, ConnectionEvent, SecurityCallbacks, SecurityEvent,
    CONNECTION_QUEUE_DEPTH
};
use crate::acl::scheduler::{ConnectionType, SchedulerCtl};
use crate::ensure;
use crate::hci::acl::{AclDataAssembler, AclHeader};
use crate::hci::consts::*;
use crate::hci::{Error, FlowSpecification, Hci, LinkPolicy, QualityOfService};
use crate::utils::IgnoreableResult;

/// BR/EDR connection state machine.
///
/// Owns every classic link keyed by its controller-assigned handle and turns
/// HCI events into callback invocations on the registered sinks. All methods
/// run on the ACL manager's event loop.
pub(crate) struct ClassicImpl {
    hci: Arc<Hci>,
    scheduler: SchedulerCtl,
    connections: BTreeMap<u16, ClassicConnection>,
    connecting: BTreeSet<RemoteAddr>,
    incoming: BTreeMap<RemoteAddr, Role>,
    callbacks: Option<UnboundedSender<ClientEvent>>,
    security: Option<UnboundedSender<SecurityEvent>>,
    default_link_policy: LinkPolicy,
}

struct ClassicConnection {
    addr: RemoteAddr,
    assembler: AclDataAssembler,
    inbound: BoundedSender<Bytes>,
    events: UnboundedSender<ConnectionEvent>,
}

impl ClassicImpl {
    pub fn new(hci: Arc<Hci>, scheduler: SchedulerCtl, default_link_policy: LinkPolicy) -> Self {
        Self {
            hci,
            scheduler,
            connections: BTreeMap::new(),
            connecting: BTreeSet::new(),
            incoming: BTreeMap::new(),
            callbacks: None,
            security: None,
            default_link_policy,
        }
    }

    /// The event subset this sub-manager subscribes to.
    pub fn event_codes() -> impl Into<BTreeSet<EventCode>> {
        [
            EventCode::ConnectionRequest,
            EventCode::ConnectionComplete,
            EventCode::DisconnectionComplete,
            EventCode::AuthenticationComplete,
            EventCode::EncryptionChange,
            EventCode::ReadRemoteSupportedFeaturesComplete,
            EventCode::QosSetupComplete,
            EventCode::FlowSpecificationComplete,
            EventCode::RoleChange,
            EventCode::ModeChange,
            EventCode::ReadClockOffsetComplete,
            EventCode::MasterLinkKeyComplete,
            EventCode::LinkKeyRequest,
            EventCode::PinCodeRequest,
            EventCode::IoCapabilityRequest,
            EventCode::IoCapabilityResponse,
            EventCode::UserConfirmationRequest,
            EventCode::SimplePairingComplete,
        ]
    }

    pub fn handle_register_callbacks(&mut self, mut callbacks: Box<dyn ConnectionCallbacks>) {
        if self.callbacks.is_some() {
            warn!("Connection callbacks are already registered");
            return;
        }
        self.callbacks = Some(spawn_dispatcher(move |event| match event {
            ClientEvent::ConnectSuccess(connection) => callbacks.on_connect_success(connection),
            ClientEvent::ConnectFail { addr, reason } => callbacks.on_connect_fail(addr, reason),
        }));
    }

    pub fn set_security_module(&mut self, mut callbacks: Box<dyn SecurityCallbacks>) {
        if self.security.is_some() {
            warn!("A security module is already registered");
            return;
        }
        self.security = Some(spawn_dispatcher(move |event| match event {
            SecurityEvent::LinkKeyRequest { addr } => callbacks.on_link_key_request(addr),
            SecurityEvent::PinCodeRequest { addr } => callbacks.on_pin_code_request(addr),
            SecurityEvent::IoCapabilityRequest { addr } => callbacks.on_io_capability_request(addr),
            SecurityEvent::IoCapabilityResponse { addr, io, oob, auth } => callbacks.on_io_capability_response(addr, io, oob, auth),
            SecurityEvent::UserConfirmationRequest { addr, passkey } => callbacks.on_user_confirmation_request(addr, passkey),
            SecurityEvent::SimplePairingComplete { status, addr } => callbacks.on_simple_pairing_complete(status, addr),
        }));
    }

    pub async fn create_connection(&mut self, addr: RemoteAddr) {
        if self.connections.values().any(|connection| connection.addr == addr) {
            warn!("Already connected to {}", addr);
            return;
        }
        if !self.connecting.insert(addr) {
            warn!("Connection attempt to {} already outstanding", addr);
            return;
        }
        if let Err(err) = self.hci.create_connection(addr, PacketTypes::default(), true).await {
            warn!("Failed to create connection to {}: {}", addr, err);
            self.connecting.remove(&addr);
        }
    }

    pub async fn cancel_connect(&mut self, addr: RemoteAddr) {
        if !self.connecting.contains(&addr) {
            debug!("No outstanding connection attempt to {}", addr);
            return;
        }
        // The attempt stays marked as outstanding until the controller
        // confirms the cancellation with a Connection_Complete event.
        if let Err(err) = self.hci.create_connection_cancel(addr).await {
            warn!("Failed to cancel connection to {}: {}", addr, err);
        }
    }

    pub async fn master_link_key(&mut self, key_flag: KeyFlag) {
        self.hci
            .master_link_key(key_flag)
            .await
            .unwrap_or_else(|err| warn!("Failed to change the piconet key: {}", err));
    }

    pub async fn switch_role(&mut self, addr: RemoteAddr, role: Role) {
        self.hci
            .switch_role(addr, role)
            .await
            .unwrap_or_else(|err| warn!("Failed to switch role with {}: {}", addr, err));
    }

    pub async fn write_default_link_policy_settings(&mut self, settings: LinkPolicy) {
        self.default_link_policy = settings;
        self.hci
            .write_default_link_policy_settings(settings)
            .await
            .unwrap_or_else(|err| warn!("Failed to write the default link policy: {}", err));
    }

    /// Pushes an inbound ACL fragment into the owning link's assembler.
    /// Returns `false` when the handle belongs to no classic link.
    pub fn route_data(&mut self, header: AclHeader, data: Bytes) -> bool {
        let Some(connection) = self.connections.get_mut(&header.handle) else {
            return false;
        };
        if let Some(pdu) = connection.assembler.push(header, data) {
            connection
                .inbound
                .try_send(pdu)
                .unwrap_or_else(|_| warn!("Inbound queue of connection 0x{:03X} is full, dropping PDU", header.handle));
        }
        true
    }

    /// Tears down the link if this sub-manager owns the handle.
    pub fn on_disconnection_complete(&mut self, handle: u16, reason: Status) -> bool {
        let Some(connection) = self.connections.remove(&handle) else {
            return false;
        };
        self.scheduler.unregister(handle);
        let _ = connection.events.send(ConnectionEvent::Disconnected { reason });
        debug!("Disconnected 0x{:03X} ({}): {}", handle, connection.addr, reason);
        true
    }

    pub async fn handle_event(&mut self, code: EventCode, mut data: Bytes) -> Result<(), Error> {
        match code {
            EventCode::ConnectionRequest => {
                // ([Vol 4] Part E, Section 7.7.4).
                let addr: RemoteAddr = data.read_le()?;
                let _class: ClassOfDevice = data.read_le()?;
                let link_type: LinkType = data.read_le()?;
                data.finish()?;
                if link_type != LinkType::Acl {
                    self.hci
                        .reject_connection_request(addr, Status::ConnectionRejectedDueToUnacceptableBdAddr)
                        .await?;
                    return Ok(());
                }
                let role = match self.default_link_policy.contains(LinkPolicy::ROLE_SWITCH) {
                    true => Role::Master,
                    false => Role::Slave,
                };
                debug!("Accepting connection request from {} as {:?}", addr, role);
                self.incoming.insert(addr, role);
                self.hci.accept_connection_request(addr, role).await?;
            }
            EventCode::ConnectionComplete => {
                // ([Vol 4] Part E, Section 7.7.3).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let addr: RemoteAddr = data.read_le()?;
                let _link_type: LinkType = data.read_le()?;
                let _encryption_enabled: u8 = data.read_le()?;
                data.finish()?;
                self.on_connection_complete(status, handle, addr);
            }
            EventCode::AuthenticationComplete => {
                // ([Vol 4] Part E, Section 7.7.6).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::AuthenticationComplete { status });
            }
            EventCode::EncryptionChange => {
                // ([Vol 4] Part E, Section 7.7.8).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let mode: EncryptionMode = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::EncryptionChange { status, mode });
            }
            EventCode::ReadRemoteSupportedFeaturesComplete => {
                // ([Vol 4] Part E, Section 7.7.11).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let features: u64 = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::ReadRemoteSupportedFeaturesComplete { status, features });
            }
            EventCode::QosSetupComplete => {
                // ([Vol 4] Part E, Section 7.7.13).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let _unused: u8 = data.read_le()?;
                let qos: QualityOfService = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::QosSetupComplete { status, qos });
            }
            EventCode::FlowSpecificationComplete => {
                // ([Vol 4] Part E, Section 7.7.32).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let _unused: u8 = data.read_le()?;
                let flow: FlowSpecification = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::FlowSpecificationComplete { status, flow });
            }
            EventCode::RoleChange => {
                // ([Vol 4] Part E, Section 7.7.18).
                let status: Status = data.read_le()?;
                let addr: RemoteAddr = data.read_le()?;
                let role: Role = data.read_le()?;
                data.finish()?;
                match self.connections.iter().find(|(_, connection)| connection.addr == addr) {
                    Some((_, connection)) => {
                        let _ = connection.events.send(ConnectionEvent::RoleChange { status, role });
                    }
                    None => warn!("Role change for unknown device {}", addr),
                }
            }
            EventCode::ModeChange => {
                // ([Vol 4] Part E, Section 7.7.20).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let mode: LinkMode = data.read_le()?;
                let interval: u16 = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::ModeChange { status, mode, interval });
            }
            EventCode::ReadClockOffsetComplete => {
                // ([Vol 4] Part E, Section 7.7.23).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let clock_offset: u16 = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::ReadClockOffsetComplete { status, clock_offset });
            }
            EventCode::MasterLinkKeyComplete => {
                // ([Vol 4] Part E, Section 7.7.10).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let key_flag: KeyFlag = data.read_le()?;
                data.finish()?;
                self.send_connection_event(handle, ConnectionEvent::MasterLinkKeyComplete { status, key_flag });
            }
            EventCode::LinkKeyRequest => {
                // ([Vol 4] Part E, Section 7.7.23).
                let addr: RemoteAddr = data.read_le()?;
                data.finish()?;
                if !self.send_security_event(SecurityEvent::LinkKeyRequest { addr }) {
                    self.hci.link_key_request_negative_reply(addr).await?;
                }
            }
            EventCode::PinCodeRequest => {
                // ([Vol 4] Part E, Section 7.7.22).
                let addr: RemoteAddr = data.read_le()?;
                data.finish()?;
                if !self.send_security_event(SecurityEvent::PinCodeRequest { addr }) {
                    self.hci.pin_code_request_negative_reply(addr).await?;
                }
            }
            EventCode::IoCapabilityRequest => {
                // ([Vol 4] Part E, Section 7.7.40).
                let addr: RemoteAddr = data.read_le()?;
                data.finish()?;
                if !self.send_security_event(SecurityEvent::IoCapabilityRequest { addr }) {
                    self.hci
                        .io_capability_request_negative_reply(addr, Status::PairingNotAllowed)
                        .await?;
                }
            }
            EventCode::IoCapabilityResponse => {
                // ([Vol 4] Part E, Section 7.7.41).
                let addr: RemoteAddr = data.read_le()?;
                let io: IoCapability = data.read_le()?;
                let oob: u8 = data.read_le()?;
                let auth: AuthenticationRequirements = data.read_le()?;
                data.finish()?;
                self.send_security_event(SecurityEvent::IoCapabilityResponse { addr, io, oob: oob != 0, auth });
            }
            EventCode::UserConfirmationRequest => {
                // ([Vol 4] Part E, Section 7.7.42).
                let addr: RemoteAddr = data.read_le()?;
                let passkey: u32 = data.read_le()?;
                ensure!(passkey <= 999999, instructor::Error::InvalidValue);
                data.finish()?;
                if !self.send_security_event(SecurityEvent::UserConfirmationRequest { addr, passkey }) {
                    self.hci.user_confirmation_request_negative_reply(addr).await?;
                }
            }
            EventCode::SimplePairingComplete => {
                // ([Vol 4] Part E, Section 7.7.45).
                let status: Status = data.read_le()?;
                let addr: RemoteAddr = data.read_le()?;
                data.finish()?;
                self.send_security_event(SecurityEvent::SimplePairingComplete { status, addr });
            }
            _ => unreachable!()
        }
        Ok(())
    }

    fn on_connection_complete(&mut self, status: Status, handle: u16, addr: RemoteAddr) {
        let outgoing = self.connecting.remove(&addr);
        let accepted_role = self.incoming.remove(&addr);
        if !status.is_ok() {
            debug!("Connection to {} failed: {}", addr, status);
            self.send_client_event(ClientEvent::ConnectFail { addr, reason: status });
            return;
        }
        if self.connections.contains_key(&handle) {
            warn!("Connection complete for already known handle 0x{:03X}", handle);
            return;
        }
        let role = match outgoing {
            true => Role::Master,
            false => accepted_role.unwrap_or(Role::Slave),
        };
        let (outbound_tx, outbound_rx) = channel(CONNECTION_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = channel(CONNECTION_QUEUE_DEPTH);
        let (events_tx, events_rx) = unbounded_channel();
        self.scheduler.register(ConnectionType::Classic, handle, outbound_rx);
        self.connections.insert(handle, ClassicConnection {
            addr,
            assembler: AclDataAssembler::default(),
            inbound: inbound_tx,
            events: events_tx,
        });
        debug!("Connection complete: 0x{:03X} {} ({:?})", handle, addr, role);
        let connection = ClassicAclConnection::new(handle, addr, role, self.hci.clone(), outbound_tx, inbound_rx, events_rx);
        self.send_client_event(ClientEvent::ConnectSuccess(connection));
    }

    fn send_client_event(&mut self, event: ClientEvent) {
        match &self.callbacks {
            Some(callbacks) => callbacks.send(event).ignore(),
            None => warn!("No connection callbacks registered, dropping event"),
        }
    }

    fn send_connection_event(&mut self, handle: u16, event: ConnectionEvent) {
        match self.connections.get(&handle) {
            Some(connection) => {
                let _ = connection.events.send(event);
            }
            None => warn!("Event for unknown connection handle 0x{:03X}", handle),
        }
    }

    fn send_security_event(&mut self, event: SecurityEvent) -> bool {
        match &self.security {
            Some(security) => {
                security.send(event).ignore();
                true
            }
            None => {
                trace!("No security module registered");
                false
            }
        }
    }
}
