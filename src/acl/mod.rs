mod classic;
pub mod connection;
mod le;
mod scheduler;

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
pub use connection::{
    ClassicAclConnection, ConnectionCallbacks, ConnectionManagementCallbacks, LeAclConnection, LeConnectionCallbacks,
    LeConnectionManagementCallbacks, SecurityCallbacks
};
use instructor::Buffer;
use parking_lot::Mutex;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender as MpscSender};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::acl::classic::ClassicImpl;
use crate::acl::le::{LeImpl, RpaRotation};
use crate::acl::scheduler::{spawn_scheduler, SchedulerHandle};
use crate::hci::acl::AclHeader;
use crate::hci::consts::{AddressWithType, EventCode, KeyFlag, RemoteAddr, Role, Status, SubeventCode};
use crate::hci::{Error, Hci, LinkPolicy};
use crate::utils::IgnoreableResult;

/// Inbound traffic for this handle is controller diagnostics, not ACL data.
const QUALCOMM_DEBUG_HANDLE: u16 = 0x0EDC;

enum Request {
    RegisterCallbacks(Box<dyn ConnectionCallbacks>),
    RegisterLeCallbacks(Box<dyn LeConnectionCallbacks>),
    CreateConnection(RemoteAddr),
    CancelConnect(RemoteAddr),
    CreateLeConnection(AddressWithType),
    SetLeInitiatorAddress(AddressWithType),
    MasterLinkKey(KeyFlag),
    SwitchRole(RemoteAddr, Role),
    WriteDefaultLinkPolicySettings(LinkPolicy),
    SetSecurityModule(Box<dyn SecurityCallbacks>),
    Stop,
}

/// Configuration of the ACL connection manager.
#[derive(Debug, Clone)]
pub struct AclManagerBuilder {
    default_link_policy: LinkPolicy,
    rpa: RpaRotation,
    reserved_handles: Vec<u16>,
}

impl Default for AclManagerBuilder {
    fn default() -> Self {
        Self {
            default_link_policy: LinkPolicy::empty(),
            rpa: RpaRotation::default(),
            reserved_handles: vec![QUALCOMM_DEBUG_HANDLE],
        }
    }
}

impl AclManagerBuilder {
    pub fn with_default_link_policy_settings(mut self, settings: LinkPolicy) -> Self {
        self.default_link_policy = settings;
        self
    }

    /// Configures the timing of the resolvable private address refresh: the
    /// timer fires uniformly at random within `[min, min + random_span)`.
    pub fn with_rpa_rotation_interval(mut self, min: Duration, random_span: Duration) -> Self {
        self.rpa.min_interval = min;
        self.rpa.random_span = random_span;
        self
    }

    pub fn with_irk(mut self, irk: [u8; 16]) -> Self {
        self.rpa.irk = irk;
        self
    }

    /// Inbound ACL packets for these handles are dropped without routing.
    pub fn with_reserved_handles(mut self, handles: Vec<u16>) -> Self {
        self.reserved_handles = handles;
        self
    }

    /// Starts the manager: subscribes to the connection-related HCI events,
    /// installs the inbound ACL route, and spawns the round-robin scheduler
    /// plus the serial event loop owning all connection state.
    pub async fn spawn(self, hci: Arc<Hci>) -> Result<AclManager, Error> {
        let scheduler = spawn_scheduler(&hci)?;

        let mut events = {
            let (tx, rx) = unbounded_channel();
            hci.register_event_handler(ClassicImpl::event_codes(), tx)?;
            rx
        };
        let mut le_events = {
            let (tx, rx) = unbounded_channel();
            hci.register_le_event_handler(LeImpl::subevent_codes(), tx)?;
            rx
        };
        let mut acl_data = {
            let (tx, rx) = unbounded_channel();
            hci.register_data_handler(tx)?;
            rx
        };
        let (requests_tx, mut requests) = unbounded_channel();

        let default_link_policy = self.default_link_policy;
        let mut state = ManagerState {
            classic: ClassicImpl::new(hci.clone(), scheduler.ctl(), self.default_link_policy),
            le: LeImpl::new(hci.clone(), scheduler.ctl(), self.rpa),
            reserved_handles: self.reserved_handles,
        };
        let le_supported = hci.capabilities().le_supported;

        let task = spawn(async move {
            if le_supported {
                state.le.rotate_random_address().await;
            }
            loop {
                let wake = poll_fn(|cx| {
                    if let Poll::Ready(request) = requests.poll_recv(cx) {
                        return Poll::Ready(Wake::Request(request));
                    }
                    if let Poll::Ready(event) = events.poll_recv(cx) {
                        return Poll::Ready(Wake::Event(event));
                    }
                    if let Poll::Ready(event) = le_events.poll_recv(cx) {
                        return Poll::Ready(Wake::LeEvent(event));
                    }
                    if let Poll::Ready(data) = acl_data.poll_recv(cx) {
                        return Poll::Ready(Wake::Data(data));
                    }
                    if Pin::new(&mut state.le.rotation).poll(cx).is_ready() {
                        return Poll::Ready(Wake::Rotate);
                    }
                    Poll::Pending
                })
                .await;
                match wake {
                    Wake::Request(Some(Request::Stop)) | Wake::Request(None) => break,
                    Wake::Request(Some(request)) => state.handle_request(request).await,
                    Wake::Event(Some((code, data))) => state
                        .handle_event(code, data)
                        .await
                        .unwrap_or_else(|err| warn!("Error handling {:?}: {}", code, err)),
                    Wake::LeEvent(Some((subevent, data))) => state
                        .le
                        .handle_le_event(subevent, data)
                        .await
                        .unwrap_or_else(|err| warn!("Error handling LE {:?}: {}", subevent, err)),
                    Wake::Data(Some(data)) => state
                        .route_acl_packet(data)
                        .unwrap_or_else(|err| warn!("Error routing ACL packet: {}", err)),
                    Wake::Rotate => state.le.rotate_random_address().await,
                    Wake::Event(None) | Wake::LeEvent(None) | Wake::Data(None) => break,
                }
            }
            // Teardown runs in reverse start-up order: LE before classic,
            // the scheduler last.
            state.le.shutdown().await;
            let ManagerState { classic, le, .. } = state;
            drop(le);
            drop(classic);
            scheduler.shutdown().await;
            trace!("ACL manager finished");
        });

        Ok(AclManager {
            requests: requests_tx,
            default_link_policy: Mutex::new(default_link_policy),
            task: Mutex::new(Some(task)),
        })
    }
}

enum Wake {
    Request(Option<Request>),
    Event(Option<(EventCode, Bytes)>),
    LeEvent(Option<(SubeventCode, Bytes)>),
    Data(Option<Bytes>),
    Rotate,
}

struct ManagerState {
    classic: ClassicImpl,
    le: LeImpl,
    reserved_handles: Vec<u16>,
}

impl ManagerState {
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::RegisterCallbacks(callbacks) => self.classic.handle_register_callbacks(callbacks),
            Request::RegisterLeCallbacks(callbacks) => self.le.handle_register_callbacks(callbacks),
            Request::CreateConnection(addr) => self.classic.create_connection(addr).await,
            Request::CancelConnect(addr) => self.classic.cancel_connect(addr).await,
            Request::CreateLeConnection(peer) => self.le.create_le_connection(peer).await,
            Request::SetLeInitiatorAddress(initiator) => self.le.set_le_initiator_address(initiator).await,
            Request::MasterLinkKey(key_flag) => self.classic.master_link_key(key_flag).await,
            Request::SwitchRole(addr, role) => self.classic.switch_role(addr, role).await,
            Request::WriteDefaultLinkPolicySettings(settings) => self.classic.write_default_link_policy_settings(settings).await,
            Request::SetSecurityModule(callbacks) => self.classic.set_security_module(callbacks),
            Request::Stop => unreachable!(),
        }
    }

    async fn handle_event(&mut self, code: EventCode, mut data: Bytes) -> Result<(), Error> {
        match code {
            // Disconnections are routed by handle since both sub-managers
            // share the event code.
            EventCode::DisconnectionComplete => {
                // ([Vol 4] Part E, Section 7.7.5).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let reason: Status = data.read_le()?;
                data.finish()?;
                if !status.is_ok() {
                    warn!("Disconnection of 0x{:03X} failed: {}", handle, status);
                    return Ok(());
                }
                if !self.classic.on_disconnection_complete(handle, reason) && !self.le.on_disconnection_complete(handle, reason) {
                    debug!("Disconnection complete for unknown handle 0x{:03X}", handle);
                }
                Ok(())
            }
            _ => self.classic.handle_event(code, data).await,
        }
    }

    fn route_acl_packet(&mut self, mut data: Bytes) -> Result<(), Error> {
        let header: AclHeader = data.read()?;
        if self.reserved_handles.contains(&header.handle) {
            return Ok(());
        }
        if !self.classic.route_data(header, data.clone()) && !self.le.route_data(header, data) {
            debug!("Dropping packet to unknown connection 0x{:03X}", header.handle);
        }
        Ok(())
    }
}

/// Thread-safe entry points of the ACL connection manager.
///
/// Every method posts a message to the manager's serial event loop; state is
/// never touched from the caller's context. Results surface through the
/// registered callbacks.
pub struct AclManager {
    requests: MpscSender<Request>,
    default_link_policy: Mutex<LinkPolicy>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AclManager {
    /// Registers the sink for classic connection events. One-shot.
    pub fn register_callbacks(&self, callbacks: impl ConnectionCallbacks) {
        self.requests.send(Request::RegisterCallbacks(Box::new(callbacks))).ignore();
    }

    /// Registers the sink for LE connection events. One-shot.
    pub fn register_le_callbacks(&self, callbacks: impl LeConnectionCallbacks) {
        self.requests.send(Request::RegisterLeCallbacks(Box::new(callbacks))).ignore();
    }

    /// Initiates an outgoing connection to a BR/EDR device. A repeated
    /// request for an address with an outstanding attempt is a no-op.
    pub fn create_connection(&self, addr: RemoteAddr) {
        self.requests.send(Request::CreateConnection(addr)).ignore();
    }

    /// Cancels an outstanding connection attempt. Ignored if none exists.
    pub fn cancel_connect(&self, addr: RemoteAddr) {
        self.requests.send(Request::CancelConnect(addr)).ignore();
    }

    /// Initiates an outgoing connection to an LE device.
    pub fn create_le_connection(&self, peer: AddressWithType) {
        self.requests.send(Request::CreateLeConnection(peer)).ignore();
    }

    /// Pins the LE initiator identity to a fixed random address, disabling
    /// RPA rotation. The address must be of type `RandomDevice`.
    pub fn set_le_initiator_address(&self, initiator: AddressWithType) {
        self.requests.send(Request::SetLeInitiatorAddress(initiator)).ignore();
    }

    /// ([Vol 4] Part E, Section 7.1.17).
    pub fn master_link_key(&self, key_flag: KeyFlag) {
        self.requests.send(Request::MasterLinkKey(key_flag)).ignore();
    }

    /// ([Vol 4] Part E, Section 7.2.8).
    pub fn switch_role(&self, addr: RemoteAddr, role: Role) {
        self.requests.send(Request::SwitchRole(addr, role)).ignore();
    }

    pub fn read_default_link_policy_settings(&self) -> LinkPolicy {
        *self.default_link_policy.lock()
    }

    pub fn write_default_link_policy_settings(&self, settings: LinkPolicy) {
        *self.default_link_policy.lock() = settings;
        self.requests.send(Request::WriteDefaultLinkPolicySettings(settings)).ignore();
    }

    /// Registers the security subsystem hook handling pairing related
    /// requests. One-shot.
    pub fn set_security_module(&self, callbacks: impl SecurityCallbacks) {
        self.requests.send(Request::SetSecurityModule(Box::new(callbacks))).ignore();
    }

    /// Stops the manager: drains the event loop, tears down the LE and then
    /// the classic sub-manager, and releases the scheduler. Callbacks already
    /// posted may still fire.
    pub async fn stop(&self) {
        self.requests.send(Request::Stop).ignore();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use instructor::utils::Length;
    use instructor::BufferMut;
    use tokio::select;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    use super::*;
    use crate::hci::acl::{BoundaryFlag, BroadcastFlag};
    use crate::hci::consts::{AddressType, LinkMode};
    use crate::hci::transport::{HciPacket, Transport};
    use crate::hci::LE_FEATURE_EXTENDED_ADVERTISING;

    const PEER: RemoteAddr = RemoteAddr::new([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);

    /// Scripted controller double answering every command with success and
    /// echoing back configured capabilities.
    struct Controller {
        events: UnboundedSender<Bytes>,
        acl_in: UnboundedSender<Bytes>,
        acl: UnboundedReceiver<Bytes>,
        commands: UnboundedReceiver<u16>,
    }

    fn spawn_controller(mut transport: Transport, le_features: u64) -> Controller {
        let (event_tx, mut event_rx) = unbounded_channel::<Bytes>();
        let (acl_in_tx, mut acl_in_rx) = unbounded_channel::<Bytes>();
        let (acl_tx, acl_rx) = unbounded_channel();
        let (cmd_tx, cmd_rx) = unbounded_channel();
        spawn(async move {
            loop {
                select! {
                    packet = transport.receiver.recv() => match packet {
                        Some(HciPacket::Command(data)) => {
                            let opcode = u16::from_le_bytes([data[0], data[1]]);
                            let _ = cmd_tx.send(opcode);
                            let mut params = vec![0x00u8];
                            match opcode {
                                // Read_Buffer_Size
                                0x1005 => {
                                    params.extend_from_slice(&1021u16.to_le_bytes());
                                    params.push(64);
                                    params.extend_from_slice(&8u16.to_le_bytes());
                                    params.extend_from_slice(&8u16.to_le_bytes());
                                }
                                // LE_Read_Buffer_Size
                                0x2002 => {
                                    params.extend_from_slice(&251u16.to_le_bytes());
                                    params.push(8);
                                }
                                // LE_Read_Local_Supported_Features
                                0x2003 => params.extend_from_slice(&le_features.to_le_bytes()),
                                _ => {}
                            }
                            let mut packet = BytesMut::new();
                            packet.put_u8(0x0E);
                            packet.put_u8((3 + params.len()) as u8);
                            packet.put_u8(1);
                            packet.put_u16_le(opcode);
                            packet.put_slice(&params);
                            let _ = transport.sender.send(HciPacket::Event(packet.freeze()));
                        }
                        Some(HciPacket::Acl(data)) => {
                            let _ = acl_tx.send(data);
                        }
                        Some(HciPacket::Event(_)) => {}
                        None => break,
                    },
                    event = event_rx.recv() => match event {
                        Some(data) => {
                            let _ = transport.sender.send(HciPacket::Event(data));
                        }
                        None => break,
                    },
                    data = acl_in_rx.recv() => match data {
                        Some(data) => {
                            let _ = transport.sender.send(HciPacket::Acl(data));
                        }
                        None => break,
                    },
                }
            }
        });
        Controller { events: event_tx, acl_in: acl_in_tx, acl: acl_rx, commands: cmd_rx }
    }

    async fn setup() -> (Arc<Hci>, AclManager, Controller) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let (host, controller_end) = Transport::pair();
        let mut controller = spawn_controller(controller_end, LE_FEATURE_EXTENDED_ADVERTISING);
        let hci = Arc::new(Hci::new(host).await.unwrap());
        let manager = AclManagerBuilder::default().spawn(hci.clone()).await.unwrap();
        // Start-up issues a fixed command sequence ending in the first RPA
        // rotation.
        for opcode in [0x0C03, 0x0C01, 0x1005, 0x2002, 0x2003, 0x2005] {
            assert_eq!(controller.commands.recv().await.unwrap(), opcode);
        }
        (hci, manager, controller)
    }

    async fn next_command(controller: &mut Controller) -> u16 {
        controller.commands.recv().await.unwrap()
    }

    fn event(code: u8, params: &[u8]) -> Bytes {
        let mut packet = BytesMut::new();
        packet.put_u8(code);
        packet.put_u8(params.len() as u8);
        packet.put_slice(params);
        packet.freeze()
    }

    fn connection_complete(status: Status, handle: u16, addr: RemoteAddr) -> Bytes {
        let mut params = BytesMut::new();
        params.write_le(status);
        params.write_le(handle);
        params.write_le(addr);
        params.put_u8(0x01); // ACL
        params.put_u8(0x00); // encryption disabled
        event(0x03, &params)
    }

    fn disconnection_complete(handle: u16, reason: Status) -> Bytes {
        let mut params = BytesMut::new();
        params.write_le(Status::Success);
        params.write_le(handle);
        params.write_le(reason);
        event(0x05, &params)
    }

    fn mode_change(handle: u16, mode: LinkMode, interval: u16) -> Bytes {
        let mut params = BytesMut::new();
        params.write_le(Status::Success);
        params.write_le(handle);
        params.write_le(mode);
        params.write_le(interval);
        event(0x14, &params)
    }

    fn link_key_request(addr: RemoteAddr) -> Bytes {
        let mut params = BytesMut::new();
        params.write_le(addr);
        event(0x17, &params)
    }

    fn le_connection_complete(status: Status, handle: u16, peer: AddressWithType) -> Bytes {
        let mut params = BytesMut::new();
        params.put_u8(0x01); // subevent
        params.write_le(status);
        params.write_le(handle);
        params.write_le(Role::Master);
        params.write_le(peer.addr_type);
        params.write_le(peer.addr);
        params.write_le(0x0028u16); // interval
        params.write_le(0x0000u16); // latency
        params.write_le(0x01F4u16); // supervision timeout
        params.put_u8(0x00); // clock accuracy
        event(0x3E, &params)
    }

    fn le_enhanced_connection_complete(status: Status, handle: u16, peer: AddressWithType, peer_rpa: RemoteAddr) -> Bytes {
        let mut params = BytesMut::new();
        params.put_u8(0x0A); // subevent
        params.write_le(status);
        params.write_le(handle);
        params.write_le(Role::Master);
        params.write_le(peer.addr_type);
        params.write_le(peer.addr);
        params.write_le(RemoteAddr::default()); // local rpa
        params.write_le(peer_rpa);
        params.write_le(0x0028u16);
        params.write_le(0x0000u16);
        params.write_le(0x01F4u16);
        params.put_u8(0x00);
        event(0x3E, &params)
    }

    fn test_pdu(payload: &[u8]) -> Bytes {
        let mut pdu = BytesMut::new();
        pdu.write_le(payload.len() as u16);
        pdu.write_le(0x0040u16);
        pdu.put_slice(payload);
        pdu.freeze()
    }

    fn acl_packet(handle: u16, pdu: &Bytes) -> Bytes {
        let mut packet = BytesMut::new();
        packet.write(AclHeader {
            handle,
            pb: BoundaryFlag::FirstAutomaticallyFlushable,
            bc: BroadcastFlag::PointToPoint,
            length: Length::new(pdu.len()).unwrap()
        });
        packet.put_slice(pdu);
        packet.freeze()
    }

    enum TestEvent {
        Connected(ClassicAclConnection),
        Failed(RemoteAddr, Status),
    }

    struct ClassicSink(UnboundedSender<TestEvent>);

    impl ConnectionCallbacks for ClassicSink {
        fn on_connect_success(&mut self, connection: ClassicAclConnection) {
            let _ = self.0.send(TestEvent::Connected(connection));
        }

        fn on_connect_fail(&mut self, addr: RemoteAddr, reason: Status) {
            let _ = self.0.send(TestEvent::Failed(addr, reason));
        }
    }

    enum LeTestEvent {
        Connected(AddressWithType, LeAclConnection),
        Failed(AddressWithType, Status),
    }

    struct LeSink(UnboundedSender<LeTestEvent>);

    impl LeConnectionCallbacks for LeSink {
        fn on_le_connect_success(&mut self, addr: AddressWithType, connection: LeAclConnection) {
            let _ = self.0.send(LeTestEvent::Connected(addr, connection));
        }

        fn on_le_connect_fail(&mut self, addr: AddressWithType, reason: Status) {
            let _ = self.0.send(LeTestEvent::Failed(addr, reason));
        }
    }

    enum MgmtEvent {
        ModeChange(Status, LinkMode, u16),
        Disconnected(Status),
    }

    struct MgmtSink(UnboundedSender<MgmtEvent>);

    impl ConnectionManagementCallbacks for MgmtSink {
        fn on_mode_change(&mut self, status: Status, mode: LinkMode, interval: u16) {
            let _ = self.0.send(MgmtEvent::ModeChange(status, mode, interval));
        }

        fn on_disconnection(&mut self, reason: Status) {
            let _ = self.0.send(MgmtEvent::Disconnected(reason));
        }
    }

    async fn connect(manager: &AclManager, controller: &mut Controller, client: &mut UnboundedReceiver<TestEvent>, handle: u16) -> ClassicAclConnection {
        manager.create_connection(PEER);
        assert_eq!(next_command(controller).await, 0x0405);
        controller.events.send(connection_complete(Status::Success, handle, PEER)).unwrap();
        match client.recv().await.unwrap() {
            TestEvent::Connected(connection) => connection,
            TestEvent::Failed(..) => panic!("connection failed"),
        }
    }

    #[tokio::test]
    async fn classic_connect_and_disconnect() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));

        let mut connection = connect(&manager, &mut controller, &mut client, 0x0042).await;
        assert_eq!(connection.handle(), 0x0042);
        assert_eq!(connection.remote_addr(), PEER);
        assert_eq!(connection.role(), Role::Master);

        // Outbound data passes through the scheduler onto the shared queue.
        let pdu = test_pdu(&[0x01, 0x02, 0x03]);
        connection.send(pdu.clone()).unwrap();
        let mut fragment = controller.acl.recv().await.unwrap();
        let header: AclHeader = fragment.read().unwrap();
        assert_eq!(header.handle, 0x0042);
        assert_eq!(header.pb, BoundaryFlag::FirstNonAutomaticallyFlushable);
        assert_eq!(fragment, pdu);

        let (sink, mut mgmt) = unbounded_channel();
        assert!(connection.register_callbacks(MgmtSink(sink)));
        controller
            .events
            .send(disconnection_complete(0x0042, Status::RemoteUserTerminatedConnection))
            .unwrap();
        assert!(matches!(
            mgmt.recv().await.unwrap(),
            MgmtEvent::Disconnected(Status::RemoteUserTerminatedConnection)
        ));
        // The record is gone, which closes the inbound queue.
        assert!(connection.read().await.is_none());

        manager.stop().await;
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));

        manager.create_connection(PEER);
        assert_eq!(next_command(&mut controller).await, 0x0405);
        controller.events.send(connection_complete(Status::PageTimeout, 0x0000, PEER)).unwrap();
        match client.recv().await.unwrap() {
            TestEvent::Failed(addr, reason) => {
                assert_eq!(addr, PEER);
                assert_eq!(reason, Status::PageTimeout);
            }
            TestEvent::Connected(_) => panic!("expected a failure"),
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn duplicate_create_connection_is_ignored() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, _client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));

        manager.create_connection(PEER);
        assert_eq!(next_command(&mut controller).await, 0x0405);
        // A second attempt to the same address must not reach the controller;
        // the key change acts as an ordering fence.
        manager.create_connection(PEER);
        manager.master_link_key(KeyFlag::Temporary);
        assert_eq!(next_command(&mut controller).await, 0x0417);
        manager.stop().await;
    }

    #[tokio::test]
    async fn reserved_handle_is_dropped() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));
        let mut connection = connect(&manager, &mut controller, &mut client, 0x0042).await;

        // Diagnostic traffic on the reserved handle disappears without a
        // trace, the following packet is delivered normally.
        let diagnostic = test_pdu(&[0xDE, 0xAD]);
        controller.acl_in.send(acl_packet(QUALCOMM_DEBUG_HANDLE, &diagnostic)).unwrap();
        let expected = test_pdu(&[0xAA, 0xBB]);
        controller.acl_in.send(acl_packet(0x0042, &expected)).unwrap();

        assert_eq!(connection.read().await.unwrap(), expected);
        manager.stop().await;
    }

    #[tokio::test]
    async fn inbound_fragments_reassemble_into_pdus() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));
        let mut connection = connect(&manager, &mut controller, &mut client, 0x0042).await;

        let pdu = test_pdu(&[0x11; 16]);
        let (first, second) = pdu.split_at(12);
        let mut packet = BytesMut::new();
        packet.write(AclHeader {
            handle: 0x0042,
            pb: BoundaryFlag::FirstAutomaticallyFlushable,
            bc: BroadcastFlag::PointToPoint,
            length: Length::new(first.len()).unwrap()
        });
        packet.put_slice(first);
        controller.acl_in.send(packet.split().freeze()).unwrap();
        packet.write(AclHeader {
            handle: 0x0042,
            pb: BoundaryFlag::Continuing,
            bc: BroadcastFlag::PointToPoint,
            length: Length::new(second.len()).unwrap()
        });
        packet.put_slice(second);
        controller.acl_in.send(packet.split().freeze()).unwrap();

        assert_eq!(connection.read().await.unwrap(), pdu);
        manager.stop().await;
    }

    #[tokio::test]
    async fn management_events_reach_the_sink() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));
        let mut connection = connect(&manager, &mut controller, &mut client, 0x0042).await;

        let (sink, mut mgmt) = unbounded_channel();
        assert!(connection.register_callbacks(MgmtSink(sink)));
        controller.events.send(mode_change(0x0042, LinkMode::Sniff, 0x0012)).unwrap();
        assert!(matches!(
            mgmt.recv().await.unwrap(),
            MgmtEvent::ModeChange(Status::Success, LinkMode::Sniff, 0x0012)
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn link_key_request_without_security_module_is_rejected() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, _client) = unbounded_channel();
        manager.register_callbacks(ClassicSink(sink));

        controller.events.send(link_key_request(PEER)).unwrap();
        // Link_Key_Request_Negative_Reply
        assert_eq!(next_command(&mut controller).await, 0x040C);
        manager.stop().await;
    }

    #[tokio::test]
    async fn le_enhanced_connection_reports_rpa() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_le_callbacks(LeSink(sink));

        let identity = AddressWithType::new(RemoteAddr::new([0x06, 0x05, 0x04, 0x03, 0x02, 0x01]), AddressType::PublicDevice);
        manager.create_le_connection(identity);
        // The controller advertises LL privacy, so the extended command is
        // used.
        assert_eq!(next_command(&mut controller).await, 0x2043);

        let rpa = RemoteAddr::new([0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x40]);
        controller
            .events
            .send(le_enhanced_connection_complete(Status::Success, 0x0100, identity, rpa))
            .unwrap();
        match client.recv().await.unwrap() {
            LeTestEvent::Connected(addr, connection) => {
                assert_eq!(addr, AddressWithType::new(rpa, AddressType::RandomDevice));
                assert_eq!(connection.handle(), 0x0100);
                assert_eq!(connection.remote_addr(), addr);
            }
            LeTestEvent::Failed(..) => panic!("connection failed"),
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn le_connect_failure_is_reported() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, mut client) = unbounded_channel();
        manager.register_le_callbacks(LeSink(sink));

        let peer = AddressWithType::new(RemoteAddr::new([0x06, 0x05, 0x04, 0x03, 0x02, 0x01]), AddressType::PublicDevice);
        manager.create_le_connection(peer);
        assert_eq!(next_command(&mut controller).await, 0x2043);
        controller
            .events
            .send(le_connection_complete(Status::ConnectionAcceptTimeoutExceeded, 0x0000, peer))
            .unwrap();
        match client.recv().await.unwrap() {
            LeTestEvent::Failed(addr, reason) => {
                assert_eq!(addr, peer);
                assert_eq!(reason, Status::ConnectionAcceptTimeoutExceeded);
            }
            LeTestEvent::Connected(..) => panic!("expected a failure"),
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn fixed_initiator_address_disables_rotation() {
        let (_hci, manager, mut controller) = setup().await;

        // A public address is not a valid initiator identity.
        manager.set_le_initiator_address(AddressWithType::new(PEER, AddressType::PublicDevice));
        manager.master_link_key(KeyFlag::Temporary);
        assert_eq!(next_command(&mut controller).await, 0x0417);

        manager.set_le_initiator_address(AddressWithType::new(PEER, AddressType::RandomDevice));
        assert_eq!(next_command(&mut controller).await, 0x2005);
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_outstanding_le_attempt() {
        let (_hci, manager, mut controller) = setup().await;
        let (sink, _client) = unbounded_channel();
        manager.register_le_callbacks(LeSink(sink));

        let peer = AddressWithType::new(RemoteAddr::new([0x06, 0x05, 0x04, 0x03, 0x02, 0x01]), AddressType::PublicDevice);
        manager.create_le_connection(peer);
        assert_eq!(next_command(&mut controller).await, 0x2043);

        manager.stop().await;
        // LE_Create_Connection_Cancel goes out during teardown.
        assert_eq!(next_command(&mut controller).await, 0x200E);
    }
}

