use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use bytes::Bytes;
use instructor::Buffer;
use rand::Rng;
use tokio::sync::mpsc::{channel, unbounded_channel, Sender as BoundedSender, UnboundedSender};
use tokio::time::{sleep, Sleep};
use tracing::{debug, trace, warn};

use crate::acl::connection::{spawn_dispatcher, LeAclConnection, LeClientEvent, LeConnectionCallbacks, LeConnectionEvent, CONNECTION_QUEUE_DEPTH};
use crate::acl::scheduler::{ConnectionType, SchedulerCtl};
use crate::hci::acl::{AclDataAssembler, AclHeader};
use crate::hci::consts::{AddressType, AddressWithType, RemoteAddr, Role, Status, SubeventCode};
use crate::hci::{Error, Hci, LE_FEATURE_EXTENDED_ADVERTISING};
use crate::log_assert;
use crate::utils::{IgnoreableResult, OptionFuture};

/// Timing of the resolvable private address refresh.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RpaRotation {
    pub min_interval: Duration,
    pub random_span: Duration,
    pub irk: [u8; 16],
}

impl Default for RpaRotation {
    fn default() -> Self {
        // 7 minutes minimum, 15 minutes maximum between refreshes.
        Self {
            min_interval: Duration::from_millis(420_000),
            random_span: Duration::from_millis(480_000),
            irk: [0; 16],
        }
    }
}

/// LE connection state machine.
///
/// Owns every LE link keyed by its controller-assigned handle, tracks the
/// set of peers a connection attempt is outstanding for, and maintains the
/// local initiator identity including periodic RPA rotation. All methods run
/// on the ACL manager's event loop.
pub(crate) struct LeImpl {
    hci: Arc<Hci>,
    scheduler: SchedulerCtl,
    connections: BTreeMap<u16, LeConnection>,
    connecting: BTreeSet<AddressWithType>,
    callbacks: Option<UnboundedSender<LeClientEvent>>,
    initiator_address: AddressWithType,
    address_fixed: bool,
    rpa: RpaRotation,
    /// Armed whenever the initiator address is a rotating random address.
    pub rotation: OptionFuture<Pin<Box<Sleep>>>,
}

struct LeConnection {
    addr: AddressWithType,
    assembler: AclDataAssembler,
    inbound: BoundedSender<Bytes>,
    events: UnboundedSender<LeConnectionEvent>,
}

impl LeImpl {
    pub fn new(hci: Arc<Hci>, scheduler: SchedulerCtl, rpa: RpaRotation) -> Self {
        Self {
            hci,
            scheduler,
            connections: BTreeMap::new(),
            connecting: BTreeSet::new(),
            callbacks: None,
            initiator_address: AddressWithType::new(
                RemoteAddr::new([0x00, 0x11, 0xFF, 0xFF, 0x33, 0x22]),
                AddressType::RandomDevice,
            ),
            address_fixed: false,
            rpa,
            rotation: OptionFuture::never(),
        }
    }

    /// The LE meta event subset this sub-manager subscribes to.
    pub fn subevent_codes() -> impl Into<BTreeSet<SubeventCode>> {
        [
            SubeventCode::ConnectionComplete,
            SubeventCode::EnhancedConnectionComplete,
            SubeventCode::ConnectionUpdateComplete,
        ]
    }

    pub fn handle_register_callbacks(&mut self, mut callbacks: Box<dyn LeConnectionCallbacks>) {
        if self.callbacks.is_some() {
            warn!("LE connection callbacks are already registered");
            return;
        }
        self.callbacks = Some(spawn_dispatcher(move |event| match event {
            LeClientEvent::ConnectSuccess { addr, connection } => callbacks.on_le_connect_success(addr, connection),
            LeClientEvent::ConnectFail { addr, reason } => callbacks.on_le_connect_fail(addr, reason),
        }));
    }

    pub async fn create_le_connection(&mut self, peer: AddressWithType) {
        log_assert!(self.callbacks.is_some());
        if !self.connecting.insert(peer) {
            warn!("LE connection attempt to {} already outstanding", peer);
            return;
        }
        let own_address_type = self.initiator_address.addr_type;
        let result = match self.hci.capabilities().le_features & LE_FEATURE_EXTENDED_ADVERTISING != 0 {
            true => self.hci.le_extended_create_connection(peer, own_address_type).await,
            false => self.hci.le_create_connection(peer, own_address_type).await,
        };
        if let Err(err) = result {
            warn!("Failed to create LE connection to {}: {}", peer, err);
            self.connecting.remove(&peer);
        }
    }

    /// Pins the initiator identity to a caller-supplied random address and
    /// stops rotating. Only `RandomDevice` addresses can be set; controllers
    /// offer no standard way to override the public address.
    pub async fn set_le_initiator_address(&mut self, initiator: AddressWithType) {
        if initiator.addr_type != AddressType::RandomDevice {
            warn!("Rejecting non-random initiator address {}", initiator);
            return;
        }
        self.address_fixed = true;
        self.rotation.clear();
        self.initiator_address = initiator;
        self.hci
            .le_set_random_address(initiator.addr)
            .await
            .unwrap_or_else(|err| warn!("Failed to set the random address: {}", err));
    }

    /// Replaces the random address with a freshly derived RPA and re-arms the
    /// rotation timer.
    pub async fn rotate_random_address(&mut self) {
        if self.address_fixed {
            return;
        }
        let addr = generate_rpa(&self.rpa.irk, rand::random());
        trace!("Rotating the initiator address to {}", addr);
        self.hci
            .le_set_random_address(addr)
            .await
            .unwrap_or_else(|err| warn!("Failed to rotate the random address: {}", err));
        self.initiator_address = AddressWithType::new(addr, AddressType::RandomDevice);
        self.rotation.replace(Box::pin(sleep(next_rotation_interval(&self.rpa))));
    }

    /// Pushes an inbound ACL fragment into the owning link's assembler.
    /// Returns `false` when the handle belongs to no LE link.
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
        let _ = connection.events.send(LeConnectionEvent::Disconnected { reason });
        debug!("Disconnected 0x{:03X} ({}): {}", handle, connection.addr, reason);
        true
    }

    pub async fn handle_le_event(&mut self, subevent: SubeventCode, mut data: Bytes) -> Result<(), Error> {
        match subevent {
            SubeventCode::ConnectionComplete => {
                // ([Vol 4] Part E, Section 7.7.65.1).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let role: Role = data.read_le()?;
                let peer_address_type: AddressType = data.read_le()?;
                let peer_address: RemoteAddr = data.read_le()?;
                let _conn_interval: u16 = data.read_le()?;
                let _conn_latency: u16 = data.read_le()?;
                let _supervision_timeout: u16 = data.read_le()?;
                let _master_clock_accuracy: u8 = data.read_le()?;
                data.finish()?;
                let remote = AddressWithType::new(peer_address, peer_address_type);
                self.on_common_connection_complete(remote);
                match status.is_ok() {
                    true => self.on_connection_success(handle, remote, role),
                    false => self.send_client_event(LeClientEvent::ConnectFail { addr: remote, reason: status }),
                }
            }
            SubeventCode::EnhancedConnectionComplete => {
                // ([Vol 4] Part E, Section 7.7.65.10).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let role: Role = data.read_le()?;
                let peer_address_type: AddressType = data.read_le()?;
                let peer_address: RemoteAddr = data.read_le()?;
                let _local_rpa: RemoteAddr = data.read_le()?;
                let peer_rpa: RemoteAddr = data.read_le()?;
                let _conn_interval: u16 = data.read_le()?;
                let _conn_latency: u16 = data.read_le()?;
                let _supervision_timeout: u16 = data.read_le()?;
                let _master_clock_accuracy: u8 = data.read_le()?;
                data.finish()?;
                // When the controller resolved the peer, the link is keyed by
                // the RPA actually seen over the air.
                let remote = match peer_rpa.is_zero() {
                    true => AddressWithType::new(peer_address, peer_address_type),
                    false => AddressWithType::new(peer_rpa, AddressType::RandomDevice),
                };
                self.on_common_connection_complete(remote);
                match status.is_ok() {
                    true => self.on_connection_success(handle, remote, role),
                    false => self.send_client_event(LeClientEvent::ConnectFail { addr: remote, reason: status }),
                }
            }
            SubeventCode::ConnectionUpdateComplete => {
                // ([Vol 4] Part E, Section 7.7.65.3).
                let status: Status = data.read_le()?;
                let handle: u16 = data.read_le()?;
                let conn_interval: u16 = data.read_le()?;
                let conn_latency: u16 = data.read_le()?;
                let supervision_timeout: u16 = data.read_le()?;
                data.finish()?;
                if !status.is_ok() {
                    warn!("Connection update failed: {}", status);
                    return Ok(());
                }
                match self.connections.get(&handle) {
                    Some(connection) => {
                        let _ = connection.events.send(LeConnectionEvent::ConnectionUpdate {
                            conn_interval,
                            conn_latency,
                            supervision_timeout,
                        });
                    }
                    None => warn!("Connection update for unknown handle 0x{:03X}", handle),
                }
            }
            // The dispatcher only routes the subscribed sub-events here.
            _ => unreachable!()
        }
        Ok(())
    }

    fn on_common_connection_complete(&mut self, addr: AddressWithType) {
        if !self.connecting.remove(&addr) {
            warn!("No prior connection request for {}", addr);
        }
    }

    fn on_connection_success(&mut self, handle: u16, remote: AddressWithType, role: Role) {
        if self.connections.contains_key(&handle) {
            warn!("Connection complete for already known handle 0x{:03X}", handle);
            return;
        }
        let local = self.initiator_address;
        let (outbound_tx, outbound_rx) = channel(CONNECTION_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = channel(CONNECTION_QUEUE_DEPTH);
        let (events_tx, events_rx) = unbounded_channel();
        self.scheduler.register(ConnectionType::Le, handle, outbound_rx);
        self.connections.insert(handle, LeConnection {
            addr: remote,
            assembler: AclDataAssembler::default(),
            inbound: inbound_tx,
            events: events_tx,
        });
        debug!("LE connection complete: 0x{:03X} {} ({:?})", handle, remote, role);
        let connection = LeAclConnection::new(handle, local, remote, role, self.hci.clone(), outbound_tx, inbound_rx, events_rx);
        self.send_client_event(LeClientEvent::ConnectSuccess { addr: remote, connection });
    }

    fn send_client_event(&mut self, event: LeClientEvent) {
        match &self.callbacks {
            Some(callbacks) => callbacks.send(event).ignore(),
            None => warn!("No LE connection callbacks registered, dropping event"),
        }
    }

    /// Cancels an outstanding connection attempt before teardown.
    pub async fn shutdown(&mut self) {
        self.rotation.clear();
        if !self.connecting.is_empty() {
            self.hci
                .le_create_connection_cancel()
                .await
                .unwrap_or_else(|err| warn!("Failed to cancel the LE connection attempt: {}", err));
        }
    }
}

fn next_rotation_interval(rpa: &RpaRotation) -> Duration {
    let span = rpa.random_span.as_millis().max(1) as u64;
    rpa.min_interval + Duration::from_millis(rand::thread_rng().gen_range(0..span))
}

/// Derives a resolvable private address from the identity resolving key and
/// 24 bits of fresh randomness ([Vol 6] Part B, Section 1.3.2.2).
pub(crate) fn generate_rpa(irk: &[u8; 16], mut prand: [u8; 3]) -> RemoteAddr {
    // The two most significant bits mark the address as resolvable random.
    prand[2] = (prand[2] & !0xC0) | 0x40;
    let mut block = [0u8; 16];
    block[..3].copy_from_slice(&prand);

    let cipher = Aes128::new(GenericArray::from_slice(irk));
    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);

    // The hash occupies the least significant bytes, prand the most
    // significant ones.
    RemoteAddr::new([block[0], block[1], block[2], prand[0], prand[1], prand[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpa_has_resolvable_marker_bits() {
        let irk = [0x12; 16];
        for prand in [[0x00, 0x00, 0x00], [0xFF, 0xFF, 0xFF], [0x12, 0x34, 0x56]] {
            let addr = generate_rpa(&irk, prand).into_bytes();
            assert_eq!(addr[5] & 0xC0, 0x40);
        }
    }

    #[test]
    fn rpa_is_reproducible() {
        let irk = [0xA5; 16];
        let prand = [0x01, 0x02, 0x03];
        assert_eq!(generate_rpa(&irk, prand), generate_rpa(&irk, prand));
    }

    #[test]
    fn rpa_hash_matches_aes_128() {
        // Zero IRK and prand 0x400000 pin the derivation down completely.
        let irk = [0u8; 16];
        let prand = [0x00, 0x00, 0x40];

        let cipher = Aes128::new(GenericArray::from_slice(&irk));
        let mut block = GenericArray::from([0u8; 16]);
        block[2] = 0x40;
        cipher.encrypt_block(&mut block);

        let addr = generate_rpa(&irk, prand).into_bytes();
        assert_eq!(addr, [block[0], block[1], block[2], 0x00, 0x00, 0x40]);
    }

    #[test]
    fn rotation_interval_stays_in_range() {
        let rpa = RpaRotation::default();
        for _ in 0..100 {
            let interval = next_rotation_interval(&rpa);
            assert!(interval >= Duration::from_millis(420_000));
            assert!(interval < Duration::from_millis(900_000));
        }
    }
}
