use instructor::{BufferMut, Exstruct, Instruct};

use crate::hci::consts::{AddressType, AddressWithType, RemoteAddr};
use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Feature bit signalling LL privacy / extended advertising support
/// ([Vol 6] Part B, Section 4.6).
pub const LE_FEATURE_EXTENDED_ADVERTISING: u64 = 0x0010;

/// Initiator filter policies for connection creation
/// ([Vol 4] Part E, Section 7.8.12).
pub const INITIATOR_FILTER_USE_PEER_ADDRESS: u8 = 0x00;

const LE_SCAN_INTERVAL: u16 = 0x0060;
const LE_SCAN_WINDOW: u16 = 0x0030;
const CONN_INTERVAL_MIN: u16 = 0x0018;
const CONN_INTERVAL_MAX: u16 = 0x0028;
const CONN_LATENCY: u16 = 0x0000;
const SUPERVISION_TIMEOUT: u16 = 0x01F4;
const MINIMUM_CE_LENGTH: u16 = 0x0002;
const MAXIMUM_CE_LENGTH: u16 = 0x0C00;

/// LE controller commands ([Vol 4] Part E, Section 7.8).
impl Hci {
    /// ([Vol 4] Part E, Section 7.8.2).
    pub async fn le_read_buffer_size(&self) -> Result<LeBufferSize, Error> {
        self.call(Opcode::new(OpcodeGroup::Le, 0x0002)).await
    }

    /// ([Vol 4] Part E, Section 7.8.3).
    pub async fn le_read_local_supported_features(&self) -> Result<u64, Error> {
        self.call(Opcode::new(OpcodeGroup::Le, 0x0003)).await
    }

    /// Sets the random device address used by the link layer
    /// ([Vol 4] Part E, Section 7.8.4).
    pub async fn le_set_random_address(&self, addr: RemoteAddr) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::Le, 0x0005), |p| {
            p.write_le(addr);
        })
        .await
    }

    /// Initiates a connection to a peer using the legacy command. Completion
    /// is signalled by an `LE_Connection_Complete` sub-event
    /// ([Vol 4] Part E, Section 7.8.12).
    pub async fn le_create_connection(&self, peer: AddressWithType, own_address_type: AddressType) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::Le, 0x000D), |p| {
            p.write_le(LE_SCAN_INTERVAL);
            p.write_le(LE_SCAN_WINDOW);
            p.write_le(INITIATOR_FILTER_USE_PEER_ADDRESS);
            p.write_le(peer.addr_type);
            p.write_le(peer.addr);
            p.write_le(own_address_type);
            p.write_le(CONN_INTERVAL_MIN);
            p.write_le(CONN_INTERVAL_MAX);
            p.write_le(CONN_LATENCY);
            p.write_le(SUPERVISION_TIMEOUT);
            p.write_le(MINIMUM_CE_LENGTH);
            p.write_le(MAXIMUM_CE_LENGTH);
        })
        .await
    }

    /// Initiates a connection to a peer with a single 1M PHY entry. Completion
    /// is signalled by an `LE_Enhanced_Connection_Complete` sub-event
    /// ([Vol 4] Part E, Section 7.8.66).
    pub async fn le_extended_create_connection(&self, peer: AddressWithType, own_address_type: AddressType) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::Le, 0x0043), |p| {
            p.write_le(INITIATOR_FILTER_USE_PEER_ADDRESS);
            p.write_le(own_address_type);
            p.write_le(peer.addr_type);
            p.write_le(peer.addr);
            p.write_le(0x01u8); // 1M PHY only
            p.write_le(LE_SCAN_INTERVAL);
            p.write_le(LE_SCAN_WINDOW);
            p.write_le(CONN_INTERVAL_MIN);
            p.write_le(CONN_INTERVAL_MAX);
            p.write_le(CONN_LATENCY);
            p.write_le(SUPERVISION_TIMEOUT);
            p.write_le(0x0000u16); // minimum CE length
            p.write_le(0x0000u16); // maximum CE length
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.8.13).
    pub async fn le_create_connection_cancel(&self) -> Result<(), Error> {
        self.call(Opcode::new(OpcodeGroup::Le, 0x000E)).await
    }

    /// Changes the connection parameters of an existing connection. Completion
    /// is signalled by an `LE_Connection_Update_Complete` sub-event
    /// ([Vol 4] Part E, Section 7.8.18).
    pub async fn le_connection_update(&self, handle: u16, params: LeConnectionUpdate) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::Le, 0x0013), |p| {
            p.write_le(handle);
            p.write_le(params);
        })
        .await
    }
}

/// `LE_Read_Buffer_Size` return parameters ([Vol 4] Part E, Section 7.8.2).
///
/// All-zero values mean the LE transport shares the BR/EDR buffers.
#[derive(Default, Debug, Copy, Clone, Exstruct)]
#[instructor(endian = "little")]
pub struct LeBufferSize {
    pub le_data_packet_length: u16,
    pub total_num_le_data_packets: u8,
}

/// `LE_Connection_Update` command parameters ([Vol 4] Part E, Section 7.8.18).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct)]
#[instructor(endian = "little")]
pub struct LeConnectionUpdate {
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub minimum_ce_length: u16,
    pub maximum_ce_length: u16,
}
