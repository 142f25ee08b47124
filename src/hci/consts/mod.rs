
mod events;

use std::fmt::{Debug, Display, Formatter};

pub use events::*;
use instructor::{Exstruct, Instruct};

/// Connection handles are 12 bit values ([Vol 4] Part E, Section 5.4.2).
pub const MAX_CONNECTION_HANDLE: u16 = 0x0EFF;

/// 48-bit device address in little-endian transmission order.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct RemoteAddr {
    addr: [u8; 6]
}

impl RemoteAddr {
    pub const fn new(addr: [u8; 6]) -> Self {
        Self { addr }
    }

    pub const fn is_zero(self) -> bool {
        u64::from_le_bytes([self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.addr[4], self.addr[5], 0, 0]) == 0
    }

    pub const fn into_bytes(self) -> [u8; 6] {
        self.addr
    }
}

impl From<[u8; 6]> for RemoteAddr {
    fn from(addr: [u8; 6]) -> Self {
        Self { addr }
    }
}

impl Display for RemoteAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.addr[5], self.addr[4], self.addr[3], self.addr[2], self.addr[1], self.addr[0]
        )
    }
}

impl Debug for RemoteAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Device address types ([Vol 4] Part E, Section 7.8.5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Exstruct, Instruct)]
#[repr(u8)]
pub enum AddressType {
    PublicDevice = 0x00,
    RandomDevice = 0x01,
    PublicIdentity = 0x02,
    RandomIdentity = 0x03,
}

/// A device address qualified by its address type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct AddressWithType {
    pub addr_type: AddressType,
    pub addr: RemoteAddr,
}

impl AddressWithType {
    pub const fn new(addr: RemoteAddr, addr_type: AddressType) -> Self {
        Self { addr_type, addr }
    }
}

impl Display for AddressWithType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.addr, self.addr_type)
    }
}

/// 128-bit link key ([Vol 4] Part E, Section 7.1.10).
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct LinkKey {
    key: [u8; 16]
}

impl LinkKey {
    pub const fn new(key: [u8; 16]) -> Self {
        Self { key }
    }
}

impl Debug for LinkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in self.key.iter().rev() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Link role ([Vol 4] Part E, Section 7.7.18).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum Role {
    Master = 0x00,
    Slave = 0x01,
}

/// Link types reported by connection events ([Vol 4] Part E, Section 7.7.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum LinkType {
    Sco = 0x00,
    Acl = 0x01,
    Esco = 0x02,
}

/// Class of device, 3 bytes in little-endian transmission order
/// ([Assigned Numbers] Section 2.8).
#[derive(Default, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct ClassOfDevice {
    cod: [u8; 3]
}

impl Debug for ClassOfDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoD(0x{:02X}{:02X}{:02X})", self.cod[2], self.cod[1], self.cod[0])
    }
}

/// Reasons accepted by the `Disconnect` command ([Vol 4] Part E, Section 7.1.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum DisconnectReason {
    AuthenticationFailure = 0x05,
    RemoteUserTerminatedConnection = 0x13,
    RemoteDeviceTerminatedConnectionLowResources = 0x14,
    RemoteDeviceTerminatedConnectionPowerOff = 0x15,
    UnsupportedRemoteFeature = 0x1A,
    PairingWithUnitKeyNotSupported = 0x29,
    UnacceptableConnectionParameters = 0x3B,
}

/// Key flag for the `Master_Link_Key` command ([Vol 4] Part E, Section 7.1.17).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum KeyFlag {
    SemiPermanent = 0x00,
    Temporary = 0x01,
}

// ([Vol 4] Part E, Section 7.7.8).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum EncryptionMode {
    Off = 0x00,
    E0OrAesCcm = 0x01,
    AesCcm = 0x02,
}

/// Current link mode reported by `Mode_Change` ([Vol 4] Part E, Section 7.7.20).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum LinkMode {
    Active = 0x00,
    Hold = 0x01,
    Sniff = 0x02,
    Park = 0x03,
}

// ([Vol 4] Part E, Section 7.1.29).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum IoCapability {
    DisplayOnly = 0x00,
    DisplayYesNo = 0x01,
    KeyboardOnly = 0x02,
    NoInputNoOutput = 0x03,
}

// ([Vol 4] Part E, Section 7.1.29).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum OobDataPresence {
    NotPresent = 0x00,
    P192 = 0x01,
    P256 = 0x02,
    P192AndP256 = 0x03,
}

// ([Vol 4] Part E, Section 7.1.29).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum AuthenticationRequirements {
    NoBonding = 0x00,
    NoBondingProtected = 0x01,
    DedicatedBonding = 0x02,
    DedicatedBondingProtected = 0x03,
    GeneralBonding = 0x04,
    GeneralBondingProtected = 0x05,
}

/// Service type used by QoS setup and flow specification
/// ([Vol 4] Part E, Section 7.1.18).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum ServiceType {
    NoTraffic = 0x00,
    BestEffort = 0x01,
    Guaranteed = 0x02,
}

// ([Vol 4] Part E, Section 7.2.13).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum FlowDirection {
    Outgoing = 0x00,
    Incoming = 0x01,
}

// ([Vol 4] Part E, Section 7.1.5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[repr(u8)]
pub enum PageScanRepetitionMode {
    R0 = 0x00,
    R1 = 0x01,
    R2 = 0x02,
}

bitflags::bitflags! {
    /// ACL packet types for `Create_Connection` ([Vol 4] Part E, Section 7.1.5).
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
    #[instructor(bitflags)]
    pub struct PacketTypes: u16 {
        const DM1 = 0x0008;
        const DH1 = 0x0010;
        const DM3 = 0x0400;
        const DH3 = 0x0800;
        const DM5 = 0x4000;
        const DH5 = 0x8000;
    }
}

impl Default for PacketTypes {
    fn default() -> Self {
        PacketTypes::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_reverses_transmission_order() {
        let addr = RemoteAddr::new([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn default_packet_types_allow_all_acl_packets() {
        assert_eq!(PacketTypes::default().bits(), 0xCC18);
    }
}
