use bytes::BufMut;
use instructor::BufferMut;

use crate::hci::consts::{
    AuthenticationRequirements, DisconnectReason, IoCapability, KeyFlag, LinkKey, OobDataPresence, PacketTypes, PageScanRepetitionMode,
    RemoteAddr, Role, Status
};
use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Link control commands ([Vol 4] Part E, Section 7.1).
impl Hci {
    /// Pages a remote device and creates a baseband connection to it.
    /// Completion is signalled by a `Connection_Complete` event
    /// ([Vol 4] Part E, Section 7.1.5).
    pub async fn create_connection(&self, bd_addr: RemoteAddr, packet_types: PacketTypes, allow_role_switch: bool) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0005), |p| {
            p.write_le(bd_addr);
            p.write_le(packet_types);
            p.write_le(PageScanRepetitionMode::R1);
            p.write_le(0x00u8); // reserved
            p.write_le(0x0000u16); // clock offset, invalid
            p.write_le(u8::from(allow_role_switch));
        })
        .await
    }

    /// Cancels an outstanding `Create_Connection` attempt
    /// ([Vol 4] Part E, Section 7.1.7).
    pub async fn create_connection_cancel(&self, bd_addr: RemoteAddr) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0008), |p| {
            p.write_le(bd_addr);
        })
        .await
    }

    /// Terminates an existing connection. Completion is signalled by a
    /// `Disconnection_Complete` event ([Vol 4] Part E, Section 7.1.6).
    pub async fn disconnect(&self, handle: u16, reason: DisconnectReason) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0006), |p| {
            p.write_le(handle);
            p.write_le(reason);
        })
        .await
    }

    /// Accepts a connection request from a remote device
    /// ([Vol 4] Part E, Section 7.1.8).
    pub async fn accept_connection_request(&self, bd_addr: RemoteAddr, role: Role) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0009), |p| {
            p.write_le(bd_addr);
            p.write_le(role);
        })
        .await
    }

    /// Rejects a connection request from a remote device
    /// ([Vol 4] Part E, Section 7.1.9).
    pub async fn reject_connection_request(&self, bd_addr: RemoteAddr, reason: Status) -> Result<(), Error> {
        debug_assert!(matches!(
            reason,
            Status::ConnectionRejectedDueToLimitedResources
                | Status::ConnectionRejectedDueToSecurityReasons
                | Status::ConnectionRejectedDueToUnacceptableBdAddr
        ));
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x000A), |p| {
            p.write_le(bd_addr);
            p.write_le(reason);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.10).
    pub async fn link_key_request_reply(&self, bd_addr: RemoteAddr, key: &LinkKey) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x000B), |p| {
            p.write_le(bd_addr);
            p.write_le_ref(key);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.11).
    pub async fn link_key_request_negative_reply(&self, bd_addr: RemoteAddr) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x000C), |p| {
            p.write_le(bd_addr);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.12).
    pub async fn pin_code_request_reply(&self, bd_addr: RemoteAddr, pin: &str) -> Result<RemoteAddr, Error> {
        debug_assert!(pin.len() <= 16);
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x000D), |p| {
            p.write_le(bd_addr);
            p.write_le(pin.len() as u8);
            p.put_slice(pin.as_bytes());
            p.put_bytes(0, 16 - pin.len());
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.13).
    pub async fn pin_code_request_negative_reply(&self, bd_addr: RemoteAddr) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x000E), |p| {
            p.write_le(bd_addr);
        })
        .await
    }

    /// Switches between the semi-permanent and the temporary piconet key.
    /// Completion is signalled by a `Master_Link_Key_Complete` event
    /// ([Vol 4] Part E, Section 7.1.17).
    pub async fn master_link_key(&self, key_flag: KeyFlag) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0017), |p| {
            p.write_le(key_flag);
        })
        .await
    }

    /// Starts authentication of the link key for a connection. Completion is
    /// signalled by an `Authentication_Complete` event
    /// ([Vol 4] Part E, Section 7.1.15).
    pub async fn authentication_requested(&self, handle: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0011), |p| {
            p.write_le(handle);
        })
        .await
    }

    /// Turns link level encryption on or off. Completion is signalled by an
    /// `Encryption_Change` event ([Vol 4] Part E, Section 7.1.16).
    pub async fn set_connection_encryption(&self, handle: u16, enable: bool) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0013), |p| {
            p.write_le(handle);
            p.write_le(u8::from(enable));
        })
        .await
    }

    /// Requests the LMP features of a remote device. Completion is signalled
    /// by a `Read_Remote_Supported_Features_Complete` event
    /// ([Vol 4] Part E, Section 7.1.21).
    pub async fn read_remote_supported_features(&self, handle: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x001B), |p| {
            p.write_le(handle);
        })
        .await
    }

    /// Requests the clock offset of a remote device. Completion is signalled
    /// by a `Read_Clock_Offset_Complete` event
    /// ([Vol 4] Part E, Section 7.1.23).
    pub async fn read_clock_offset(&self, handle: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x001F), |p| {
            p.write_le(handle);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.29).
    pub async fn io_capability_request_reply(
        &self, bd_addr: RemoteAddr, io: IoCapability, oob: OobDataPresence, auth: AuthenticationRequirements
    ) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x002B), |p| {
            p.write_le(bd_addr);
            p.write_le(io);
            p.write_le(oob);
            p.write_le(auth);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.36).
    pub async fn io_capability_request_negative_reply(&self, bd_addr: RemoteAddr, reason: Status) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x0034), |p| {
            p.write_le(bd_addr);
            p.write_le(reason);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.30).
    pub async fn user_confirmation_request_reply(&self, bd_addr: RemoteAddr) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x002C), |p| {
            p.write_le(bd_addr);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.1.31).
    pub async fn user_confirmation_request_negative_reply(&self, bd_addr: RemoteAddr) -> Result<RemoteAddr, Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkControl, 0x002D), |p| {
            p.write_le(bd_addr);
        })
        .await
    }
}
