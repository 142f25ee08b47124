use bitflags::bitflags;
use instructor::{BufferMut, Exstruct, Instruct};

use crate::hci::consts::{FlowDirection, RemoteAddr, Role, ServiceType};
use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Link policy commands ([Vol 4] Part E, Section 7.2).
impl Hci {
    /// Places the connection into hold mode. Completion is signalled by a
    /// `Mode_Change` event ([Vol 4] Part E, Section 7.2.1).
    pub async fn hold_mode(&self, handle: u16, max_interval: u16, min_interval: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0001), |p| {
            p.write_le(handle);
            p.write_le(max_interval);
            p.write_le(min_interval);
        })
        .await
    }

    /// Places the connection into sniff mode. Completion is signalled by a
    /// `Mode_Change` event ([Vol 4] Part E, Section 7.2.2).
    pub async fn sniff_mode(&self, handle: u16, params: SniffMode) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0003), |p| {
            p.write_le(handle);
            p.write_le(params);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.2.3).
    pub async fn exit_sniff_mode(&self, handle: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0004), |p| {
            p.write_le(handle);
        })
        .await
    }

    /// Places the connection into park state. Completion is signalled by a
    /// `Mode_Change` event ([Vol 4] Part E, Section 7.2.5).
    pub async fn park_state(&self, handle: u16, beacon_max_interval: u16, beacon_min_interval: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0005), |p| {
            p.write_le(handle);
            p.write_le(beacon_max_interval);
            p.write_le(beacon_min_interval);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.2.4).
    pub async fn exit_park_state(&self, handle: u16) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0006), |p| {
            p.write_le(handle);
        })
        .await
    }

    /// Specifies quality of service parameters for the connection. Completion
    /// is signalled by a `QoS_Setup_Complete` event
    /// ([Vol 4] Part E, Section 7.2.6).
    pub async fn qos_setup(&self, handle: u16, qos: QualityOfService) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0007), |p| {
            p.write_le(handle);
            p.write_le(0x00u8); // unused
            p.write_le(qos);
        })
        .await
    }

    /// Returns the current role of the local device on the connection
    /// ([Vol 4] Part E, Section 7.2.7).
    pub async fn role_discovery(&self, handle: u16) -> Result<Role, Error> {
        let (_, role): (u16, Role) = self
            .call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0009), |p| {
                p.write_le(handle);
            })
            .await?;
        Ok(role)
    }

    /// Requests a master/slave switch with a remote device. Completion is
    /// signalled by a `Role_Change` event ([Vol 4] Part E, Section 7.2.8).
    pub async fn switch_role(&self, bd_addr: RemoteAddr, role: Role) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x000B), |p| {
            p.write_le(bd_addr);
            p.write_le(role);
        })
        .await
    }

    /// ([Vol 4] Part E, Section 7.2.9).
    pub async fn read_link_policy_settings(&self, handle: u16) -> Result<LinkPolicy, Error> {
        let (_, settings): (u16, LinkPolicy) = self
            .call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x000C), |p| {
                p.write_le(handle);
            })
            .await?;
        Ok(settings)
    }

    /// ([Vol 4] Part E, Section 7.2.10).
    pub async fn write_link_policy_settings(&self, handle: u16, settings: LinkPolicy) -> Result<(), Error> {
        let _: u16 = self
            .call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x000D), |p| {
                p.write_le(handle);
                p.write_le(settings);
            })
            .await?;
        Ok(())
    }

    /// ([Vol 4] Part E, Section 7.2.11).
    pub async fn read_default_link_policy_settings(&self) -> Result<LinkPolicy, Error> {
        self.call(Opcode::new(OpcodeGroup::LinkPolicy, 0x000E)).await
    }

    /// ([Vol 4] Part E, Section 7.2.12).
    pub async fn write_default_link_policy_settings(&self, settings: LinkPolicy) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x000F), |p| {
            p.write_le(settings);
        })
        .await
    }

    /// Specifies the outgoing or incoming flow parameters of the connection.
    /// Completion is signalled by a `Flow_Specification_Complete` event
    /// ([Vol 4] Part E, Section 7.2.13).
    pub async fn flow_specification(&self, handle: u16, flow: FlowSpecification) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::LinkPolicy, 0x0010), |p| {
            p.write_le(handle);
            p.write_le(0x00u8); // unused
            p.write_le(flow);
        })
        .await
    }
}

bitflags! {

    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
    #[instructor(bitflags)]
    pub struct LinkPolicy: u16 {
        const ROLE_SWITCH = 0b001;
        const HOLD_MODE   = 0b010;
        const SNIFF_MODE  = 0b100;
    }
}

/// `Sniff_Mode` command parameters ([Vol 4] Part E, Section 7.2.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct)]
#[instructor(endian = "little")]
pub struct SniffMode {
    pub max_interval: u16,
    pub min_interval: u16,
    pub attempt: u16,
    pub timeout: u16,
}

/// QoS parameter set shared by the `QoS_Setup` command and the
/// `QoS_Setup_Complete` event ([Vol 4] Part E, Section 7.2.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
#[instructor(endian = "little")]
pub struct QualityOfService {
    pub service_type: ServiceType,
    pub token_rate: u32,
    pub peak_bandwidth: u32,
    pub latency: u32,
    pub delay_variation: u32,
}

/// Flow parameter set shared by the `Flow_Specification` command and the
/// `Flow_Specification_Complete` event ([Vol 4] Part E, Section 7.2.13).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
#[instructor(endian = "little")]
pub struct FlowSpecification {
    pub flow_direction: FlowDirection,
    pub service_type: ServiceType,
    pub token_rate: u32,
    pub token_bucket_size: u32,
    pub peak_bandwidth: u32,
    pub access_latency: u32,
}
