use instructor::Exstruct;

use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Informational parameters commands ([Vol 4] Part E, Section 7.4).
impl Hci {
    /// Reads the maximum size and number of the data packets that the host
    /// can send to the controller ([Vol 4] Part E, Section 7.4.5).
    pub async fn read_buffer_size(&self) -> Result<BufferSizes, Error> {
        self.call(Opcode::new(OpcodeGroup::InfoParams, 0x0005)).await
    }
}

/// `HCI_Read_Buffer_Size` return parameters
/// ([Vol 4] Part E, Section 7.4.5).
#[derive(Default, Clone, Copy, Debug, Exstruct)]
#[instructor(endian = "little")]
pub struct BufferSizes {
    pub acl_data_packet_length: u16,
    pub synchronous_data_packet_length: u8,
    pub total_num_acl_data_packets: u16,
    pub total_num_synchronous_data_packets: u16,
}
