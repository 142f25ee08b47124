use instructor::BufferMut;

use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Status parameters commands ([Vol 4] Part E, Section 7.5).
impl Hci {
    /// ([Vol 4] Part E, Section 7.5.3).
    pub async fn read_link_quality(&self, handle: u16) -> Result<u8, Error> {
        let (_, quality): (u16, u8) = self
            .call_with_args(Opcode::new(OpcodeGroup::StatusParams, 0x0003), |p| {
                p.write_le(handle);
            })
            .await?;
        Ok(quality)
    }

    /// ([Vol 4] Part E, Section 7.5.4).
    pub async fn read_rssi(&self, handle: u16) -> Result<i8, Error> {
        let (_, rssi): (u16, u8) = self
            .call_with_args(Opcode::new(OpcodeGroup::StatusParams, 0x0005), |p| {
                p.write_le(handle);
            })
            .await?;
        Ok(rssi as i8)
    }
}
