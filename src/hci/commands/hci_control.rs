use instructor::BufferMut;

use crate::hci::consts::EventMask;
use crate::hci::{Error, Hci, Opcode, OpcodeGroup};

/// Controller and baseband commands ([Vol 4] Part E, Section 7.3).
impl Hci {
    /// Resets the controller's link manager, baseband, and link layer
    /// ([Vol 4] Part E, Section 7.3.2).
    pub async fn reset(&self) -> Result<(), Error> {
        self.call(Opcode::new(OpcodeGroup::HciControl, 0x0003)).await
    }

    /// Controls which events the controller is allowed to generate
    /// ([Vol 4] Part E, Section 7.3.1).
    pub async fn set_event_mask(&self, mask: EventMask) -> Result<(), Error> {
        self.call_with_args(Opcode::new(OpcodeGroup::HciControl, 0x0001), |p| {
            p.write_le(mask);
        })
        .await
    }
}
