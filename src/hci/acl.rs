use bytes::{BufMut, Bytes, BytesMut};
use instructor::utils::Length;
use instructor::{Exstruct, Instruct};
use tracing::warn;

use crate::utils::SliceExt;

/// Size of the L2CAP basic header that precedes every PDU.
const L2CAP_HEADER_SIZE: usize = 4;

/// Reassembles ACL data fragments into complete L2CAP PDUs.
///
/// One assembler exists per connection handle; fragments for different
/// handles must never share an assembler.
#[derive(Default)]
pub struct AclDataAssembler {
    buffer: BytesMut,
    l2cap_pdu_length: usize,
    in_progress: bool,
}

impl AclDataAssembler {
    pub fn push(&mut self, header: AclHeader, data: Bytes) -> Option<Bytes> {
        if header.bc != BroadcastFlag::PointToPoint {
            warn!("Dropping broadcast fragment for handle 0x{:03X}", header.handle);
            return None;
        }
        if header.pb.is_first() {
            if self.in_progress {
                warn!("A start fragment arrived mid PDU, dropping the partial PDU");
                self.in_progress = false;
            }
            if let Some(l2cap_pdu_length) = data
                .get_chunk(0)
                .copied()
                .map(u16::from_le_bytes) {
                self.buffer.clear();
                self.buffer.put(data);
                self.l2cap_pdu_length = l2cap_pdu_length as usize;
                self.in_progress = true;
            } else {
                warn!("A start fragment should contain a valid L2CAP PDU length");
                return None;
            }
        } else {
            if self.in_progress {
                self.buffer.put(data);
            } else {
                warn!("A continuation fragment should not be the first fragment");
                return None;
            }
        }
        debug_assert!(self.in_progress);
        match self.buffer.len().cmp(&(self.l2cap_pdu_length + L2CAP_HEADER_SIZE)) {
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Equal => {
                self.in_progress = false;
                Some(self.buffer.split().freeze())
            }
            std::cmp::Ordering::Greater => {
                warn!("L2CAP PDU length exceeded");
                self.in_progress = false;
                None
            }
        }
    }
}

/// Splits an L2CAP PDU into ACL fragments of at most `mtu` payload bytes.
///
/// The first fragment is marked as a non-flushable start, all following ones
/// as continuations.
pub fn fragment_pdu(handle: u16, pdu: &Bytes, mtu: usize) -> impl Iterator<Item = Bytes> + '_ {
    debug_assert!(mtu > 0);
    let mut buffer = BytesMut::with_capacity(pdu.len() + 8);
    let mut pb = BoundaryFlag::FirstNonAutomaticallyFlushable;
    pdu.chunks(mtu).map(move |chunk| {
        buffer.write(AclHeader {
            handle,
            pb,
            bc: BroadcastFlag::PointToPoint,
            length: Length::new(chunk.len()).expect("fragment exceeds u16 range")
        });
        buffer.put(chunk);
        pb = BoundaryFlag::Continuing;
        buffer.split().freeze()
    })
}

// ([Vol 4] Part E, Section 5.4.2).
#[derive(Debug, Copy, Clone, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct AclHeader {
    #[instructor(bitfield(u16))]
    #[instructor(bits(0..12))]
    pub handle: u16,
    #[instructor(bits(12..14))]
    pub pb: BoundaryFlag,
    #[instructor(bits(14..16))]
    pub bc: BroadcastFlag,
    pub length: Length<u16, 0>
}

// ([Vol 4] Part E, Section 5.4.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
#[repr(u8)]
pub enum BoundaryFlag {
    FirstNonAutomaticallyFlushable = 0b00,
    Continuing = 0b01,
    FirstAutomaticallyFlushable = 0b10,
}

impl BoundaryFlag {
    pub fn is_first(self) -> bool {
        matches!(self, Self::FirstNonAutomaticallyFlushable | Self::FirstAutomaticallyFlushable)
    }
}

// ([Vol 4] Part E, Section 5.4.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Instruct, Exstruct)]
#[repr(u8)]
pub enum BroadcastFlag {
    PointToPoint = 0b00,
    BrEdrBroadcast = 0b01,
}
