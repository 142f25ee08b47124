use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver as MpscReceiver, UnboundedSender as MpscSender};

/// An HCI packet with its UART-style packet type already stripped.
#[derive(Debug, Clone)]
pub enum HciPacket {
    Command(Bytes),
    Acl(Bytes),
    Event(Bytes),
}

/// One end of a bidirectional HCI packet channel.
///
/// The host end sends commands and outbound ACL data and receives events and
/// inbound ACL data; a transport driver (or a test double playing the
/// controller) owns the other end.
#[derive(Debug)]
pub struct Transport {
    pub sender: MpscSender<HciPacket>,
    pub receiver: MpscReceiver<HciPacket>,
}

impl Transport {
    /// Creates a connected host/controller pair of transport ends.
    pub fn pair() -> (Transport, Transport) {
        let (host_tx, controller_rx) = unbounded_channel();
        let (controller_tx, host_rx) = unbounded_channel();
        (
            Transport { sender: host_tx, receiver: host_rx },
            Transport { sender: controller_tx, receiver: controller_rx },
        )
    }
}
