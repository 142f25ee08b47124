pub mod acl;
pub mod btsnoop;
mod commands;
pub mod consts;
mod error;
mod event_loop;
pub mod transport;

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};

use bytes::{Bytes, BytesMut};
pub use commands::*;
pub use error::{AclSendError, Error};
use instructor::{Buffer, BufferMut, Exstruct, LittleEndian};
use parking_lot::Mutex;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender as MpscSender};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::hci::consts::{EventCode, EventMask, Status, SubeventCode};
use crate::hci::event_loop::{CmdResultSender, EventLoopCommand};
use crate::hci::transport::Transport;

/// Buffer sizes and LE features advertised by the controller during setup.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControllerCapabilities {
    pub acl_data_packet_length: usize,
    pub total_num_acl_data_packets: u16,
    /// Zero when the LE transport shares the BR/EDR buffers.
    pub le_data_packet_length: usize,
    pub total_num_le_data_packets: u16,
    pub le_features: u64,
    pub le_supported: bool,
}

/// Handle to a running HCI layer.
///
/// Owns the event loop driving the packet transport and provides FIFO command
/// submission plus event / ACL data subscriptions.
pub struct Hci {
    cmd_out: MpscSender<(Opcode, Bytes, CmdResultSender)>,
    acl_out: MpscSender<Bytes>,
    ctl_out: MpscSender<EventLoopCommand>,
    capabilities: ControllerCapabilities,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Hci {
    pub async fn new(transport: Transport) -> Result<Self, Error> {
        let (acl_out, acl_in) = unbounded_channel();
        let (cmd_out, cmd_in) = unbounded_channel();
        let (ctl_out, ctl_in) = unbounded_channel();
        let event_loop = spawn(event_loop::event_loop(transport, cmd_in, acl_in, ctl_in));
        let mut hci = Self {
            cmd_out,
            acl_out,
            ctl_out,
            capabilities: Default::default(),
            event_loop: Mutex::new(Some(event_loop)),
        };

        debug!("HCI reset...");
        hci.reset().await?;
        hci.set_event_mask(EventMask::all()).await?;

        let buffer_size = hci.read_buffer_size().await?;
        hci.capabilities.acl_data_packet_length = buffer_size.acl_data_packet_length as usize;
        hci.capabilities.total_num_acl_data_packets = buffer_size.total_num_acl_data_packets;

        // Classic-only controllers reject the LE command set.
        match hci.le_read_buffer_size().await {
            Ok(le_buffer_size) => {
                hci.capabilities.le_data_packet_length = le_buffer_size.le_data_packet_length as usize;
                hci.capabilities.total_num_le_data_packets = le_buffer_size.total_num_le_data_packets as u16;
                hci.capabilities.le_features = hci.le_read_local_supported_features().await?;
                hci.capabilities.le_supported = true;
            }
            Err(Error::Controller(Status::UnknownCommand)) => debug!("Controller has no LE support"),
            Err(err) => return Err(err)
        }
        debug!("Controller capabilities: {:?}", hci.capabilities);

        Ok(hci)
    }

    pub fn capabilities(&self) -> ControllerCapabilities {
        self.capabilities
    }

    pub fn register_event_handler(&self, events: impl Into<BTreeSet<EventCode>>, handler: MpscSender<(EventCode, Bytes)>) -> Result<(), Error> {
        let events = events.into();
        debug_assert!(!events.is_empty());
        debug_assert!(!events.contains(&EventCode::CommandComplete));
        debug_assert!(!events.contains(&EventCode::CommandStatus));
        debug_assert!(!events.contains(&EventCode::LeMeta));
        self.ctl_out
            .send(EventLoopCommand::RegisterHciEventHandler { events, handler })
            .map_err(|_| Error::EventLoopClosed)
    }

    pub fn register_le_event_handler(
        &self, subevents: impl Into<BTreeSet<SubeventCode>>, handler: MpscSender<(SubeventCode, Bytes)>
    ) -> Result<(), Error> {
        let subevents = subevents.into();
        debug_assert!(!subevents.is_empty());
        self.ctl_out
            .send(EventLoopCommand::RegisterLeEventHandler { subevents, handler })
            .map_err(|_| Error::EventLoopClosed)
    }

    pub fn register_data_handler(&self, handler: MpscSender<Bytes>) -> Result<(), Error> {
        self.ctl_out
            .send(EventLoopCommand::RegisterAclDataHandler { handler })
            .map_err(|_| Error::EventLoopClosed)
    }

    /// Returns the sender feeding raw, already fragmented ACL packets into the
    /// controller. The round-robin scheduler owns the only instance.
    pub(crate) fn raw_acl_sender(&self) -> MpscSender<Bytes> {
        self.acl_out.clone()
    }

    pub async fn call<T: Exstruct<LittleEndian>>(&self, cmd: Opcode) -> Result<T, Error> {
        self.call_with_args(cmd, |_| {}).await
    }

    pub async fn call_with_args<T: Exstruct<LittleEndian>>(&self, cmd: Opcode, packer: impl FnOnce(&mut BytesMut)) -> Result<T, Error> {
        let mut buf = BytesMut::with_capacity(255);
        buf.write::<u16, LittleEndian>(cmd.into());
        buf.write::<u8, LittleEndian>(0);
        packer(&mut buf);
        let payload_len = u8::try_from(buf.len() - 3).map_err(|_| Error::PayloadTooLarge)?;
        buf[2] = payload_len;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cmd_out
            .send((cmd, buf.freeze(), tx))
            .map_err(|_| Error::EventLoopClosed)?;
        let mut resp = rx.await.map_err(|_| Error::EventLoopClosed)??;
        let status: Status = resp.read_le()?;
        match status {
            Status::Success => {
                let result: T = resp.read_le()?;
                resp.finish()?;
                Ok(result)
            }
            _ => Err(Error::Controller(status))
        }
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        let handle = self.event_loop.lock().take();
        if let Some(event_loop) = handle {
            self.reset().await?;
            self.ctl_out
                .send(EventLoopCommand::Shutdown)
                .map_err(|_| Error::EventLoopClosed)?;
            event_loop.await.map_err(|_| Error::EventLoopClosed)?;
        } else {
            error!("Another thread already called shutdown");
        }
        Ok(())
    }
}

impl Debug for Hci {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hci")
            .field("acl_mtu", &self.capabilities.acl_data_packet_length)
            .field("acl_credits", &self.capabilities.total_num_acl_data_packets)
            .finish()
    }
}
