use std::collections::{BTreeMap, BTreeSet};
use std::future::pending;
use std::mem::size_of;

use bytes::{BufMut, Bytes, BytesMut};
use instructor::utils::Length;
use instructor::{Buffer, Exstruct};
use tokio::sync::mpsc::{UnboundedReceiver as MpscReceiver, UnboundedSender as MpscSender};
use tokio::sync::oneshot::Sender as OneshotSender;
use tracing::{debug, error, trace, warn};

use crate::hci::btsnoop::{LogWriter, PacketType};
use crate::hci::consts::{EventCode, Status, SubeventCode};
use crate::hci::transport::{HciPacket, Transport};
use crate::hci::{Error, Opcode};
use crate::utils::DispatchExt;

pub type CmdResultSender = OneshotSender<Result<Bytes, Error>>;

pub enum EventLoopCommand {
    Shutdown,
    RegisterHciEventHandler {
        events: BTreeSet<EventCode>,
        handler: MpscSender<(EventCode, Bytes)>,
    },
    RegisterLeEventHandler {
        subevents: BTreeSet<SubeventCode>,
        handler: MpscSender<(SubeventCode, Bytes)>,
    },
    RegisterAclDataHandler {
        handler: MpscSender<Bytes>,
    },
}

pub async fn event_loop(
    mut transport: Transport,
    mut cmd_receiver: MpscReceiver<(Opcode, Bytes, CmdResultSender)>,
    mut acl_receiver: MpscReceiver<Bytes>,
    mut ctl_receiver: MpscReceiver<EventLoopCommand>,
) {
    let mut state = State::default();
    let log = LogWriter::new();

    loop {
        tokio::select! {
            packet = transport.receiver.recv() => {
                let Some(packet) = packet else { break; };
                match packet {
                    HciPacket::Event(data) => {
                        log.write(PacketType::Event, data.clone());
                        match state.process_hci_event(data) {
                            Ok(_) => (),
                            Err(err) => error!("Error processing HCI event: {:?}", err),
                        }
                    }
                    HciPacket::Acl(data) => {
                        log.write(PacketType::AclRx, data.clone());
                        state.process_acl_data(data);
                    }
                    HciPacket::Command(_) => warn!("Received an HCI command from the controller"),
                }
            },
            data = acl_receiver.recv() => {
                if let Some(data) = data {
                    log.write(PacketType::AclTx, data.clone());
                    if transport.sender.send(HciPacket::Acl(data)).is_err() {
                        break;
                    }
                } else {
                    break;
                }
            },
            cmd = cmd_receiver.recv(), if state.outstanding_command.is_none() => {
                if let Some((opcode, req, tx)) = cmd {
                    log.write(PacketType::Command, req.clone());
                    match transport.sender.send(HciPacket::Command(req)) {
                        Ok(_) => state.outstanding_command = Some((opcode, tx)),
                        Err(_) => {
                            let _ = tx.send(Err(Error::EventLoopClosed));
                        }
                    }
                } else {
                    break;
                }
            },
            _ = state.outstanding_command_dropped() => {
                state.outstanding_command = None;
            },
            cmd = ctl_receiver.recv() => {
                match cmd {
                    Some(EventLoopCommand::RegisterHciEventHandler { events, handler }) => {
                        for event in events {
                            state.hci_event_handlers.entry(event).or_default().push(handler.clone());
                        }
                    }
                    Some(EventLoopCommand::RegisterLeEventHandler { subevents, handler }) => {
                        for subevent in subevents {
                            state.le_event_handlers.entry(subevent).or_default().push(handler.clone());
                        }
                    }
                    Some(EventLoopCommand::RegisterAclDataHandler { handler }) => {
                        state.acl_data_handlers.push(handler);
                    }
                    Some(EventLoopCommand::Shutdown) | None => {
                        break;
                    }
                }
            }
        }
    }

    debug!("Event loop closed");
}

#[derive(Default)]
struct State {
    outstanding_command: Option<(Opcode, CmdResultSender)>,
    hci_event_handlers: BTreeMap<EventCode, Vec<MpscSender<(EventCode, Bytes)>>>,
    le_event_handlers: BTreeMap<SubeventCode, Vec<MpscSender<(SubeventCode, Bytes)>>>,
    acl_data_handlers: Vec<MpscSender<Bytes>>,
}

impl State {

    async fn outstanding_command_dropped(&mut self) {
        match self.outstanding_command.as_mut() {
            None => pending().await,
            Some((_, tx)) => tx.closed().await
        }
    }

    fn process_hci_event(&mut self, mut data: Bytes) -> Result<bool, Error> {
        let header: EventHeader = data.read_le()?;
        match header.code {
            EventCode::CommandComplete | EventCode::CommandStatus => {
                // ([Vol 4] Part E, Section 7.7.14).
                // ([Vol 4] Part E, Section 7.7.15).
                if let EventCode::CommandStatus = header.code {
                    let mut tmp = BytesMut::with_capacity(data.len());
                    tmp.put(data);
                    tmp.rotate_left(size_of::<Status>());
                    data = tmp.freeze();
                }
                let _cmd_quota: u8 = data.read_le()?;
                let opcode: Opcode = data.read_le()?;
                match self.outstanding_command.take() {
                    Some((op, tx)) if op == opcode => {
                        tx.send(Ok(data))
                            .unwrap_or_else(|_| debug!("CommandComplete receiver dropped"))
                    },
                    Some((op, tx)) => {
                        self.outstanding_command = Some((op, tx));
                        return Err(Error::UnexpectedCommandResponse(opcode));
                    },
                    None => return Err(Error::UnexpectedCommandResponse(opcode))
                }
                Ok(true)
            },
            EventCode::LeMeta => {
                // ([Vol 4] Part E, Section 7.7.65).
                let subevent: SubeventCode = data.read_le()?;
                let handled = self.le_event_handlers
                    .get_mut(&subevent)
                    .map_or(false, |handlers| handlers.dispatch((subevent, data)));
                if !handled {
                    trace!("Unhandled LE meta event: {:?}", subevent);
                }
                Ok(handled)
            },
            _ => {
                let code = header.code;
                let handled = self.hci_event_handlers
                    .get_mut(&code)
                    .map_or(false, |handlers| handlers.dispatch((code, data)));
                if !handled {
                    warn!("Unhandled HCI event: {:?}", code);
                }
                Ok(handled)
            },
        }
    }

    fn process_acl_data(&mut self, data: Bytes) {
        if !self.acl_data_handlers.dispatch(data) {
            trace!("No registered ACL data handler");
        }
    }

}

/// HCI event packet ([Vol 4] Part E, Section 5.4.4).
#[derive(Debug, Clone, Exstruct)]
pub struct EventHeader {
    pub code: EventCode,
    pub length: Length<u8, 0>
}
