use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::{Context, Poll};

use bytes::Bytes;
use instructor::Buffer;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, Receiver as BoundedReceiver, UnboundedReceiver as MpscReceiver, UnboundedSender as MpscSender};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::hci::acl::fragment_pdu;
use crate::hci::consts::EventCode;
use crate::hci::{ControllerCapabilities, Error, Hci};
use crate::log_assert;

/// Which credit pool and MTU a registered link draws from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionType {
    Classic,
    Le,
}

pub(crate) enum SchedulerCommand {
    Register {
        connection_type: ConnectionType,
        handle: u16,
        queue: BoundedReceiver<Bytes>,
    },
    Unregister {
        handle: u16,
    },
}

/// Cloneable endpoint used by the sub-managers to add and remove links.
#[derive(Clone)]
pub(crate) struct SchedulerCtl(MpscSender<SchedulerCommand>);

impl SchedulerCtl {
    pub fn register(&self, connection_type: ConnectionType, handle: u16, queue: BoundedReceiver<Bytes>) {
        let _ = self.0.send(SchedulerCommand::Register { connection_type, handle, queue });
    }

    pub fn unregister(&self, handle: u16) {
        let _ = self.0.send(SchedulerCommand::Unregister { handle });
    }
}

/// Control handle of a running scheduler task.
///
/// The task stops once every [`SchedulerCtl`] clone is gone and the queued
/// work is flushed.
pub(crate) struct SchedulerHandle {
    ctl: SchedulerCtl,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn ctl(&self) -> SchedulerCtl {
        self.ctl.clone()
    }

    pub async fn shutdown(self) {
        let Self { ctl, task } = self;
        drop(ctl);
        let _ = task.await;
    }
}

/// Spawns the scheduler task and subscribes it to credit-return events.
pub(crate) fn spawn_scheduler(hci: &Hci) -> Result<SchedulerHandle, Error> {
    let (ctl_tx, ctl_rx) = unbounded_channel();
    let (completed_tx, completed_rx) = unbounded_channel();
    hci.register_event_handler([EventCode::NumberOfCompletedPackets], completed_tx)?;
    let scheduler = RoundRobinScheduler::new(hci.capabilities(), hci.raw_acl_sender());
    let task = spawn(scheduler.run(ctl_rx, completed_rx));
    Ok(SchedulerHandle { ctl: SchedulerCtl(ctl_tx), task })
}

struct CreditPool {
    total: u16,
    free: u16,
    mtu: usize,
}

impl CreditPool {
    fn release(&mut self, n: u16) {
        self.free = (self.free + n).min(self.total);
    }
}

struct RegisteredLink {
    handle: u16,
    connection_type: ConnectionType,
    queue: BoundedReceiver<Bytes>,
    credits_in_use: u16,
}

struct Fragment {
    handle: u16,
    connection_type: ConnectionType,
    data: Bytes,
}

enum Wake {
    Control(Option<SchedulerCommand>),
    Completed(Option<Bytes>),
    Pdu(usize, Bytes),
}

/// Multiplexes the outbound queues of all registered links onto the shared
/// controller queue, one L2CAP PDU at a time in strict round-robin order.
///
/// The scheduler is the only writer to the outbound ACL channel and never
/// hands the controller more fragments than it has advertised buffers for.
pub(crate) struct RoundRobinScheduler {
    links: Vec<RegisteredLink>,
    fragments: VecDeque<Fragment>,
    cursor: usize,
    classic: CreditPool,
    le: Option<CreditPool>,
    acl_out: MpscSender<Bytes>,
}

impl RoundRobinScheduler {
    pub(crate) fn new(capabilities: ControllerCapabilities, acl_out: MpscSender<Bytes>) -> Self {
        let classic = CreditPool {
            total: capabilities.total_num_acl_data_packets,
            free: capabilities.total_num_acl_data_packets,
            mtu: capabilities.acl_data_packet_length,
        };
        // Older controllers report no dedicated LE buffers and share the
        // classic pool between both transports.
        let le = (capabilities.total_num_le_data_packets > 0).then(|| CreditPool {
            total: capabilities.total_num_le_data_packets,
            free: capabilities.total_num_le_data_packets,
            mtu: capabilities.le_data_packet_length,
        });
        Self {
            links: Vec::new(),
            fragments: VecDeque::new(),
            cursor: 0,
            classic,
            le,
            acl_out,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut ctl: MpscReceiver<SchedulerCommand>,
        mut completed: MpscReceiver<(EventCode, Bytes)>,
    ) {
        loop {
            self.send_fragments();
            let wake = poll_fn(|cx| {
                if let Poll::Ready(cmd) = ctl.poll_recv(cx) {
                    return Poll::Ready(Wake::Control(cmd));
                }
                if let Poll::Ready(event) = completed.poll_recv(cx) {
                    return Poll::Ready(Wake::Completed(event.map(|(_, data)| data)));
                }
                // A partially sent PDU keeps the head of the line until the
                // controller returns enough credits to finish it.
                if self.fragments.is_empty() {
                    if let Poll::Ready((index, pdu)) = self.poll_next_pdu(cx) {
                        return Poll::Ready(Wake::Pdu(index, pdu));
                    }
                }
                Poll::Pending
            })
            .await;
            match wake {
                Wake::Control(Some(SchedulerCommand::Register { connection_type, handle, queue })) => {
                    self.register(connection_type, handle, queue)
                }
                Wake::Control(Some(SchedulerCommand::Unregister { handle })) => self.unregister(handle),
                Wake::Completed(Some(data)) => self
                    .handle_completed_packets(data)
                    .unwrap_or_else(|err| warn!("Malformed NumberOfCompletedPackets event: {:?}", err)),
                Wake::Pdu(index, pdu) => self.queue_pdu(index, pdu),
                Wake::Control(None) | Wake::Completed(None) => break,
            }
        }
        trace!("Round robin scheduler finished");
    }

    fn register(&mut self, connection_type: ConnectionType, handle: u16, queue: BoundedReceiver<Bytes>) {
        log_assert!(self.links.iter().all(|link| link.handle != handle));
        self.links.push(RegisteredLink {
            handle,
            connection_type,
            queue,
            credits_in_use: 0,
        });
    }

    fn unregister(&mut self, handle: u16) {
        let Some(index) = self.links.iter().position(|link| link.handle == handle) else {
            warn!("Unregistering unknown handle 0x{:03X}", handle);
            return;
        };
        let link = self.links.remove(index);
        // The controller flushes data of a dead link without reporting
        // completed packets for it, so its credits return here.
        self.pool_mut(link.connection_type).release(link.credits_in_use);
        self.fragments.retain(|fragment| fragment.handle != handle);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.links.len() {
            self.cursor = 0;
        }
    }

    /// Picks the next link with queued data and available credits, walking
    /// one past the previously served link.
    fn poll_next_pdu(&mut self, cx: &mut Context<'_>) -> Poll<(usize, Bytes)> {
        let classic_free = self.classic.free;
        let le_free = self.le.as_ref().map_or(classic_free, |pool| pool.free);
        let count = self.links.len();
        for i in 0..count {
            let index = (self.cursor + i) % count;
            let link = &mut self.links[index];
            let free = match link.connection_type {
                ConnectionType::Classic => classic_free,
                ConnectionType::Le => le_free,
            };
            if free == 0 {
                continue;
            }
            match link.queue.poll_recv(cx) {
                Poll::Ready(Some(pdu)) => return Poll::Ready((index, pdu)),
                // All client handles are gone; the link stays registered
                // until its disconnection event arrives.
                Poll::Ready(None) => continue,
                Poll::Pending => continue,
            }
        }
        Poll::Pending
    }

    fn queue_pdu(&mut self, index: usize, pdu: Bytes) {
        let link = &self.links[index];
        let handle = link.handle;
        let connection_type = link.connection_type;
        let mtu = self.pool(connection_type).mtu;
        debug_assert!(mtu > 0);
        self.fragments.extend(fragment_pdu(handle, &pdu, mtu).map(|data| Fragment {
            handle,
            connection_type,
            data,
        }));
        self.cursor = (index + 1) % self.links.len();
    }

    fn send_fragments(&mut self) {
        loop {
            let Some(connection_type) = self.fragments.front().map(|fragment| fragment.connection_type) else {
                break;
            };
            if self.pool(connection_type).free == 0 {
                break;
            }
            let fragment = self.fragments.pop_front().unwrap();
            self.pool_mut(fragment.connection_type).free -= 1;
            if let Some(link) = self.links.iter_mut().find(|link| link.handle == fragment.handle) {
                link.credits_in_use += 1;
            }
            if self.acl_out.send(fragment.data).is_err() {
                trace!("ACL queue closed, dropping outbound fragment");
            }
        }
    }

    // ([Vol 4] Part E, Section 7.7.19).
    fn handle_completed_packets(&mut self, mut data: Bytes) -> Result<(), Error> {
        let count = data.read_le::<u8>()? as usize;
        let mut handles = data.split_to(count * 2);
        let mut counts = data.split_to(count * 2);
        data.finish()?;
        for _ in 0..count {
            let handle: u16 = handles.read_le()?;
            let completed: u16 = counts.read_le()?;
            match self.links.iter_mut().find(|link| link.handle == handle) {
                Some(link) => {
                    let returned = completed.min(link.credits_in_use);
                    link.credits_in_use -= returned;
                    let connection_type = link.connection_type;
                    self.pool_mut(connection_type).release(returned);
                }
                // The link may have disconnected right before the event.
                None => trace!("Completed packets for unknown handle 0x{:03X}", handle),
            }
        }
        Ok(())
    }

    fn pool(&self, connection_type: ConnectionType) -> &CreditPool {
        match connection_type {
            ConnectionType::Classic => &self.classic,
            ConnectionType::Le => self.le.as_ref().unwrap_or(&self.classic),
        }
    }

    fn pool_mut(&mut self, connection_type: ConnectionType) -> &mut CreditPool {
        match connection_type {
            ConnectionType::Classic => &mut self.classic,
            ConnectionType::Le => match self.le.as_mut() {
                Some(pool) => pool,
                None => &mut self.classic,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use instructor::BufferMut;
    use tokio::sync::mpsc::{channel, error::TryRecvError, UnboundedReceiver};
    use tokio::task::yield_now;

    use super::*;
    use crate::hci::acl::AclHeader;

    fn capabilities(credits: u16, mtu: usize) -> ControllerCapabilities {
        ControllerCapabilities {
            acl_data_packet_length: mtu,
            total_num_acl_data_packets: credits,
            ..Default::default()
        }
    }

    fn pdu(payload_len: usize) -> Bytes {
        let mut buffer = BytesMut::new();
        buffer.write_le(payload_len as u16);
        buffer.write_le(0x0040u16);
        buffer.put_bytes(0xAB, payload_len);
        buffer.freeze()
    }

    fn completed_packets(entries: &[(u16, u16)]) -> (EventCode, Bytes) {
        let mut buffer = BytesMut::new();
        buffer.write_le(entries.len() as u8);
        for (handle, _) in entries {
            buffer.write_le(*handle);
        }
        for (_, count) in entries {
            buffer.write_le(*count);
        }
        (EventCode::NumberOfCompletedPackets, buffer.freeze())
    }

    fn handle_of(mut fragment: Bytes) -> u16 {
        let header: AclHeader = fragment.read().unwrap();
        header.handle
    }

    async fn recv_handles(rx: &mut UnboundedReceiver<Bytes>, n: usize) -> Vec<u16> {
        let mut handles = Vec::new();
        for _ in 0..n {
            handles.push(handle_of(rx.recv().await.unwrap()));
        }
        handles
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let (acl_tx, mut acl_rx) = unbounded_channel();
        let (ctl_tx, ctl_rx) = unbounded_channel();
        let (completed_tx, completed_rx) = unbounded_channel();
        let task = spawn(RoundRobinScheduler::new(capabilities(4, 1021), acl_tx).run(ctl_rx, completed_rx));

        let (a_tx, a_rx) = channel(10);
        let (b_tx, b_rx) = channel(10);
        for _ in 0..10 {
            a_tx.try_send(pdu(4)).unwrap();
            b_tx.try_send(pdu(4)).unwrap();
        }
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0001, queue: a_rx })
            .unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0002, queue: b_rx })
            .unwrap();

        assert_eq!(recv_handles(&mut acl_rx, 4).await, &[0x0001, 0x0002, 0x0001, 0x0002]);

        // All credits are in use, nothing more may be sent.
        yield_now().await;
        assert_eq!(acl_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        completed_tx.send(completed_packets(&[(0x0001, 1), (0x0002, 1)])).unwrap();
        assert_eq!(recv_handles(&mut acl_rx, 2).await, &[0x0001, 0x0002]);

        drop(ctl_tx);
        drop(completed_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pdu_fragments_are_contiguous() {
        let (acl_tx, mut acl_rx) = unbounded_channel();
        let (ctl_tx, ctl_rx) = unbounded_channel();
        let (completed_tx, completed_rx) = unbounded_channel();
        let task = spawn(RoundRobinScheduler::new(capabilities(8, 10), acl_tx).run(ctl_rx, completed_rx));

        let (a_tx, a_rx) = channel(10);
        let (b_tx, b_rx) = channel(10);
        a_tx.try_send(pdu(26)).unwrap(); // 3 fragments at mtu 10
        b_tx.try_send(pdu(4)).unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0001, queue: a_rx })
            .unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0002, queue: b_rx })
            .unwrap();

        assert_eq!(recv_handles(&mut acl_rx, 4).await, &[0x0001, 0x0001, 0x0001, 0x0002]);

        drop(ctl_tx);
        drop(completed_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn partial_pdu_resumes_after_credit_return() {
        let (acl_tx, mut acl_rx) = unbounded_channel();
        let (ctl_tx, ctl_rx) = unbounded_channel();
        let (completed_tx, completed_rx) = unbounded_channel();
        let task = spawn(RoundRobinScheduler::new(capabilities(2, 10), acl_tx).run(ctl_rx, completed_rx));

        let (a_tx, a_rx) = channel(10);
        let (b_tx, b_rx) = channel(10);
        a_tx.try_send(pdu(26)).unwrap(); // 3 fragments, more than the 2 credits
        b_tx.try_send(pdu(4)).unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0001, queue: a_rx })
            .unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0002, queue: b_rx })
            .unwrap();

        assert_eq!(recv_handles(&mut acl_rx, 2).await, &[0x0001, 0x0001]);
        yield_now().await;
        assert_eq!(acl_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // The last fragment of the PDU goes out before the other link is
        // served.
        completed_tx.send(completed_packets(&[(0x0001, 2)])).unwrap();
        assert_eq!(recv_handles(&mut acl_rx, 2).await, &[0x0001, 0x0002]);

        drop(ctl_tx);
        drop(completed_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unregister_reclaims_credits() {
        let (acl_tx, mut acl_rx) = unbounded_channel();
        let (ctl_tx, ctl_rx) = unbounded_channel();
        let (completed_tx, completed_rx) = unbounded_channel();
        let task = spawn(RoundRobinScheduler::new(capabilities(2, 1021), acl_tx).run(ctl_rx, completed_rx));

        let (a_tx, a_rx) = channel(10);
        a_tx.try_send(pdu(4)).unwrap();
        a_tx.try_send(pdu(4)).unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0001, queue: a_rx })
            .unwrap();
        assert_eq!(recv_handles(&mut acl_rx, 2).await, &[0x0001, 0x0001]);

        // Both credits are held by the dying link.
        ctl_tx.send(SchedulerCommand::Unregister { handle: 0x0001 }).unwrap();

        let (b_tx, b_rx) = channel(10);
        b_tx.try_send(pdu(4)).unwrap();
        ctl_tx
            .send(SchedulerCommand::Register { connection_type: ConnectionType::Classic, handle: 0x0002, queue: b_rx })
            .unwrap();
        assert_eq!(recv_handles(&mut acl_rx, 1).await, &[0x0002]);

        // Late completed-packets events for the dead handle are ignored.
        completed_tx.send(completed_packets(&[(0x0001, 2)])).unwrap();
        yield_now().await;

        drop(ctl_tx);
        drop(completed_tx);
        task.await.unwrap();
    }
}
