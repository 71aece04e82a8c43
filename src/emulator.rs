//! In-process network emulator.
//!
//! Plays the NIC: it produces received packets into pipes, steering them by flow rule or RSS, and
//! serves transmission queues. One thread runs [`NetworkEmulator::run`] (or calls
//! [`NetworkEmulator::poll_once`] directly); everyone else talks to it through the cloneable
//! [`EmulatorHandle`], which is also the [`Backend`] a [`Device`](crate::Device) opens.
//!
//! Wire traffic is exchanged over channels: [`EmulatorHandle::inject`] puts a frame on the wire
//! toward the host, and transmitted frames come out of [`EmulatorHandle::transmitted`].
//!
//! Every pipe written to in a round gets one receive notification on its application's queue,
//! in the order the pipes first received data. A full queue holds the notification back until a
//! later round; the data itself is never held back.

use crate::device::{Backend, PipeKey};
use crate::notification::{RxNotifier, TxQueueConsumer};
use crate::pipe::PipeWriter;
use crate::poll::StopToken;
use crate::steering::{FlowRule, RssHash, RssHasher};
use crate::utils::{get_pkt_len, FlowKey, MAX_PKT_SIZE};
use color_eyre::eyre::{eyre, Result, WrapErr};
use flume::{Receiver, Sender};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Max frames delivered into pipes per round.
pub const RX_BURST: usize = 64;
/// Max requests served per tx queue per round.
pub const TX_BURST: usize = 16;

enum Control {
    Attach { key: PipeKey, writer: PipeWriter },
    Bind { key: PipeKey, rule: FlowRule },
    Detach { key: PipeKey },
    AttachTx { queue: TxQueueConsumer },
    AttachRx { app_id: u16, notifier: RxNotifier },
}

/// Handle to a [`NetworkEmulator`]. Created by [`NetworkEmulator::new`].
#[derive(Clone, Debug)]
pub struct EmulatorHandle {
    control: Sender<Control>,
    incoming: Sender<Vec<u8>>,
    transmitted: Receiver<Vec<u8>>,
}

impl EmulatorHandle {
    fn send_control(&self, msg: Control) -> Result<()> {
        self.control
            .send(msg)
            .map_err(|_| eyre!("channel send to emulator failed"))
    }

    /// Put a frame on the wire toward the host.
    pub fn inject(&self, frame: Vec<u8>) -> Result<()> {
        self.incoming
            .send(frame)
            .map_err(|_| eyre!("emulator is gone"))
    }

    /// Frames transmitted by the host, in transmission order.
    pub fn transmitted(&self) -> Receiver<Vec<u8>> {
        self.transmitted.clone()
    }

    pub fn try_recv_transmitted(&self) -> Option<Vec<u8>> {
        self.transmitted.try_recv().ok()
    }

    pub fn recv_transmitted_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.transmitted
            .recv_timeout(timeout)
            .wrap_err("wait for transmitted frame")
    }
}

impl Backend for EmulatorHandle {
    fn attach(&self, key: PipeKey, writer: PipeWriter) -> Result<()> {
        self.send_control(Control::Attach { key, writer })
    }

    fn bind(&self, key: PipeKey, rule: FlowRule) -> Result<()> {
        self.send_control(Control::Bind { key, rule })
    }

    fn detach(&self, key: PipeKey) -> Result<()> {
        self.send_control(Control::Detach { key })
    }

    fn attach_tx(&self, queue: TxQueueConsumer) -> Result<()> {
        self.send_control(Control::AttachTx { queue })
    }

    fn attach_rx(&self, app_id: u16, notifier: RxNotifier) -> Result<()> {
        self.send_control(Control::AttachRx { app_id, notifier })
    }
}

struct AttachedPipe {
    key: PipeKey,
    writer: PipeWriter,
    rules: Vec<FlowRule>,
    /// Received data its application has not been notified of yet.
    unnotified: bool,
}

/// What one [`NetworkEmulator::poll_once`] round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub control: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub transmitted: usize,
    pub completed: usize,
    /// Receive notifications handed to applications.
    pub notified: usize,
    /// A frame is waiting for space in a full pipe.
    pub backpressured: bool,
}

impl PollSummary {
    pub fn is_idle(&self) -> bool {
        self.control == 0
            && self.delivered == 0
            && self.dropped == 0
            && self.transmitted == 0
            && self.completed == 0
            && self.notified == 0
    }
}

impl std::ops::AddAssign for PollSummary {
    fn add_assign(&mut self, other: Self) {
        self.control += other.control;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.transmitted += other.transmitted;
        self.completed += other.completed;
        self.notified += other.notified;
        self.backpressured = other.backpressured;
    }
}

/// Spin-polling NIC emulation loop.
///
/// Owns the producer end of every pipe and the NIC end of every tx queue. Pipes are kept in
/// attach order, which is the order RSS indexes into.
pub struct NetworkEmulator {
    rss: RssHasher,
    control: Receiver<Control>,
    incoming: Receiver<Vec<u8>>,
    transmitted: Sender<Vec<u8>>,
    pipes: Vec<AttachedPipe>,
    tx_queues: Vec<TxQueueConsumer>,
    rx_notifiers: Vec<(u16, RxNotifier)>,
    /// Pipes owed a notification, oldest first.
    to_notify: VecDeque<PipeKey>,
    backlog: VecDeque<Vec<u8>>,
    totals: PollSummary,
}

impl std::fmt::Debug for NetworkEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEmulator")
            .field("rss", &self.rss.kind())
            .field("pipes", &self.pipes.len())
            .field("tx_queues", &self.tx_queues.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

impl NetworkEmulator {
    pub fn new(rss_hash: RssHash) -> (Self, EmulatorHandle) {
        let (control_s, control_r) = flume::unbounded();
        let (incoming_s, incoming_r) = flume::unbounded();
        let (transmitted_s, transmitted_r) = flume::unbounded();

        (
            Self {
                rss: RssHasher::new(rss_hash),
                control: control_r,
                incoming: incoming_r,
                transmitted: transmitted_s,
                pipes: Vec::new(),
                tx_queues: Vec::new(),
                rx_notifiers: Vec::new(),
                to_notify: VecDeque::new(),
                backlog: VecDeque::new(),
                totals: PollSummary::default(),
            },
            EmulatorHandle {
                control: control_s,
                incoming: incoming_s,
                transmitted: transmitted_r,
            },
        )
    }

    pub fn nb_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Frames received but not yet delivered.
    pub fn backlog(&self) -> usize {
        self.backlog.len() + self.incoming.len()
    }

    /// Everything done since creation.
    pub fn totals(&self) -> PollSummary {
        self.totals
    }

    /// One round of the event loop.
    ///
    /// 1. apply attach/bind/detach requests,
    /// 2. deliver received frames to pipes and notify their applications,
    /// 3. transmit queued requests and complete them.
    pub fn poll_once(&mut self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();

        // 1. control plane first, so a pipe attached before a frame arrived can receive it.
        while let Ok(msg) = self.control.try_recv() {
            summary.control += 1;
            self.apply(msg);
        }

        // 2. receive.
        self.backlog.extend(self.incoming.try_iter());
        while summary.delivered + summary.dropped < RX_BURST {
            let frame = match self.backlog.pop_front() {
                Some(f) => f,
                None => break,
            };

            match self.deliver(&frame)? {
                Delivery::Delivered => summary.delivered += 1,
                Delivery::Dropped => summary.dropped += 1,
                Delivery::Full => {
                    // keep arrival order: nothing behind it goes first.
                    self.backlog.push_front(frame);
                    summary.backpressured = true;
                    break;
                }
            }
        }

        if summary.delivered > 0 {
            trace!(delivered = summary.delivered, "Delivered frames");
        }
        summary.notified = self.notify_rx();

        // 3. transmit.
        let transmitted = &self.transmitted;
        self.tx_queues.retain(|queue| {
            for _ in 0..TX_BURST {
                let req = match queue.next_request() {
                    Ok(Some(req)) => req,
                    Ok(None) => return true,
                    Err(_) => {
                        debug!("tx queue closed");
                        return false;
                    }
                };

                let mut frames = Vec::new();
                if let Err(err) = req.payload.for_each_packet(|pkt| frames.push(pkt.to_vec())) {
                    warn!(?err, seq = req.token.seq(), "malformed tx request");
                }
                summary.transmitted += frames.len();
                for frame in frames {
                    // nobody listening is the same as a wire nobody listens on.
                    let _ = transmitted.send(frame);
                }

                queue.complete(req.token);
                summary.completed += 1;
            }
            true
        });

        self.totals += summary;
        Ok(summary)
    }

    /// Poll until a round does nothing.
    pub fn poll_until_idle(&mut self) -> Result<PollSummary> {
        let mut total = PollSummary::default();
        loop {
            let summary = self.poll_once()?;
            if summary.is_idle() {
                total.backpressured = summary.backpressured;
                return Ok(total);
            }
            total += summary;
        }
    }

    /// Event loop. Returns once `stop` fires.
    pub fn run(&mut self, stop: &StopToken) -> Result<()> {
        debug!("emulator running");
        while !stop.is_stopped() {
            if self.poll_once()?.is_idle() {
                std::hint::spin_loop();
            }
        }

        debug!(totals = ?self.totals, "emulator stopped");
        Ok(())
    }

    fn apply(&mut self, msg: Control) {
        match msg {
            Control::Attach { key, writer } => {
                if let Some(old) = self.pipes.iter().position(|p| p.key == key) {
                    warn!(pipe = %key, "pipe attached twice, replacing");
                    self.pipes.remove(old);
                }
                debug!(pipe = %key, "attached pipe");
                self.pipes.push(AttachedPipe {
                    key,
                    writer,
                    rules: Vec::new(),
                    unnotified: false,
                });
            }
            Control::Bind { key, rule } => match self.pipes.iter_mut().find(|p| p.key == key) {
                Some(pipe) => {
                    debug!(pipe = %key, ?rule, "installed rule");
                    pipe.rules.push(rule);
                }
                None => warn!(pipe = %key, ?rule, "rule for unknown pipe"),
            },
            Control::Detach { key } => {
                let before = self.pipes.len();
                self.pipes.retain(|p| p.key != key);
                if self.pipes.len() == before {
                    warn!(pipe = %key, "detach of unknown pipe");
                } else {
                    debug!(pipe = %key, "detached pipe");
                }
            }
            Control::AttachTx { queue } => {
                debug!("attached tx queue");
                self.tx_queues.push(queue);
            }
            Control::AttachRx { app_id, notifier } => {
                if let Some(old) = self.rx_notifiers.iter().position(|(a, _)| *a == app_id) {
                    warn!(app_id, "rx notifications attached twice, replacing");
                    self.rx_notifiers.remove(old);
                }
                debug!(app_id, "attached rx notifications");
                self.rx_notifiers.push((app_id, notifier));
            }
        }
    }

    /// Hand out owed receive notifications until an application's queue is full.
    fn notify_rx(&mut self) -> usize {
        let mut notified = 0;
        while let Some(&key) = self.to_notify.front() {
            let pipe = match self.pipes.iter_mut().find(|p| p.key == key) {
                Some(p) => p,
                None => {
                    // detached since
                    self.to_notify.pop_front();
                    continue;
                }
            };
            let notifier = match self.rx_notifiers.iter().position(|(a, _)| *a == key.app_id) {
                Some(i) => i,
                None => {
                    pipe.unnotified = false;
                    self.to_notify.pop_front();
                    continue;
                }
            };

            let sent = self.rx_notifiers[notifier].1.notify(key.pipe, pipe.writer.tail());
            match sent {
                Ok(true) => notified += 1,
                Ok(false) => {
                    trace!(pipe = %key, "rx notification queue full");
                    break;
                }
                Err(_) => {
                    debug!(app_id = key.app_id, "rx notifications closed");
                    self.rx_notifiers.remove(notifier);
                }
            }
            pipe.unnotified = false;
            self.to_notify.pop_front();
        }

        notified
    }

    /// The pipe a frame goes to: the first rule match, otherwise RSS over all pipes.
    fn steer(&self, frame: &[u8]) -> Option<usize> {
        if let Some(key) = FlowKey::parse(frame) {
            let matched = self
                .pipes
                .iter()
                .position(|p| p.rules.iter().any(|r| r.matches(&key)));
            if matched.is_some() {
                return matched;
            }
        }

        self.rss.select(frame, self.pipes.len())
    }

    fn deliver(&mut self, frame: &[u8]) -> Result<Delivery> {
        match get_pkt_len(frame) {
            Some(len) if len <= frame.len() && len <= MAX_PKT_SIZE => {}
            pkt_len => {
                warn!(?pkt_len, frame_len = frame.len(), "Dropping malformed frame");
                return Ok(Delivery::Dropped);
            }
        }

        let idx = match self.steer(frame) {
            Some(i) => i,
            None => {
                trace!("no pipes, dropping frame");
                return Ok(Delivery::Dropped);
            }
        };

        let pipe = &mut self.pipes[idx];
        if pipe
            .writer
            .try_push(frame)
            .wrap_err_with(|| eyre!("deliver to {}", pipe.key))?
        {
            if !pipe.unnotified {
                pipe.unnotified = true;
                self.to_notify.push_back(pipe.key);
            }
            Ok(Delivery::Delivered)
        } else {
            trace!(pipe = %pipe.key, "pipe full");
            Ok(Delivery::Full)
        }
    }
}

enum Delivery {
    Delivered,
    Dropped,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{rx_notifications, RxNotification};
    use crate::pipe::{self, PipeConfig};
    use crate::registry::PipeRegistry;
    use crate::utils::{build_udp_packet, AddressInfo, HeaderInfo};
    use std::net::Ipv4Addr;

    fn frame(src_port: u16, dst_port: u16, len: usize) -> Vec<u8> {
        let header = HeaderInfo {
            src_info: AddressInfo {
                udp_port: src_port,
                ipv4_addr: Ipv4Addr::new(10, 0, 0, 1),
                ..Default::default()
            },
            dst_info: AddressInfo {
                udp_port: dst_port,
                ipv4_addr: Ipv4Addr::new(10, 0, 0, 2),
                ..Default::default()
            },
        };
        build_udp_packet(&header, &vec![7u8; len], 0).unwrap()
    }

    fn attach(
        handle: &EmulatorHandle,
        reg: &mut PipeRegistry<()>,
        capacity: usize,
    ) -> (PipeKey, pipe::RxPipe) {
        let id = reg.insert(());
        let key = PipeKey { app_id: 0, pipe: id };
        let config = PipeConfig {
            capacity,
            ..Default::default()
        };
        let (rx, writer) = pipe::pipe(id, &config).unwrap();
        handle.attach(key, writer).unwrap();
        (key, rx)
    }

    #[test]
    fn drops_without_pipes() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        handle.inject(frame(1, 2, 10)).unwrap();
        let s = emu.poll_once().unwrap();
        assert_eq!(s.dropped, 1);
        assert_eq!(emu.backlog(), 0);
    }

    #[test]
    fn drops_malformed_frames() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (_key, mut rx) = attach(&handle, &mut reg, 4096);

        handle.inject(vec![0u8; 10]).unwrap();
        let mut truncated = frame(1, 2, 100);
        truncated.truncate(80);
        handle.inject(truncated).unwrap();

        let s = emu.poll_once().unwrap();
        assert_eq!((s.delivered, s.dropped), (0, 2));
        assert!(rx.peek_batch().unwrap().is_empty());
    }

    #[test]
    fn rules_take_precedence_over_rss() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::Sum);
        let mut reg = PipeRegistry::new();
        let (_a, mut rx_a) = attach(&handle, &mut reg, 4096);
        let (b, mut rx_b) = attach(&handle, &mut reg, 4096);
        handle
            .bind(b, FlowRule::udp(9000, Ipv4Addr::UNSPECIFIED))
            .unwrap();

        for src in 0..8 {
            handle.inject(frame(src, 9000, 10)).unwrap();
        }
        emu.poll_until_idle().unwrap();

        assert!(rx_a.peek_batch().unwrap().is_empty());
        assert_eq!(rx_b.peek_batch().unwrap().nb_pkts(), 8);
    }

    #[test]
    fn full_pipe_keeps_frames_queued() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (_key, mut rx) = attach(&handle, &mut reg, 4096);

        // 1024 bytes aligned; three fit
        for i in 0..5 {
            handle.inject(frame(i, 80, 1000 - 42)).unwrap();
        }
        let s = emu.poll_once().unwrap();
        assert_eq!(s.delivered, 3);
        assert!(s.backpressured);
        assert_eq!(emu.backlog(), 2);

        rx.confirm_all().unwrap();
        let s = emu.poll_once().unwrap();
        assert_eq!(s.delivered, 2);
        assert!(!s.backpressured);

        let mut ports = vec![];
        loop {
            let batch = rx.consume_batch().unwrap();
            if batch.is_empty() {
                break;
            }
            ports.extend(batch.iter().map(|p| FlowKey::parse(p).unwrap().src_port));
        }
        assert_eq!(ports, vec![3, 4]);
    }

    #[test]
    fn detached_pipe_gets_nothing() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (a, _rx_a) = attach(&handle, &mut reg, 4096);
        let (_b, mut rx_b) = attach(&handle, &mut reg, 4096);
        handle.detach(a).unwrap();
        emu.poll_once().unwrap();
        assert_eq!(emu.nb_pipes(), 1);

        for src in 0..16 {
            handle.inject(frame(src, 80, 10)).unwrap();
        }
        emu.poll_until_idle().unwrap();
        assert_eq!(rx_b.peek_batch().unwrap().nb_pkts(), 16);
    }

    #[test]
    fn rx_burst_bounds_a_round() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (_key, _rx) = attach(&handle, &mut reg, 1 << 16);
        for src in 0..(RX_BURST as u16 + 10) {
            handle.inject(frame(src, 80, 1)).unwrap();
        }
        assert_eq!(emu.poll_once().unwrap().delivered, RX_BURST);
        assert_eq!(emu.poll_once().unwrap().delivered, 10);
    }

    #[test]
    fn notifications_wait_for_room() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (a, _rx_a) = attach(&handle, &mut reg, 4096);
        let (b, _rx_b) = attach(&handle, &mut reg, 4096);
        handle
            .bind(a, FlowRule::udp(1000, Ipv4Addr::UNSPECIFIED))
            .unwrap();
        handle
            .bind(b, FlowRule::udp(2000, Ipv4Addr::UNSPECIFIED))
            .unwrap();
        let (notifier, events) = rx_notifications(1).unwrap();
        handle.attach_rx(0, notifier).unwrap();

        handle.inject(frame(1, 2000, 10)).unwrap();
        handle.inject(frame(1, 1000, 10)).unwrap();
        handle.inject(frame(2, 2000, 10)).unwrap();
        let s = emu.poll_once().unwrap();
        assert_eq!((s.delivered, s.notified), (3, 1));
        // one notification per pipe, carrying the tail after the whole round
        assert_eq!(
            events.next_notification(),
            Some(RxNotification {
                pipe: b.pipe,
                tail: 128
            })
        );

        let s = emu.poll_once().unwrap();
        assert_eq!((s.delivered, s.notified), (0, 1));
        assert_eq!(
            events.next_notification(),
            Some(RxNotification {
                pipe: a.pipe,
                tail: 64
            })
        );
        assert!(emu.poll_once().unwrap().is_idle());
    }

    #[test]
    fn closed_notification_queue_is_dropped() {
        let (mut emu, handle) = NetworkEmulator::new(RssHash::AHash);
        let mut reg = PipeRegistry::new();
        let (_key, mut rx) = attach(&handle, &mut reg, 4096);
        let (notifier, events) = rx_notifications(4).unwrap();
        handle.attach_rx(0, notifier).unwrap();
        drop(events);

        handle.inject(frame(1, 80, 10)).unwrap();
        let s = emu.poll_once().unwrap();
        assert_eq!((s.delivered, s.notified), (1, 0));
        assert_eq!(rx.peek_batch().unwrap().nb_pkts(), 1);
    }
}
