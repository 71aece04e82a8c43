//! Notification/completion channel.
//!
//! Transmissions are requested by pushing descriptors onto a bounded queue that the NIC drains in
//! order. The NIC reports progress by bumping a single completion counter, so software learns how
//! many requests finished without a round trip per packet. Since completions are in order, the
//! n-th completion always belongs to the n-th submission.
//!
//! The receive direction has its own, much simpler queue: after writing into a pipe the NIC
//! pushes an [`RxNotification`] carrying the pipe and its new tail, so an application with many
//! pipes can go straight to the ones that have data instead of polling each of them.

use crate::pipe::PipeRegion;
use crate::registry::PipeId;
use crate::utils::{flit_align, get_pkt_len};
use color_eyre::eyre::{bail, ensure, eyre, Result};
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Number of processed packets between head pointer updates.
pub const HEAD_UPDATE_PERIOD: u32 = 64;
/// Default bound on submitted-but-not-drained transmission requests.
pub const MAX_PENDING_TX_REQUESTS: u32 = 16383;
/// Default bound on queued receive notifications.
pub const MAX_PENDING_RX_NOTIFICATIONS: usize = 16383;

/// Sequence number of a transmission request on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxToken(u64);

impl TxToken {
    pub fn seq(&self) -> u64 {
        self.0
    }
}

/// Outcome of [`NotificationChannel::submit`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted(TxToken),
    /// Too many un-drained requests. Drain completions and retry.
    Backpressure,
    /// Nothing to send, so no request was queued.
    Empty,
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Submission::Accepted(_))
    }
}

/// Bytes handed to the NIC for transmission.
///
/// Ownership moves into the request, so the bytes stay alive and untouched until the request
/// completes, even if the submitter goes away.
#[derive(Debug)]
pub enum TxPayload {
    /// One or more flit-aligned packets in an owned buffer.
    Owned(Vec<u8>),
    /// A confirmed region of a pipe's buffer, sent in place.
    Pipe(PipeRegion),
}

impl TxPayload {
    pub fn len(&self) -> usize {
        match self {
            TxPayload::Owned(buf) => buf.len(),
            TxPayload::Pipe(region) => region.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` with every packet in the payload.
    ///
    /// Packets are laid out back to back, each padded to a whole number of flits.
    pub fn for_each_packet(&self, mut f: impl FnMut(&[u8])) -> Result<usize> {
        match self {
            TxPayload::Owned(buf) => {
                let mut off = 0;
                let mut nb_pkts = 0;
                while off < buf.len() {
                    let pkt_len = get_pkt_len(&buf[off..])
                        .ok_or_else(|| eyre!("no packet header at offset {} of tx payload", off))?;
                    ensure!(
                        off + pkt_len <= buf.len(),
                        "packet at offset {} claims {} bytes, tx payload has {}",
                        off,
                        pkt_len,
                        buf.len()
                    );
                    f(&buf[off..off + pkt_len]);
                    off += flit_align(pkt_len);
                    nb_pkts += 1;
                }
                Ok(nb_pkts)
            }
            TxPayload::Pipe(region) => region.for_each_packet(f),
        }
    }
}

/// A request as seen by the NIC.
#[derive(Debug)]
pub struct TxRequest {
    pub token: TxToken,
    pub payload: TxPayload,
}

/// Application half of a notification channel.
pub struct NotificationChannel {
    requests: Sender<TxRequest>,
    completed: Arc<AtomicU64>,
    max_pending: u32,
    next_seq: u64,
    /// Completions observed by the last `update_tx_head`.
    seen_completed: u64,
    /// Completions observed but not yet handed out by `drain_completions`.
    unreported: u32,
    /// Submitted and not yet drained.
    outstanding: u32,
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("outstanding", &self.outstanding)
            .field("unreported", &self.unreported)
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

/// NIC half of a notification channel.
pub struct TxQueueConsumer {
    requests: Receiver<TxRequest>,
    completed: Arc<AtomicU64>,
}

impl std::fmt::Debug for TxQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueueConsumer")
            .field("queued", &self.requests.len())
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl NotificationChannel {
    pub fn new(max_pending: u32) -> Result<(Self, TxQueueConsumer)> {
        ensure!(max_pending > 0, "max pending tx requests must be positive");
        let (requests_s, requests_r) = flume::bounded(max_pending as usize);
        let completed = Arc::new(AtomicU64::new(0));
        Ok((
            Self {
                requests: requests_s,
                completed: Arc::clone(&completed),
                max_pending,
                next_seq: 0,
                seen_completed: 0,
                unreported: 0,
                outstanding: 0,
            },
            TxQueueConsumer {
                requests: requests_r,
                completed,
            },
        ))
    }

    /// Enqueue a transmission request.
    ///
    /// Returns as soon as the request is queued; the payload is not necessarily on the wire yet.
    /// Fails only if the NIC side is gone.
    pub fn submit(&mut self, payload: TxPayload) -> Result<Submission> {
        if self.outstanding >= self.max_pending {
            trace!(outstanding = self.outstanding, "tx backpressure");
            return Ok(Submission::Backpressure);
        }

        let token = TxToken(self.next_seq);
        match self.requests.try_send(TxRequest { token, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Ok(Submission::Backpressure),
            Err(TrySendError::Disconnected(_)) => bail!("tx queue disconnected"),
        }

        self.next_seq += 1;
        self.outstanding += 1;
        Ok(Submission::Accepted(token))
    }

    /// Pull the NIC's completion counter.
    ///
    /// Newly observed completions are held until the next `drain_completions`; the backpressure
    /// bound only moves when completions are drained.
    pub fn update_tx_head(&mut self) {
        let completed = self.completed.load(Ordering::Acquire);
        let new = completed - self.seen_completed;
        if new > 0 {
            self.seen_completed = completed;
            self.unreported += new as u32;
        }
    }

    /// Number of requests completed since the previous call, in submission order.
    pub fn drain_completions(&mut self) -> u32 {
        self.update_tx_head();
        let n = self.unreported;
        self.unreported = 0;
        self.outstanding -= n;
        n
    }

    /// Submitted and not yet drained.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn max_pending(&self) -> u32 {
        self.max_pending
    }
}

impl TxQueueConsumer {
    /// Next queued request, if any. `Err` once the application half is dropped and the queue is
    /// empty.
    pub fn next_request(&self) -> Result<Option<TxRequest>> {
        match self.requests.try_recv() {
            Ok(req) => Ok(Some(req)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => bail!("notification channel closed"),
        }
    }

    /// Report one more request as completed. Must be called in request order.
    pub fn complete(&self, token: TxToken) {
        let prev = self.completed.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev, token.seq(), "completions out of order");
        trace!(seq = token.seq(), "tx completed");
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_disconnected() && self.requests.is_empty()
    }
}

/// A pipe's tail moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxNotification {
    pub pipe: PipeId,
    /// Producer tail right after the write that caused the notification.
    pub tail: u32,
}

/// Create a receive notification queue holding at most `bound` notifications.
pub fn rx_notifications(bound: usize) -> Result<(RxNotifier, RxNotifications)> {
    ensure!(bound > 0, "rx notification queue bound must be positive");
    let (events_s, events_r) = flume::bounded(bound);
    Ok((
        RxNotifier { events: events_s },
        RxNotifications { events: events_r },
    ))
}

/// NIC half of a receive notification queue.
#[derive(Debug)]
pub struct RxNotifier {
    events: Sender<RxNotification>,
}

impl RxNotifier {
    /// Queue a notification. `Ok(false)` if the queue is full; `Err` once the application half
    /// is gone.
    pub fn notify(&self, pipe: PipeId, tail: u32) -> Result<bool> {
        match self.events.try_send(RxNotification { pipe, tail }) {
            Ok(()) => {
                trace!(%pipe, tail, "rx notification");
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => bail!("rx notification queue closed"),
        }
    }
}

/// Application half of a receive notification queue.
#[derive(Debug)]
pub struct RxNotifications {
    events: Receiver<RxNotification>,
}

impl RxNotifications {
    /// Oldest queued notification, if any.
    pub fn next_notification(&self) -> Option<RxNotification> {
        self.events.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Lazy head pointer publication.
///
/// Publishing the head is the only way the producer learns about freed space, and doing it per
/// packet costs a shared cache line write each time. The head is published once every `period`
/// processed packets, or right away when the consumer has caught up with the producer: an idle
/// application would otherwise sit on freed space the producer needs.
#[derive(Debug, Clone)]
pub struct HeadSync {
    period: u32,
    pending_pkts: u32,
}

impl HeadSync {
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            pending_pkts: 0,
        }
    }

    /// Account for `nb_pkts` freed packets. Returns whether the head should be published now.
    pub fn update_local_head(&mut self, nb_pkts: u32, caught_up: bool) -> bool {
        self.pending_pkts += nb_pkts;
        if caught_up || self.pending_pkts >= self.period {
            debug!(pending_pkts = self.pending_pkts, caught_up, "publishing head");
            self.pending_pkts = 0;
            true
        } else {
            false
        }
    }

    /// Forget pending packets after an explicit publication.
    pub fn reset(&mut self) {
        self.pending_pkts = 0;
    }
}

impl Default for HeadSync {
    fn default() -> Self {
        Self::new(HEAD_UPDATE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{build_udp_packet, HeaderInfo};

    fn pkt(len: usize) -> Vec<u8> {
        build_udp_packet(&HeaderInfo::default(), &vec![0xab; len], 0).unwrap()
    }

    #[test]
    fn backpressure_after_max_pending() {
        let (mut ch, _nic) = NotificationChannel::new(4).unwrap();
        for i in 0..4 {
            match ch.submit(TxPayload::Owned(pkt(10))).unwrap() {
                Submission::Accepted(t) => assert_eq!(t.seq(), i),
                Submission::Backpressure => panic!("early backpressure"),
                Submission::Empty => panic!("unexpected empty submission"),
            }
        }
        assert_eq!(
            ch.submit(TxPayload::Owned(pkt(10))).unwrap(),
            Submission::Backpressure
        );
    }

    #[test]
    fn default_bound() {
        let (mut ch, _nic) = NotificationChannel::new(MAX_PENDING_TX_REQUESTS).unwrap();
        for _ in 0..MAX_PENDING_TX_REQUESTS {
            assert!(ch.submit(TxPayload::Owned(vec![])).unwrap().is_accepted());
        }
        assert_eq!(
            ch.submit(TxPayload::Owned(vec![])).unwrap(),
            Submission::Backpressure
        );
        assert_eq!(ch.drain_completions(), 0);
    }

    #[test]
    fn completions_are_not_drained_by_update() {
        let (mut ch, nic) = NotificationChannel::new(2).unwrap();
        assert!(ch.submit(TxPayload::Owned(pkt(10))).unwrap().is_accepted());
        assert!(ch.submit(TxPayload::Owned(pkt(10))).unwrap().is_accepted());

        let req = nic.next_request().unwrap().unwrap();
        nic.complete(req.token);
        ch.update_tx_head();
        // still two un-drained requests
        assert_eq!(
            ch.submit(TxPayload::Owned(pkt(10))).unwrap(),
            Submission::Backpressure
        );

        assert_eq!(ch.drain_completions(), 1);
        assert_eq!(ch.drain_completions(), 0);
        assert!(ch.submit(TxPayload::Owned(pkt(10))).unwrap().is_accepted());
    }

    #[test]
    fn requests_arrive_in_submission_order() {
        let (mut ch, nic) = NotificationChannel::new(8).unwrap();
        for _ in 0..3 {
            assert!(ch.submit(TxPayload::Owned(pkt(10))).unwrap().is_accepted());
        }

        // completing the first only never reports the third
        let first = nic.next_request().unwrap().unwrap();
        assert_eq!(first.token.seq(), 0);
        nic.complete(first.token);
        assert_eq!(ch.drain_completions(), 1);
        assert_eq!(ch.outstanding(), 2);

        let second = nic.next_request().unwrap().unwrap();
        let third = nic.next_request().unwrap().unwrap();
        assert_eq!((second.token.seq(), third.token.seq()), (1, 2));
        nic.complete(second.token);
        nic.complete(third.token);
        assert_eq!(ch.drain_completions(), 2);
        assert!(nic.next_request().unwrap().is_none());
    }

    #[test]
    fn closed_channel() {
        let (ch, nic) = NotificationChannel::new(1).unwrap();
        drop(ch);
        assert!(nic.is_closed());
        assert!(nic.next_request().is_err());

        let (mut ch, nic) = NotificationChannel::new(1).unwrap();
        drop(nic);
        assert!(ch.submit(TxPayload::Owned(pkt(1))).is_err());
    }

    #[test]
    fn owned_payload_walks_flit_aligned_packets() {
        let mut buf = pkt(50); // 92 bytes
        buf.resize(128, 0);
        buf.extend_from_slice(&pkt(10)); // 52 bytes
        let mut lens = vec![];
        let n = TxPayload::Owned(buf)
            .for_each_packet(|p| lens.push(p.len()))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(lens, vec![92, 52]);
    }

    #[test]
    fn rx_notifications_are_fifo_and_bounded() {
        let mut reg = crate::registry::PipeRegistry::new();
        let (a, b) = (reg.insert(()), reg.insert(()));
        let (nic, app) = rx_notifications(2).unwrap();
        assert!(nic.notify(a, 64).unwrap());
        assert!(nic.notify(b, 128).unwrap());
        assert!(!nic.notify(a, 192).unwrap());
        assert_eq!(app.len(), 2);

        assert_eq!(app.next_notification(), Some(RxNotification { pipe: a, tail: 64 }));
        assert_eq!(app.next_notification(), Some(RxNotification { pipe: b, tail: 128 }));
        assert_eq!(app.next_notification(), None);

        drop(app);
        assert!(nic.notify(a, 256).is_err());
        assert!(rx_notifications(0).is_err());
    }

    #[test]
    fn head_sync_period() {
        let mut sync = HeadSync::new(4);
        assert!(!sync.update_local_head(1, false));
        assert!(!sync.update_local_head(2, false));
        assert!(sync.update_local_head(1, false));
        assert!(!sync.update_local_head(1, false));
        assert!(sync.update_local_head(0, true));
    }
}
