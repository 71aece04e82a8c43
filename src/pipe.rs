//! Enso pipes: packet ring buffers shared with the NIC.
//!
//! The NIC (producer) appends flit-aligned packets at `tail`; the application (consumer) reads
//! whole packets starting at its read position and gives space back by moving `head`. Both
//! indices live in the buffer as atomics, and no lock is ever taken: the producer only writes
//! bytes in `[tail, head)` and the consumer only touches bytes in `[head, tail)`.
//!
//! A packet that would straddle the physical end of the buffer is written contiguously into an
//! overflow area past the end, and the matching space at the start of the buffer is accounted as
//! used. Every packet can therefore be handed out as a single slice.

use crate::device::Binding;
use crate::notification::{HeadSync, NotificationChannel, Submission, TxPayload};
use crate::registry::PipeId;
use crate::steering::FlowRule;
use crate::utils::{flit_align, get_pkt_len, FLIT_SIZE, MAX_PKT_SIZE};
use color_eyre::eyre::{ensure, eyre, Result};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Flit([u8; FLIT_SIZE]);

static_assert!(std::mem::size_of::<Flit>() == FLIT_SIZE);
static_assert!(FLIT_SIZE.is_power_of_two());
static_assert!(MAX_PKT_SIZE % FLIT_SIZE == 0);

/// Broken producer/consumer contract. Always fatal for the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Confirmed or sent an amount that is not a whole number of flits.
    Unaligned { pipe: PipeId, len: usize },
    /// Confirmed more than the producer has written.
    PastTail {
        pipe: PipeId,
        len: usize,
        available: usize,
    },
    /// Confirmed or sent a range that ends inside a packet.
    SplitPacket { pipe: PipeId, len: usize },
    /// Sent more than was confirmed and not yet sent.
    PastConfirmed {
        pipe: PipeId,
        len: usize,
        confirmed: usize,
    },
    /// The shared indices are out of range, unaligned, or the read position is outside them.
    ///
    /// A receive-only pipe frees bytes as it confirms them, so its head never trails its read
    /// position and only a bad tail can trigger this.
    Overrun {
        pipe: PipeId,
        head: u32,
        read: u32,
        tail: u32,
    },
    /// Produced bytes that do not carry a valid packet header.
    CorruptPacket { pipe: PipeId, offset: u32 },
    /// A packet that claims to extend past the produced data.
    TornPacket {
        pipe: PipeId,
        offset: u32,
        pkt_len: usize,
        available: usize,
    },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::Unaligned { pipe, len } => {
                write!(f, "{}: {} bytes is not flit aligned", pipe, len)
            }
            ProtocolViolation::PastTail {
                pipe,
                len,
                available,
            } => write!(
                f,
                "{}: confirming {} bytes but only {} are available",
                pipe, len, available
            ),
            ProtocolViolation::SplitPacket { pipe, len } => {
                write!(f, "{}: {} bytes ends in the middle of a packet", pipe, len)
            }
            ProtocolViolation::PastConfirmed {
                pipe,
                len,
                confirmed,
            } => write!(
                f,
                "{}: sending {} bytes but only {} are confirmed",
                pipe, len, confirmed
            ),
            ProtocolViolation::Overrun {
                pipe,
                head,
                read,
                tail,
            } => write!(
                f,
                "{}: inconsistent indices head={} read={} tail={}",
                pipe, head, read, tail
            ),
            ProtocolViolation::CorruptPacket { pipe, offset } => {
                write!(f, "{}: no packet header at offset {}", pipe, offset)
            }
            ProtocolViolation::TornPacket {
                pipe,
                offset,
                pkt_len,
                available,
            } => write!(
                f,
                "{}: packet at offset {} is {} bytes but only {} are produced",
                pipe, offset, pkt_len, available
            ),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// The memory shared by the two ends of a pipe.
pub(crate) struct PacketBuffer {
    flits: Box<[UnsafeCell<Flit>]>,
    capacity: u32,
    head: AtomicU32,
    tail: AtomicU32,
}

// SAFETY: the bytes are only accessed through `slice`/`slice_mut`, whose callers uphold the
// head/tail protocol: each byte range is accessed by at most one side at a time.
unsafe impl Sync for PacketBuffer {}

impl PacketBuffer {
    pub(crate) fn new(capacity: usize) -> Result<Arc<Self>> {
        ensure!(
            capacity.is_power_of_two(),
            "pipe capacity {} is not a power of two",
            capacity
        );
        ensure!(
            capacity >= MAX_PKT_SIZE + FLIT_SIZE,
            "pipe capacity {} cannot hold a {} byte packet",
            capacity,
            MAX_PKT_SIZE
        );
        ensure!(
            capacity <= (u32::MAX as usize >> 1) + 1,
            "pipe capacity {} is too large",
            capacity
        );

        let nb_flits = (capacity + MAX_PKT_SIZE) / FLIT_SIZE;
        let flits = (0..nb_flits)
            .map(|_| UnsafeCell::new(Flit([0u8; FLIT_SIZE])))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Arc::new(Self {
            flits,
            capacity: capacity as u32,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }))
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.flits.as_ptr()) as *mut u8
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    /// Bytes from `from` to `to`, going forward around the ring.
    #[inline]
    fn distance(&self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.mask()
    }

    #[inline]
    fn wrap(&self, offset: u32, len: u32) -> u32 {
        offset.wrapping_add(len) & self.mask()
    }

    #[inline]
    fn in_range(&self, index: u32) -> bool {
        index < self.capacity && index as usize % FLIT_SIZE == 0
    }

    /// # Safety
    /// `offset < capacity`, `len <= MAX_PKT_SIZE` past the end of the buffer, and the range must
    /// not be written concurrently.
    #[inline]
    unsafe fn slice<'a>(&self, offset: u32, len: usize) -> &'a [u8] {
        debug_assert!(offset < self.capacity);
        debug_assert!(offset as usize + len <= self.capacity as usize + MAX_PKT_SIZE);
        std::slice::from_raw_parts(self.base().add(offset as usize), len)
    }

    /// # Safety
    /// As for [`slice`](Self::slice), and the range must not be accessed by anyone else for `'a`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut<'a>(&self, offset: u32, len: usize) -> &'a mut [u8] {
        debug_assert!(offset < self.capacity);
        debug_assert!(offset as usize + len <= self.capacity as usize + MAX_PKT_SIZE);
        std::slice::from_raw_parts_mut(self.base().add(offset as usize), len)
    }

    /// Length of the packet starting at `offset`, which must be within produced data.
    #[inline]
    fn pkt_len_at(&self, offset: u32) -> Option<usize> {
        // SAFETY: every packet occupies at least one whole flit starting at a flit boundary, so
        // the first flit is inside produced, not-yet-released data.
        let hdr = unsafe { self.slice(offset, FLIT_SIZE) };
        get_pkt_len(hdr).filter(|len| *len <= MAX_PKT_SIZE)
    }

    /// Counts the packets in `[offset, offset + len)`, which must end on a packet boundary.
    fn count_packets(&self, offset: u32, len: usize) -> Option<u32> {
        let mut off = 0;
        let mut nb_pkts = 0;
        while off < len {
            let pkt_len = self.pkt_len_at(self.wrap(offset, off as u32))?;
            off += flit_align(pkt_len);
            nb_pkts += 1;
        }

        if off == len {
            Some(nb_pkts)
        } else {
            None
        }
    }
}

/// A confirmed range of a pipe's buffer handed to the NIC for transmission.
///
/// Holds the buffer alive; the range is not given back to the producer until the transmission
/// completes.
pub struct PipeRegion {
    buffer: Arc<PacketBuffer>,
    offset: u32,
    len: usize,
}

impl fmt::Debug for PipeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeRegion")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl PipeRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn for_each_packet(&self, mut f: impl FnMut(&[u8])) -> Result<usize> {
        let mut off = 0;
        let mut nb_pkts = 0;
        while off < self.len {
            let at = self.buffer.wrap(self.offset, off as u32);
            let pkt_len = self
                .buffer
                .pkt_len_at(at)
                .ok_or_else(|| eyre!("no packet header at pipe offset {}", at))?;
            // SAFETY: the region is confirmed and unreleased: neither side writes it until the
            // request that owns this region completes.
            f(unsafe { self.buffer.slice(at, pkt_len) });
            off += flit_align(pkt_len);
            nb_pkts += 1;
        }
        Ok(nb_pkts)
    }
}

/// Producer end of a pipe, held by the NIC.
pub struct PipeWriter {
    id: PipeId,
    buffer: Arc<PacketBuffer>,
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("id", &self.id)
            .field("head", &self.buffer.head.load(Ordering::Relaxed))
            .field("tail", &self.buffer.tail.load(Ordering::Relaxed))
            .finish()
    }
}

impl PipeWriter {
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Where the next packet goes.
    pub fn tail(&self) -> u32 {
        self.buffer.tail.load(Ordering::Relaxed)
    }

    /// Bytes the producer may still write. One flit is always kept free so that a full buffer
    /// is distinguishable from an empty one.
    pub fn free_space(&self) -> usize {
        let head = self.buffer.head.load(Ordering::Acquire);
        let tail = self.buffer.tail.load(Ordering::Relaxed);
        (self.buffer.capacity - self.buffer.distance(head, tail)) as usize - FLIT_SIZE
    }

    /// Write one packet and make it visible to the consumer.
    ///
    /// The packet length is taken from the frame's own header, so trailing bytes beyond it are
    /// dropped. Returns `Ok(false)` if there is not enough free space.
    pub fn try_push(&mut self, frame: &[u8]) -> Result<bool> {
        let pkt_len = get_pkt_len(frame)
            .ok_or_else(|| eyre!("frame of {} bytes has no packet header", frame.len()))?;
        ensure!(
            pkt_len <= frame.len(),
            "frame header claims {} bytes but only {} are present",
            pkt_len,
            frame.len()
        );
        ensure!(
            pkt_len <= MAX_PKT_SIZE,
            "packet of {} bytes exceeds the {} byte limit",
            pkt_len,
            MAX_PKT_SIZE
        );

        let aligned = flit_align(pkt_len);
        if aligned > self.free_space() {
            trace!(pipe = %self.id, ?aligned, "pipe full");
            return Ok(false);
        }

        let tail = self.buffer.tail.load(Ordering::Relaxed);
        // SAFETY: `[tail, tail + aligned)` is free space, which only the producer touches. The
        // overflow area covers anything past the physical end.
        let dst = unsafe { self.buffer.slice_mut(tail, pkt_len) };
        dst.copy_from_slice(&frame[..pkt_len]);

        let new_tail = self.buffer.wrap(tail, aligned as u32);
        self.buffer.tail.store(new_tail, Ordering::Release);
        trace!(pipe = %self.id, ?pkt_len, ?new_tail, "pushed packet");
        Ok(true)
    }
}

/// A run of whole, flit-aligned packets, contiguous in memory.
///
/// The batch borrows its pipe, so the pipe cannot be confirmed or peeked again while the batch's
/// bytes are reachable.
pub struct Batch<'a> {
    pipe: PipeId,
    data: &'a mut [u8],
    nb_pkts: u32,
    /// Set for `consume_batch`: released when the batch is dropped.
    consume: Option<&'a mut RxPipe>,
}

impl<'a> fmt::Debug for Batch<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("pipe", &self.pipe)
            .field("ptr", &self.data.as_ptr())
            .field("len", &self.data.len())
            .field("nb_pkts", &self.nb_pkts)
            .finish()
    }
}

impl<'a> Batch<'a> {
    pub fn pipe_id(&self) -> PipeId {
        self.pipe
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Flit-aligned length in bytes; this is the amount to confirm.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn nb_pkts(&self) -> u32 {
        self.nb_pkts
    }

    pub fn as_slice(&self) -> &[u8] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    pub fn iter(&self) -> PktIter<'_> {
        PktIter { rest: &*self.data }
    }

    pub fn iter_mut(&mut self) -> PktIterMut<'_> {
        PktIterMut {
            rest: &mut *self.data,
        }
    }
}

impl<'a> Drop for Batch<'a> {
    fn drop(&mut self) {
        match self.consume.take() {
            Some(pipe) if !self.data.is_empty() => pipe.advance(self.data.len(), self.nb_pkts),
            _ => {}
        }
    }
}

impl<'a, 'b> IntoIterator for &'b Batch<'a> {
    type Item = &'b [u8];
    type IntoIter = PktIter<'b>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Packets of a batch, each trimmed to its real length.
pub struct PktIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for PktIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let pkt_len = get_pkt_len(self.rest)?;
        let aligned = flit_align(pkt_len).min(self.rest.len());
        let (pkt, rest) = self.rest.split_at(aligned);
        self.rest = rest;
        Some(&pkt[..pkt_len.min(aligned)])
    }
}

pub struct PktIterMut<'a> {
    rest: &'a mut [u8],
}

impl<'a> Iterator for PktIterMut<'a> {
    type Item = &'a mut [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = std::mem::take(&mut self.rest);
        let pkt_len = get_pkt_len(rest)?;
        let aligned = flit_align(pkt_len).min(rest.len());
        let (pkt, rest) = rest.split_at_mut(aligned);
        self.rest = rest;
        Some(&mut pkt[..pkt_len.min(aligned)])
    }
}

/// Knobs for the consumer end of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    pub capacity: usize,
    /// A batch stops growing once it reaches this many bytes. A batch always holds at least one
    /// packet.
    pub max_batch_bytes: usize,
    pub head_update_period: u32,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 21,
            max_batch_bytes: 1 << 16,
            head_update_period: crate::notification::HEAD_UPDATE_PERIOD,
        }
    }
}

/// Create an unbound pipe: the consumer end and the producer end.
pub fn pipe(id: PipeId, config: &PipeConfig) -> Result<(RxPipe, PipeWriter)> {
    let buffer = PacketBuffer::new(config.capacity)?;
    let writer = PipeWriter {
        id,
        buffer: Arc::clone(&buffer),
    };
    Ok((RxPipe::new(id, buffer, config, true), writer))
}

/// Consumer end of a pipe.
pub struct RxPipe {
    id: PipeId,
    buffer: Arc<PacketBuffer>,
    /// Next unread byte.
    read: u32,
    /// Everything before this is free; published to `buffer.head` lazily.
    released: u32,
    /// Whether confirming also frees. `RxTxPipe` frees on transmit completion instead.
    free_on_confirm: bool,
    max_batch_bytes: usize,
    head_sync: HeadSync,
    binding: Option<Binding>,
}

impl fmt::Debug for RxPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPipe")
            .field("id", &self.id)
            .field("read", &self.read)
            .field("released", &self.released)
            .field("tail", &self.buffer.tail.load(Ordering::Relaxed))
            .finish()
    }
}

impl RxPipe {
    fn new(
        id: PipeId,
        buffer: Arc<PacketBuffer>,
        config: &PipeConfig,
        free_on_confirm: bool,
    ) -> Self {
        Self {
            id,
            buffer,
            read: 0,
            released: 0,
            free_on_confirm,
            max_batch_bytes: config.max_batch_bytes,
            head_sync: HeadSync::new(config.head_update_period),
            binding: None,
        }
    }

    pub(crate) fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity as usize
    }

    /// Steer traffic matching `rule` to this pipe.
    pub fn bind(&mut self, rule: FlowRule) -> Result<()> {
        let binding = self
            .binding
            .as_ref()
            .ok_or_else(|| eyre!("{} is not attached to a device", self.id))?;
        binding.bind(rule)
    }

    /// Produced bytes not yet confirmed.
    pub fn bytes_available(&self) -> usize {
        let tail = self.buffer.tail.load(Ordering::Acquire);
        self.buffer.distance(self.read, tail) as usize
    }

    fn violation(&self, v: ProtocolViolation) -> color_eyre::Report {
        warn!(pipe = %self.id, violation = %v, "protocol violation");
        color_eyre::Report::new(v)
    }

    /// Load the producer's tail and check it against our own indices.
    fn observe_tail(&self) -> Result<u32> {
        let tail = self.buffer.tail.load(Ordering::Acquire);
        // released == read when freeing on confirm.
        let consistent = self.buffer.in_range(tail)
            && (self.free_on_confirm
                || self.buffer.distance(self.released, self.read)
                    <= self.buffer.distance(self.released, tail));
        if !consistent {
            return Err(self.violation(ProtocolViolation::Overrun {
                pipe: self.id,
                head: self.released,
                read: self.read,
                tail,
            }));
        }
        Ok(tail)
    }

    /// Find the next batch: `(bytes, packets)`.
    fn scan(&self) -> Result<(usize, u32)> {
        let tail = self.observe_tail()?;
        let available = self.buffer.distance(self.read, tail) as usize;
        let to_end = (self.buffer.capacity - self.read) as usize;

        let mut len = 0;
        let mut nb_pkts = 0;
        // a packet may start anywhere before the physical end, but no later.
        while len < available && len < to_end {
            let offset = self.buffer.wrap(self.read, len as u32);
            let pkt_len = match self.buffer.pkt_len_at(offset) {
                Some(l) => l,
                None => {
                    return Err(self.violation(ProtocolViolation::CorruptPacket {
                        pipe: self.id,
                        offset,
                    }))
                }
            };

            let aligned = flit_align(pkt_len);
            if len + aligned > available {
                if len == 0 {
                    return Err(self.violation(ProtocolViolation::TornPacket {
                        pipe: self.id,
                        offset,
                        pkt_len,
                        available,
                    }));
                }
                break;
            }
            if len > 0 && len + aligned > self.max_batch_bytes {
                break;
            }

            len += aligned;
            nb_pkts += 1;
        }

        Ok((len, nb_pkts))
    }

    /// The next run of whole packets, without consuming it.
    ///
    /// An empty batch means nothing is available. Peeking again without confirming returns the
    /// same bytes (possibly followed by more, if the producer appended in the meantime).
    pub fn peek_batch(&mut self) -> Result<Batch<'_>> {
        let (len, nb_pkts) = self.scan()?;
        // SAFETY: `[read, read + len)` is produced and unconfirmed, so only we access it, and the
        // batch holds `&mut self` so nothing can confirm it while the slice is alive.
        let data = unsafe { self.buffer.slice_mut(self.read, len) };
        Ok(Batch {
            pipe: self.id,
            data,
            nb_pkts,
            consume: None,
        })
    }

    /// Like [`peek_batch`](Self::peek_batch), but the batch is confirmed when dropped.
    pub fn consume_batch(&mut self) -> Result<Batch<'_>> {
        let (len, nb_pkts) = self.scan()?;
        let id = self.id;
        // SAFETY: as in `peek_batch`; the bytes are released only after the slice is dropped.
        let data = unsafe { self.buffer.slice_mut(self.read, len) };
        Ok(Batch {
            pipe: id,
            data,
            nb_pkts,
            consume: Some(self),
        })
    }

    /// Confirm `len` bytes, handing them back to the producer.
    ///
    /// `len` must be a whole number of flits, no more than [`bytes_available`], and end on a
    /// packet boundary; anything else is a [`ProtocolViolation`].
    ///
    /// This is stricter than flit granularity: a flit-aligned length that stops inside a packet
    /// is rejected as [`ProtocolViolation::SplitPacket`], since head updates count whole packets.
    ///
    /// [`bytes_available`]: Self::bytes_available
    pub fn confirm_bytes(&mut self, len: usize) -> Result<()> {
        if len % FLIT_SIZE != 0 {
            return Err(self.violation(ProtocolViolation::Unaligned { pipe: self.id, len }));
        }

        let tail = self.observe_tail()?;
        let available = self.buffer.distance(self.read, tail) as usize;
        if len > available {
            return Err(self.violation(ProtocolViolation::PastTail {
                pipe: self.id,
                len,
                available,
            }));
        }

        let nb_pkts = match self.buffer.count_packets(self.read, len) {
            Some(n) => n,
            None => return Err(self.violation(ProtocolViolation::SplitPacket { pipe: self.id, len })),
        };

        self.advance(len, nb_pkts);
        Ok(())
    }

    /// Confirm everything currently available.
    pub fn confirm_all(&mut self) -> Result<usize> {
        let len = self.bytes_available();
        self.confirm_bytes(len)?;
        Ok(len)
    }

    /// Move the read position past already-validated bytes.
    fn advance(&mut self, len: usize, nb_pkts: u32) {
        self.read = self.buffer.wrap(self.read, len as u32);
        if self.free_on_confirm {
            self.free(len, nb_pkts);
        }
    }

    /// Give `len` bytes after the current head back to the producer.
    fn free(&mut self, len: usize, nb_pkts: u32) {
        self.released = self.buffer.wrap(self.released, len as u32);
        let caught_up = self.released == self.buffer.tail.load(Ordering::Acquire);
        if self.head_sync.update_local_head(nb_pkts, caught_up) {
            self.publish_head();
        }
    }

    fn publish_head(&self) {
        self.buffer.head.store(self.released, Ordering::Release);
    }

    /// Publish the head now, regardless of the update period.
    pub fn flush_head(&mut self) {
        self.head_sync.reset();
        self.publish_head();
    }
}

impl Drop for RxPipe {
    fn drop(&mut self) {
        debug!(pipe = %self.id, unread = self.bytes_available(), "dropping pipe");
    }
}

/// A pipe whose received packets are transmitted back out in place.
///
/// Confirming only moves the read position; the bytes are freed once their transmission
/// completes, so the NIC can read them directly out of the pipe.
pub struct RxTxPipe {
    rx: RxPipe,
    tx: NotificationChannel,
    /// Next confirmed byte not yet handed to the NIC.
    sent: u32,
    /// `(bytes, packets)` per in-flight request, in submission order.
    in_flight: VecDeque<(usize, u32)>,
}

impl fmt::Debug for RxTxPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxTxPipe")
            .field("rx", &self.rx)
            .field("sent", &self.sent)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl RxTxPipe {
    pub(crate) fn new(
        id: PipeId,
        config: &PipeConfig,
        tx: NotificationChannel,
    ) -> Result<(Self, PipeWriter)> {
        let buffer = PacketBuffer::new(config.capacity)?;
        let writer = PipeWriter {
            id,
            buffer: Arc::clone(&buffer),
        };
        let rx = RxPipe::new(id, buffer, config, false);
        Ok((
            Self {
                rx,
                tx,
                sent: 0,
                in_flight: VecDeque::new(),
            },
            writer,
        ))
    }

    pub(crate) fn with_binding(mut self, binding: Binding) -> Self {
        self.rx = self.rx.with_binding(binding);
        self
    }

    pub fn id(&self) -> PipeId {
        self.rx.id()
    }

    pub fn bind(&mut self, rule: FlowRule) -> Result<()> {
        self.rx.bind(rule)
    }

    pub fn bytes_available(&self) -> usize {
        self.rx.bytes_available()
    }

    pub fn peek_batch(&mut self) -> Result<Batch<'_>> {
        self.rx.peek_batch()
    }

    pub fn consume_batch(&mut self) -> Result<Batch<'_>> {
        self.rx.consume_batch()
    }

    pub fn confirm_bytes(&mut self, len: usize) -> Result<()> {
        self.rx.confirm_bytes(len)
    }

    /// Confirmed bytes not yet handed to the NIC.
    pub fn unsent_bytes(&self) -> usize {
        self.rx.buffer.distance(self.sent, self.rx.read) as usize
    }

    /// Requests handed to the NIC and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Transmit the next `len` confirmed bytes and free them once the transmission completes.
    ///
    /// Sending zero bytes queues nothing and returns [`Submission::Empty`].
    pub fn send_and_free(&mut self, len: usize) -> Result<Submission> {
        let id = self.rx.id;
        if len % FLIT_SIZE != 0 {
            return Err(self.rx.violation(ProtocolViolation::Unaligned { pipe: id, len }));
        }
        let confirmed = self.unsent_bytes();
        if len > confirmed {
            return Err(self.rx.violation(ProtocolViolation::PastConfirmed {
                pipe: id,
                len,
                confirmed,
            }));
        }
        if len == 0 {
            return Ok(Submission::Empty);
        }
        let nb_pkts = match self.rx.buffer.count_packets(self.sent, len) {
            Some(n) => n,
            None => return Err(self.rx.violation(ProtocolViolation::SplitPacket { pipe: id, len })),
        };

        let region = PipeRegion {
            buffer: Arc::clone(&self.rx.buffer),
            offset: self.sent,
            len,
        };
        let submission = self.tx.submit(TxPayload::Pipe(region))?;
        if submission.is_accepted() {
            self.sent = self.rx.buffer.wrap(self.sent, len as u32);
            self.in_flight.push_back((len, nb_pkts));
        }
        Ok(submission)
    }

    /// Free the bytes of every completed transmission. Returns the number of completions.
    pub fn process_completions(&mut self) -> u32 {
        let completions = self.tx.drain_completions();
        for _ in 0..completions {
            match self.in_flight.pop_front() {
                Some((len, nb_pkts)) => self.rx.free(len, nb_pkts),
                None => {
                    warn!(pipe = %self.rx.id, "completion without an in-flight request");
                    break;
                }
            }
        }
        completions
    }

    pub fn flush_head(&mut self) {
        self.rx.flush_head();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PipeRegistry;
    use crate::utils::{build_udp_packet, HeaderInfo, TOTAL_HEADER_SIZE};

    fn test_id() -> PipeId {
        PipeRegistry::new().insert(())
    }

    fn cfg(capacity: usize) -> PipeConfig {
        PipeConfig {
            capacity,
            max_batch_bytes: usize::MAX,
            head_update_period: 1,
        }
    }

    /// A packet of exactly `len` bytes whose payload is filled with `fill`.
    fn pkt(len: usize, fill: u8) -> Vec<u8> {
        build_udp_packet(&HeaderInfo::default(), &vec![fill; len - TOTAL_HEADER_SIZE], 0).unwrap()
    }

    fn violation(err: color_eyre::Report) -> ProtocolViolation {
        err.downcast_ref::<ProtocolViolation>()
            .cloned()
            .expect("not a protocol violation")
    }

    #[test]
    fn single_packet_scenario() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        let p = pkt(100, 1);
        assert!(tx.try_push(&p).unwrap());
        assert_eq!(rx.bytes_available(), 128);

        let batch = rx.peek_batch().unwrap();
        assert_eq!(batch.len(), 128);
        assert_eq!(batch.nb_pkts(), 1);
        assert_eq!(&batch.as_slice()[..100], &p[..]);
        drop(batch);

        rx.confirm_bytes(128).unwrap();
        assert_eq!(rx.bytes_available(), 0);
        assert!(rx.peek_batch().unwrap().is_empty());
    }

    #[test]
    fn empty_pipe_is_not_an_error() {
        let (mut rx, _tx) = pipe(test_id(), &cfg(4096)).unwrap();
        let batch = rx.peek_batch().unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.iter().count(), 0);
        drop(batch);
        rx.confirm_bytes(0).unwrap();
    }

    #[test]
    fn peek_is_idempotent() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        assert!(tx.try_push(&pkt(64, 2)).unwrap());
        assert!(tx.try_push(&pkt(300, 3)).unwrap());

        let (p1, l1) = {
            let b = rx.peek_batch().unwrap();
            (b.as_ptr(), b.len())
        };
        let (p2, l2) = {
            let b = rx.peek_batch().unwrap();
            (b.as_ptr(), b.len())
        };
        assert_eq!((p1, l1), (p2, l2));
        assert_eq!(l1, 64 + 320);
    }

    #[test]
    fn batch_iterates_packets() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        for (i, len) in [60usize, 64, 65, 200].iter().enumerate() {
            assert!(tx.try_push(&pkt(*len, i as u8)).unwrap());
        }

        let mut batch = rx.peek_batch().unwrap();
        let lens: Vec<_> = batch.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![60, 64, 65, 200]);
        for p in batch.iter_mut() {
            p[p.len() - 1] = 0xee;
        }
        assert!(batch.iter().all(|p| p[p.len() - 1] == 0xee));
        assert_eq!(batch.len(), 64 + 64 + 128 + 256);
    }

    #[test]
    fn consume_releases_on_drop() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        assert!(tx.try_push(&pkt(100, 1)).unwrap());
        {
            let batch = rx.consume_batch().unwrap();
            assert_eq!(batch.len(), 128);
        }
        assert_eq!(rx.bytes_available(), 0);
        assert_eq!(tx.free_space(), 4096 - FLIT_SIZE);
    }

    #[test]
    fn bad_confirms_are_violations() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        assert!(tx.try_push(&pkt(100, 1)).unwrap());

        match violation(rx.confirm_bytes(100).unwrap_err()) {
            ProtocolViolation::Unaligned { len, .. } => assert_eq!(len, 100),
            v => panic!("unexpected {:?}", v),
        }
        match violation(rx.confirm_bytes(192).unwrap_err()) {
            ProtocolViolation::PastTail { available, .. } => assert_eq!(available, 128),
            v => panic!("unexpected {:?}", v),
        }
        match violation(rx.confirm_bytes(64).unwrap_err()) {
            ProtocolViolation::SplitPacket { len, .. } => assert_eq!(len, 64),
            v => panic!("unexpected {:?}", v),
        }
        // nothing moved
        assert_eq!(rx.bytes_available(), 128);
    }

    #[test]
    fn full_buffer_backpressures_producer() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        let p = pkt(1000, 9); // 1024 aligned
        assert!(tx.try_push(&p).unwrap());
        assert!(tx.try_push(&p).unwrap());
        assert!(tx.try_push(&p).unwrap());
        // a fourth would leave no free flit
        assert!(!tx.try_push(&p).unwrap());
        assert_eq!(rx.bytes_available(), 3072);

        rx.confirm_bytes(1024).unwrap();
        assert!(tx.try_push(&p).unwrap());
        assert_eq!(rx.bytes_available(), 3072);
    }

    #[test]
    fn straddling_packet_is_contiguous() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        let filler = pkt(960, 0); // 960 bytes, exactly 15 flits
        for _ in 0..4 {
            assert!(tx.try_push(&filler).unwrap());
            rx.confirm_all().unwrap();
        }
        // read == 3840: 256 bytes before the physical end
        let big = pkt(500, 7);
        let after = pkt(100, 8);
        assert!(tx.try_push(&big).unwrap());
        assert!(tx.try_push(&after).unwrap());

        {
            let batch = rx.peek_batch().unwrap();
            // the batch ends after the straddling packet
            assert_eq!(batch.len(), 512);
            assert_eq!(&batch.as_slice()[..500], &big[..]);
        }
        rx.confirm_bytes(512).unwrap();

        let batch = rx.peek_batch().unwrap();
        assert_eq!(batch.len(), 128);
        assert_eq!(&batch.as_slice()[..100], &after[..]);
    }

    #[test]
    fn batch_cap_keeps_whole_packets() {
        let config = PipeConfig {
            capacity: 4096,
            max_batch_bytes: 200,
            head_update_period: 1,
        };
        let (mut rx, mut tx) = pipe(test_id(), &config).unwrap();
        assert!(tx.try_push(&pkt(300, 1)).unwrap());
        assert!(tx.try_push(&pkt(60, 2)).unwrap());

        // a single oversized packet still comes out
        assert_eq!(rx.peek_batch().unwrap().len(), 320);
        rx.confirm_bytes(320).unwrap();
        assert_eq!(rx.peek_batch().unwrap().len(), 64);
    }

    #[test]
    fn lazy_head_publication() {
        let config = PipeConfig {
            capacity: 4096,
            max_batch_bytes: usize::MAX,
            head_update_period: 2,
        };
        let (mut rx, mut tx) = pipe(test_id(), &config).unwrap();
        for _ in 0..3 {
            assert!(tx.try_push(&pkt(64, 1)).unwrap());
        }
        rx.confirm_bytes(64).unwrap();
        // not yet published: the producer still sees three packets in use
        assert_eq!(tx.free_space(), 4096 - 64 - 3 * 64);
        rx.confirm_bytes(64).unwrap();
        assert_eq!(tx.free_space(), 4096 - 64 - 64);
        // catching up publishes immediately
        rx.confirm_bytes(64).unwrap();
        assert_eq!(tx.free_space(), 4096 - 64);
    }

    #[test]
    fn corrupt_indices_are_detected() {
        let (mut rx, tx) = pipe(test_id(), &cfg(4096)).unwrap();
        tx.buffer.tail.store(100, Ordering::Release);
        match violation(rx.peek_batch().unwrap_err()) {
            ProtocolViolation::Overrun { tail, .. } => assert_eq!(tail, 100),
            v => panic!("unexpected {:?}", v),
        }

        // produced bytes without a header
        tx.buffer.tail.store(128, Ordering::Release);
        match violation(rx.peek_batch().unwrap_err()) {
            ProtocolViolation::CorruptPacket { offset, .. } => assert_eq!(offset, 0),
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn tail_behind_unsent_bytes_is_detected() {
        let (ch, _nic) = NotificationChannel::new(4).unwrap();
        let (mut pipe, mut tx) = RxTxPipe::new(test_id(), &cfg(4096), ch).unwrap();
        assert!(tx.try_push(&pkt(100, 1)).unwrap());
        assert!(tx.try_push(&pkt(100, 2)).unwrap());
        pipe.confirm_bytes(128).unwrap();

        // head is still 0, but the tail now claims less than was already read
        tx.buffer.tail.store(64, Ordering::Release);
        match violation(pipe.peek_batch().unwrap_err()) {
            ProtocolViolation::Overrun { head, read, tail, .. } => {
                assert_eq!((head, read, tail), (0, 128, 64))
            }
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn rx_only_overrun_is_a_bad_tail() {
        let (mut rx, mut tx) = pipe(test_id(), &cfg(4096)).unwrap();
        assert!(tx.try_push(&pkt(100, 1)).unwrap());
        rx.confirm_bytes(128).unwrap();
        assert_eq!(rx.released, rx.read);

        // any in-range, aligned tail passes the index check; the garbage behind it does not
        tx.buffer.tail.store(4096 - 64, Ordering::Release);
        match violation(rx.peek_batch().unwrap_err()) {
            ProtocolViolation::CorruptPacket { offset, .. } => assert_eq!(offset, 128),
            v => panic!("unexpected {:?}", v),
        }
        tx.buffer.tail.store(4096, Ordering::Release);
        assert!(matches!(
            violation(rx.peek_batch().unwrap_err()),
            ProtocolViolation::Overrun { .. }
        ));
    }

    #[test]
    fn invalid_capacity() {
        assert!(pipe(test_id(), &cfg(3000)).is_err());
        assert!(pipe(test_id(), &cfg(1024)).is_err());
    }

    #[test]
    fn rx_tx_frees_on_completion() {
        let (ch, nic) = NotificationChannel::new(4).unwrap();
        let (mut pipe, mut tx) = RxTxPipe::new(test_id(), &cfg(4096), ch).unwrap();
        let p = pkt(100, 5);
        assert!(tx.try_push(&p).unwrap());

        let len = pipe.peek_batch().unwrap().len();
        pipe.confirm_bytes(len).unwrap();
        assert_eq!(pipe.bytes_available(), 0);
        // confirmed but not yet freed
        assert_eq!(tx.free_space(), 4096 - 64 - 128);
        assert_eq!(pipe.unsent_bytes(), 128);

        assert!(pipe.send_and_free(len).unwrap().is_accepted());
        assert_eq!(pipe.unsent_bytes(), 0);
        assert_eq!(pipe.process_completions(), 0);

        let req = nic.next_request().unwrap().unwrap();
        let mut sent = vec![];
        req.payload.for_each_packet(|b| sent.push(b.to_vec())).unwrap();
        assert_eq!(sent, vec![p]);
        nic.complete(req.token);

        assert_eq!(pipe.process_completions(), 1);
        assert_eq!(pipe.in_flight(), 0);
        assert_eq!(tx.free_space(), 4096 - 64);
    }

    #[test]
    fn rx_tx_cannot_send_unconfirmed() {
        let (ch, _nic) = NotificationChannel::new(4).unwrap();
        let (mut pipe, mut tx) = RxTxPipe::new(test_id(), &cfg(4096), ch).unwrap();
        assert!(tx.try_push(&pkt(100, 5)).unwrap());
        match violation(pipe.send_and_free(128).unwrap_err()) {
            ProtocolViolation::PastConfirmed { confirmed, .. } => assert_eq!(confirmed, 0),
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn rx_tx_empty_send_is_a_no_op() {
        let (ch, nic) = NotificationChannel::new(4).unwrap();
        let (mut pipe, _tx) = RxTxPipe::new(test_id(), &cfg(4096), ch).unwrap();
        assert_eq!(pipe.send_and_free(0).unwrap(), Submission::Empty);
        assert_eq!(pipe.in_flight(), 0);
        assert!(nic.next_request().unwrap().is_none());
    }
}
