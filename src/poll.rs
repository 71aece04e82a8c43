//! Busy-polling loops.
//!
//! Each application thread owns its pipes and round-robins over them. A loop only checks its
//! [`StopToken`] between batches, so a batch that was peeked is always confirmed (and, for echo,
//! handed to the NIC) before the loop returns.

use crate::notification::Submission;
use crate::pipe::{RxPipe, RxTxPipe};
use crate::registry::PipeId;
use crate::stats::Stats;
use color_eyre::eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cooperative cancellation flag shared between a polling loop and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Receive-only loop: `process` sees every packet, then the batch is confirmed.
pub fn poll_rx<F>(
    pipes: &mut [RxPipe],
    stop: &StopToken,
    stats: &Stats,
    mut process: F,
) -> Result<()>
where
    F: FnMut(PipeId, &[u8]),
{
    while !stop.is_stopped() {
        let mut idle = true;
        for pipe in pipes.iter_mut() {
            let id = pipe.id();
            let batch = pipe.peek_batch()?;
            if batch.is_empty() {
                continue;
            }

            idle = false;
            for pkt in batch.iter() {
                process(id, pkt);
            }
            let (len, nb_pkts) = (batch.len(), batch.nb_pkts());
            drop(batch);

            pipe.confirm_bytes(len)?;
            stats.record_batch(nb_pkts as u64, len as u64);
        }

        if idle {
            std::hint::spin_loop();
        }
    }

    debug!("rx loop stopped");
    Ok(())
}

/// Echo loop: `process` may rewrite every packet in place, then the batch is sent back out of
/// the same pipe and freed once the transmission completes.
///
/// Confirmed bytes that hit tx backpressure stay queued on the pipe and are sent on a later
/// round, before the pipe is peeked again.
pub fn poll_echo<F>(
    pipes: &mut [RxTxPipe],
    stop: &StopToken,
    stats: &Stats,
    mut process: F,
) -> Result<()>
where
    F: FnMut(PipeId, &mut [u8]),
{
    while !stop.is_stopped() {
        let mut idle = true;
        for pipe in pipes.iter_mut() {
            pipe.process_completions();

            let unsent = pipe.unsent_bytes();
            if unsent > 0 {
                match pipe.send_and_free(unsent)? {
                    Submission::Accepted(_) | Submission::Empty => {}
                    Submission::Backpressure => {
                        trace!(pipe = %pipe.id(), ?unsent, "still backpressured");
                        continue;
                    }
                }
            }

            let id = pipe.id();
            let mut batch = pipe.peek_batch()?;
            if batch.is_empty() {
                continue;
            }

            idle = false;
            for pkt in batch.iter_mut() {
                process(id, pkt);
            }
            let (len, nb_pkts) = (batch.len(), batch.nb_pkts());
            drop(batch);

            pipe.confirm_bytes(len)?;
            stats.record_batch(nb_pkts as u64, len as u64);

            if let Submission::Backpressure = pipe.send_and_free(len)? {
                trace!(pipe = %id, ?len, "tx backpressure, deferring send");
            }
        }

        if idle {
            std::hint::spin_loop();
        }
    }

    debug!("echo loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationChannel;
    use crate::pipe::{self, PipeConfig};
    use crate::registry::PipeRegistry;
    use crate::utils::{build_udp_packet, HeaderInfo};

    fn pkt(payload_len: usize) -> Vec<u8> {
        build_udp_packet(&HeaderInfo::default(), &vec![1u8; payload_len], 0).unwrap()
    }

    #[test]
    fn rx_loop_confirms_before_stopping() {
        let mut reg = PipeRegistry::new();
        let config = PipeConfig {
            capacity: 4096,
            ..Default::default()
        };
        let (rx_a, mut tx_a) = pipe::pipe(reg.insert(()), &config).unwrap();
        let (rx_b, mut tx_b) = pipe::pipe(reg.insert(()), &config).unwrap();
        for _ in 0..3 {
            assert!(tx_a.try_push(&pkt(100)).unwrap());
        }
        assert!(tx_b.try_push(&pkt(10)).unwrap());

        let mut pipes = vec![rx_a, rx_b];
        let stop = StopToken::new();
        let stats = Stats::new();
        let mut seen = 0;
        let s = stop.clone();
        poll_rx(&mut pipes, &stop, &stats, |_, p| {
            assert!(p.len() == 142 || p.len() == 52);
            seen += 1;
            if seen == 4 {
                s.stop();
            }
        })
        .unwrap();

        assert_eq!(seen, 4);
        assert!(pipes.iter().all(|p| p.bytes_available() == 0));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.nb_pkts, 4);
        assert_eq!(snapshot.recv_bytes, 3 * 192 + 64);
        assert_eq!(snapshot.nb_batches, 2);
    }

    #[test]
    fn echo_loop_hands_batches_to_the_nic() {
        let mut reg = PipeRegistry::new();
        let config = PipeConfig {
            capacity: 4096,
            ..Default::default()
        };
        let (ch, nic) = NotificationChannel::new(8).unwrap();
        let (rxtx, mut tx) = RxTxPipe::new(reg.insert(()), &config, ch).unwrap();
        assert!(tx.try_push(&pkt(100)).unwrap());
        assert!(tx.try_push(&pkt(100)).unwrap());

        let mut pipes = vec![rxtx];
        let stop = StopToken::new();
        let s = stop.clone();
        poll_echo(&mut pipes, &stop, &Stats::new(), |_, p| {
            p[0] = 0xaa;
            s.stop();
        })
        .unwrap();

        let req = nic.next_request().unwrap().unwrap();
        let mut sent = 0;
        req.payload
            .for_each_packet(|p| {
                assert_eq!(p[0], 0xaa);
                sent += 1;
            })
            .unwrap();
        assert_eq!(sent, 2);
        assert!(nic.next_request().unwrap().is_none());
        // not freed until completed
        assert_eq!(tx.free_space(), 4096 - 64 - 2 * 192);
        nic.complete(req.token);
        assert_eq!(pipes[0].process_completions(), 1);
        assert_eq!(tx.free_space(), 4096 - 64);
    }
}
