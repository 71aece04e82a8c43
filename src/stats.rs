use std::sync::atomic::{AtomicU64, Ordering};

/// Per-thread datapath counters.
///
/// Written by the polling loop, read by whoever reports them. Updates are relaxed: a reader may
/// see counters from slightly different instants.
#[derive(Debug, Default)]
pub struct Stats {
    nb_pkts: AtomicU64,
    recv_bytes: AtomicU64,
    nb_batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nb_pkts: u64,
    pub recv_bytes: u64,
    pub nb_batches: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_batch(&self, nb_pkts: u64, bytes: u64) {
        self.nb_pkts.fetch_add(nb_pkts, Ordering::Relaxed);
        self.recv_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.nb_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nb_pkts: self.nb_pkts.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            nb_batches: self.nb_batches.load(Ordering::Relaxed),
        }
    }
}

impl std::ops::Sub for StatsSnapshot {
    type Output = StatsSnapshot;

    fn sub(self, earlier: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            nb_pkts: self.nb_pkts.saturating_sub(earlier.nb_pkts),
            recv_bytes: self.recv_bytes.saturating_sub(earlier.recv_bytes),
            nb_batches: self.nb_batches.saturating_sub(earlier.nb_batches),
        }
    }
}
