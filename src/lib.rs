//! Kernel-bypass packet I/O over Enso pipes.
//!
//! A NIC writes received packets back to back, flit aligned, into ring buffers ("pipes") shared
//! with the application, and the application hands buffers back for transmission over a
//! notification channel. There is no per-packet descriptor: the packet length is read from the
//! packet's own headers.
//!
//! - [`Device`] allocates pipes, binds them to flows, and sends.
//! - [`RxPipe`] and [`RxTxPipe`] are the consumer ends of pipes.
//! - [`NetworkEmulator`] is an in-process NIC for tests and demos.

macro_rules! static_assert(
    ($x: expr) => {
        #[allow(unknown_lints, eq_op)]
        const _: [(); 0 - !{
            const ASSERT: bool = $x;
            ASSERT
        } as usize] = [];
    }
);

pub mod config;
pub mod device;
pub mod emulator;
pub mod notification;
pub mod pipe;
pub mod poll;
pub mod registry;
pub mod stats;
pub mod steering;
pub mod utils;

pub use config::EnsoConfig;
pub use device::{Backend, Device, PipeKey, PipeKind};
pub use emulator::{EmulatorHandle, NetworkEmulator, PollSummary};
pub use notification::{
    NotificationChannel, RxNotification, RxNotifications, RxNotifier, Submission, TxPayload,
    TxToken,
};
pub use pipe::{Batch, PipeConfig, PipeWriter, ProtocolViolation, RxPipe, RxTxPipe};
pub use poll::{poll_echo, poll_rx, StopToken};
pub use registry::PipeId;
pub use stats::{Stats, StatsSnapshot};
pub use steering::{FlowRule, RssHash, RssHasher};
