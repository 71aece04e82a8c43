//! Device handle: allocates pipes, binds them to flows, and sends.
//!
//! The NIC itself sits behind the [`Backend`] trait. A pipe's consumer end is handed to the
//! application and its producer end to the backend; dropping the consumer end tears the pipe
//! down on both sides.

use crate::config::EnsoConfig;
use crate::notification::{
    rx_notifications, NotificationChannel, RxNotification, RxNotifications, RxNotifier,
    Submission, TxPayload, TxQueueConsumer, MAX_PENDING_RX_NOTIFICATIONS,
};
use crate::pipe::{self, Batch, PipeWriter, RxPipe, RxTxPipe};
use crate::registry::{PipeId, PipeRegistry};
use crate::steering::FlowRule;
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// A pipe's identity on the NIC. Pipe ids are only unique within one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeKey {
    pub app_id: u16,
    pub pipe: PipeId,
}

impl fmt::Display for PipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}/{}", self.app_id, self.pipe)
    }
}

/// What the core needs from the NIC.
pub trait Backend: Send + Sync {
    /// Start producing into a freshly allocated pipe.
    fn attach(&self, key: PipeKey, writer: PipeWriter) -> Result<()>;
    /// Steer traffic matching `rule` into the pipe.
    fn bind(&self, key: PipeKey, rule: FlowRule) -> Result<()>;
    /// Stop producing into the pipe and drop its rules.
    fn detach(&self, key: PipeKey) -> Result<()>;
    /// Start serving a transmission queue.
    fn attach_tx(&self, queue: TxQueueConsumer) -> Result<()>;
    /// Report writes into the application's pipes on `notifier`.
    fn attach_rx(&self, app_id: u16, notifier: RxNotifier) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Rx,
    RxTx,
}

#[derive(Debug)]
struct PipeEntry {
    kind: PipeKind,
    rule: Option<FlowRule>,
}

type Registry = Arc<Mutex<PipeRegistry<PipeEntry>>>;

/// Ties a pipe's consumer end to the device. Tears the pipe down when dropped.
pub(crate) struct Binding {
    key: PipeKey,
    backend: Arc<dyn Backend>,
    pipes: Registry,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

impl Binding {
    pub(crate) fn bind(&self, rule: FlowRule) -> Result<()> {
        {
            let mut pipes = self
                .pipes
                .lock()
                .map_err(|_| eyre!("pipe registry lock poisoned"))?;
            let entry = pipes
                .get_mut(self.key.pipe)
                .ok_or_else(|| eyre!("{} is not registered", self.key))?;
            entry.rule = Some(rule);
        }

        self.backend
            .bind(self.key, rule)
            .wrap_err_with(|| eyre!("bind {}", self.key))?;
        debug!(pipe = %self.key, ?rule, "bound pipe");
        Ok(())
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        match self.pipes.lock() {
            Ok(mut pipes) => {
                pipes.remove(self.key.pipe);
            }
            Err(_) => warn!(pipe = %self.key, "pipe registry lock poisoned"),
        }

        if let Err(err) = self.backend.detach(self.key) {
            warn!(pipe = %self.key, ?err, "Error detaching pipe");
            return;
        }

        debug!(pipe = %self.key, "Tore down pipe");
    }
}

/// An application's view of the NIC.
pub struct Device {
    config: EnsoConfig,
    backend: Arc<dyn Backend>,
    pipes: Registry,
    notifications: NotificationChannel,
    rx_notifications: RxNotifications,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("app_id", &self.config.app_id)
            .field("pipes", &self.pipes)
            .field("notifications", &self.notifications)
            .field("rx_notifications", &self.rx_notifications.len())
            .finish()
    }
}

impl Device {
    /// Open the device behind `backend`.
    #[tracing::instrument(err, skip(backend))]
    pub fn open(backend: Arc<dyn Backend>, config: EnsoConfig) -> Result<Self> {
        config.validate().wrap_err("invalid device config")?;
        let (notifications, tx_queue) = NotificationChannel::new(config.max_pending_tx_requests)?;
        backend
            .attach_tx(tx_queue)
            .wrap_err("attach device tx queue")?;
        let (notifier, rx_notifications) = rx_notifications(MAX_PENDING_RX_NOTIFICATIONS)?;
        backend
            .attach_rx(config.app_id, notifier)
            .wrap_err("attach device rx notifications")?;

        info!(app_id = config.app_id, "device open");
        Ok(Self {
            config,
            backend,
            pipes: Default::default(),
            notifications,
            rx_notifications,
        })
    }

    pub fn config(&self) -> &EnsoConfig {
        &self.config
    }

    fn register(&self, kind: PipeKind) -> Result<(PipeKey, Binding)> {
        let id = self
            .pipes
            .lock()
            .map_err(|_| eyre!("pipe registry lock poisoned"))?
            .insert(PipeEntry { kind, rule: None });
        let key = PipeKey {
            app_id: self.config.app_id,
            pipe: id,
        };

        // from here on, dropping the binding unregisters the pipe.
        let binding = Binding {
            key,
            backend: Arc::clone(&self.backend),
            pipes: Arc::clone(&self.pipes),
        };
        Ok((key, binding))
    }

    /// Allocate a receive pipe. It receives nothing until the backend steers traffic to it.
    pub fn allocate_rx_pipe(&self) -> Result<RxPipe> {
        let (key, binding) = self.register(PipeKind::Rx)?;
        let (rx, writer) = pipe::pipe(key.pipe, &self.config.pipe_config())?;
        self.backend
            .attach(key, writer)
            .wrap_err_with(|| eyre!("attach {}", key))?;
        debug!(pipe = %key, "allocated rx pipe");
        Ok(rx.with_binding(binding))
    }

    /// Allocate a pipe whose received packets can be sent back out in place. Each such pipe
    /// gets its own notification channel.
    pub fn allocate_rx_tx_pipe(&self) -> Result<RxTxPipe> {
        let (key, binding) = self.register(PipeKind::RxTx)?;
        let (tx, tx_queue) = NotificationChannel::new(self.config.max_pending_tx_requests)?;
        let (pipe, writer) = RxTxPipe::new(key.pipe, &self.config.pipe_config(), tx)?;
        self.backend
            .attach_tx(tx_queue)
            .wrap_err_with(|| eyre!("attach tx queue of {}", key))?;
        self.backend
            .attach(key, writer)
            .wrap_err_with(|| eyre!("attach {}", key))?;
        debug!(pipe = %key, "allocated rx/tx pipe");
        Ok(pipe.with_binding(binding))
    }

    /// Live pipes, in allocation order.
    pub fn pipe_ids(&self) -> Result<Vec<PipeId>> {
        let pipes = self
            .pipes
            .lock()
            .map_err(|_| eyre!("pipe registry lock poisoned"))?;
        Ok(pipes.ids().collect())
    }

    pub fn nb_pipes(&self) -> Result<usize> {
        let pipes = self
            .pipes
            .lock()
            .map_err(|_| eyre!("pipe registry lock poisoned"))?;
        Ok(pipes.len())
    }

    /// Kind and rule of a live pipe; `None` for pipes that were torn down.
    pub fn pipe_info(&self, id: PipeId) -> Option<(PipeKind, Option<FlowRule>)> {
        let pipes = self.pipes.lock().ok()?;
        pipes.get(id).map(|e| (e.kind, e.rule))
    }

    /// Oldest pending receive notification for a live pipe, if any.
    ///
    /// Notifications for pipes torn down since they were queued are skipped.
    pub fn next_rx_notification(&self) -> Result<Option<RxNotification>> {
        let pipes = self
            .pipes
            .lock()
            .map_err(|_| eyre!("pipe registry lock poisoned"))?;
        while let Some(n) = self.rx_notifications.next_notification() {
            if pipes.contains(n.pipe) {
                return Ok(Some(n));
            }
            trace!(pipe = %n.pipe, "notification for a torn down pipe");
        }
        Ok(None)
    }

    /// The next pipe that received data, in the order pipes received it.
    ///
    /// A pipe may come up again before its earlier data was consumed, so a notified pipe can
    /// turn out to be empty by the time it is read.
    pub fn next_rx_pipe(&self) -> Result<Option<PipeId>> {
        Ok(self.next_rx_notification()?.map(|n| n.pipe))
    }

    /// Peek the next batch among `pipes`, going by receive notifications instead of polling
    /// every pipe.
    ///
    /// Notifications for pipes not in `pipes`, or whose data was already consumed, are
    /// dropped. `None` once no notification is pending.
    pub fn next_batch<'p>(&self, pipes: &'p mut [RxPipe]) -> Result<Option<Batch<'p>>> {
        while let Some(id) = self.next_rx_pipe()? {
            let idx = match pipes.iter().position(|p| p.id() == id) {
                Some(i) => i,
                None => {
                    trace!(pipe = %id, "notification for a pipe not polled here");
                    continue;
                }
            };
            if pipes[idx].bytes_available() == 0 {
                continue;
            }
            return pipes[idx].peek_batch().map(Some);
        }
        Ok(None)
    }

    /// Hand flit-aligned packets to the NIC. See [`NotificationChannel::submit`].
    pub fn send(&mut self, payload: Vec<u8>) -> Result<Submission> {
        self.notifications.submit(TxPayload::Owned(payload))
    }

    /// See [`NotificationChannel::drain_completions`].
    pub fn drain_completions(&mut self) -> u32 {
        self.notifications.drain_completions()
    }

    pub fn update_tx_head(&mut self) {
        self.notifications.update_tx_head()
    }
}
