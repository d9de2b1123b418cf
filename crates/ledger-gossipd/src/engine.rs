//! Per-channel state engine
//!
//! A channel engine owns one [`PayloadBuffer`] and four tasks sharing it:
//! dissemination handler, pull handler, commit loop and anti-entropy loop.
//! Channels are fully independent of each other.

use crate::anti_entropy::AntiEntropy;
use crate::buffer::{BufferError, PayloadBuffer};
use crate::commit::CommitLoop;
use crate::config::StateConfig;
use crate::dissemination::DisseminationHandler;
use crate::metrics::StateMetrics;
use crate::ports::{Committer, Gossip};
use crate::pull::PullHandler;
use ledger_gossip_core::{ChannelId, Payload, PeerId};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Engine errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Irrecoverable commit failure on {channel}: {reason}")]
    CommitFatal { channel: ChannelId, reason: String },
    #[error("Pull of block {from_seq} from {peer} timed out")]
    PullTimeout { peer: PeerId, from_seq: u64 },
    #[error("Channel initialization failed: {0}")]
    Initialization(String),
    #[error("Channel already running: {0}")]
    AlreadyRunning(ChannelId),
    #[error("{task} task of {channel} failed: {reason}")]
    TaskFailed {
        channel: ChannelId,
        task: Task,
        reason: String,
    },
}

/// Background tasks of a channel engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Commit,
    Dissemination,
    Pull,
    AntiEntropy,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::Commit => "commit",
            Task::Dissemination => "dissemination",
            Task::Pull => "pull",
            Task::AntiEntropy => "anti-entropy",
        };
        f.write_str(name)
    }
}

type TaskExit = (Task, Result<(), EngineError>);

/// Lifecycle of a channel engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Starts channel engines
pub struct ChannelEngine;

impl ChannelEngine {
    /// Read the initial height, build the buffer and spawn the channel's tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        channel: ChannelId,
        config: &StateConfig,
        committer: Arc<dyn Committer>,
        gossip: Arc<dyn Gossip>,
        metrics: &StateMetrics,
    ) -> Result<ChannelHandle, EngineError> {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Initializing);
        let status_tx = Arc::new(status_tx);

        let height = committer
            .height()
            .map_err(|e| EngineError::Initialization(format!("reading height: {}", e)))?;

        let metrics = metrics.channel(&channel);
        metrics.height.set(height as f64);
        let buffer = Arc::new(PayloadBuffer::new(
            config.buffer_capacity,
            height,
            metrics.clone(),
        ));
        let (height_tx, height_rx) = watch::channel(height);
        let height_tx = Arc::new(height_tx);
        let cancel = CancellationToken::new();

        let broadcast_rx = gossip.subscribe_broadcast(&channel);
        let pull_rx = gossip.subscribe_pull(&channel);

        let commit = CommitLoop::new(
            channel.clone(),
            committer.clone(),
            buffer.clone(),
            metrics,
            height_tx,
            config.commit_tick,
        );
        let dissemination =
            DisseminationHandler::new(channel.clone(), buffer.clone(), config.max_block_distance);
        let pull = PullHandler::new(
            channel.clone(),
            committer.clone(),
            gossip.clone(),
            buffer.clone(),
            config.batch_size,
        );
        let anti_entropy = AntiEntropy::new(
            channel.clone(),
            committer,
            gossip,
            buffer.clone(),
            config.clone(),
        );

        let mut tasks = JoinSet::new();
        spawn_task(&mut tasks, &channel, Task::Commit, commit.run(cancel.clone()));
        let token = cancel.clone();
        spawn_task(&mut tasks, &channel, Task::Dissemination, async move {
            dissemination.run(broadcast_rx, token).await;
            Ok(())
        });
        let token = cancel.clone();
        spawn_task(&mut tasks, &channel, Task::Pull, async move {
            pull.run(pull_rx, token).await;
            Ok(())
        });
        let token = cancel.clone();
        spawn_task(&mut tasks, &channel, Task::AntiEntropy, async move {
            anti_entropy.run(token).await;
            Ok(())
        });

        let fatal = Arc::new(Mutex::new(None));
        status_tx.send_replace(ChannelStatus::Running);
        info!("Channel {} running at height {}", channel, height);

        tokio::spawn(supervise(
            channel.clone(),
            tasks,
            cancel.clone(),
            buffer.clone(),
            status_tx.clone(),
            fatal.clone(),
        ));

        Ok(ChannelHandle {
            channel,
            buffer,
            status_tx,
            status_rx,
            height_rx,
            cancel,
            fatal,
        })
    }
}

/// Spawn `future` and report its exit, a panic included, as a [`TaskExit`]
fn spawn_task<F>(tasks: &mut JoinSet<TaskExit>, channel: &ChannelId, task: Task, future: F)
where
    F: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    let channel = channel.clone();
    tasks.spawn(async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::TaskFailed {
                channel,
                task,
                reason: e.to_string(),
            }),
        };
        (task, result)
    });
}

/// Waits for the first task to end. Unless the channel was cancelled, that
/// exit is recorded as the error stopping the channel. The remaining tasks are
/// then cancelled and awaited before buffer state is released.
async fn supervise(
    channel: ChannelId,
    mut tasks: JoinSet<TaskExit>,
    cancel: CancellationToken,
    buffer: Arc<PayloadBuffer>,
    status_tx: Arc<watch::Sender<ChannelStatus>>,
    fatal: Arc<Mutex<Option<EngineError>>>,
) {
    match tasks.join_next().await {
        Some(Ok(exit)) => {
            if let Some(e) = task_failure(&channel, exit, &cancel) {
                error!("Stopping channel {}: {}", channel, e);
                *fatal.lock() = Some(e);
            }
        }
        Some(Err(e)) => warn!("Supervision of {} interrupted: {}", channel, e),
        None => {}
    }

    status_tx.send_replace(ChannelStatus::ShuttingDown);
    cancel.cancel();
    while let Some(exit) = tasks.join_next().await {
        match exit {
            Ok((_, Ok(()))) => {}
            Ok((task, Err(e))) => warn!("{} task of {} ended with: {}", task, channel, e),
            Err(e) => warn!("Task of {} failed during shutdown: {}", channel, e),
        }
    }

    buffer.close();
    status_tx.send_replace(ChannelStatus::Stopped);
    info!("Channel {} stopped", channel);
}

/// Error to record for a task exit, `None` for a requested stop
fn task_failure(
    channel: &ChannelId,
    exit: TaskExit,
    cancel: &CancellationToken,
) -> Option<EngineError> {
    match exit {
        (_, Err(e)) => Some(e),
        (_, Ok(())) if cancel.is_cancelled() => None,
        (task, Ok(())) => Some(EngineError::TaskFailed {
            channel: channel.clone(),
            task,
            reason: "exited while the channel was running".to_string(),
        }),
    }
}

/// Handle to a running channel engine
#[derive(Clone)]
pub struct ChannelHandle {
    channel: ChannelId,
    buffer: Arc<PayloadBuffer>,
    status_tx: Arc<watch::Sender<ChannelStatus>>,
    status_rx: watch::Receiver<ChannelStatus>,
    height_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<EngineError>>>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel)
            .field("status", &self.status())
            .field("height", &self.height())
            .finish()
    }
}

impl ChannelHandle {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_rx.borrow()
    }

    /// Height reached by the commit loop
    pub fn height(&self) -> u64 {
        *self.height_rx.borrow()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.size()
    }

    /// Feed a payload into the buffer as if it had been disseminated
    pub fn add_payload(&self, payload: Payload) -> Result<usize, BufferError> {
        self.buffer.push(payload)
    }

    /// Receiver of the committed height, updated after every commit
    pub fn subscribe_height(&self) -> watch::Receiver<u64> {
        self.height_rx.clone()
    }

    /// Wait until the committed height reaches `height`; false on timeout or stop
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let mut rx = self.height_rx.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|h| *h >= height)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Error that stopped the channel, if any
    pub fn error(&self) -> Option<EngineError> {
        self.fatal.lock().clone()
    }

    /// Wait for the channel to reach `Stopped`, returning the error that stopped it
    pub async fn stopped(&self) -> Option<EngineError> {
        let mut rx = self.status_rx.clone();
        let _ = rx.wait_for(|s| *s == ChannelStatus::Stopped).await;
        self.error()
    }

    /// Cancel all tasks and wait until they have exited
    pub async fn shutdown(&self) {
        if self.status() == ChannelStatus::Running {
            self.status_tx.send_replace(ChannelStatus::ShuttingDown);
        }
        self.cancel.cancel();
        self.stopped().await;
    }
}
