// src/core/dispatch/executor.rs

//! The per-session delivery loop.

use super::channel::MessageDispatchChannel;
use crate::core::commands::MessageDispatch;
use crate::core::errors::{ClientError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The receiving end of a [`DispatchExecutor`].
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Delivers one routed dispatch.
    async fn dispatch(&self, dispatch: MessageDispatch);

    /// Offers work that is not in the executor's queue, such as messages a
    /// consumer buffered before a listener was attached. Returns `true` if
    /// anything was delivered.
    async fn iterate(&self) -> bool {
        false
    }
}

/// A FIFO of dispatches drained by one tokio task.
///
/// The task is spawned on the first [`start`](Self::start) and lives until
/// [`close`](Self::close) or until its target is dropped. Stopping pauses
/// delivery without discarding anything queued.
pub struct DispatchExecutor {
    channel: Arc<MessageDispatchChannel>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DispatchExecutor {
    fn default() -> Self {
        Self {
            channel: Arc::new(MessageDispatchChannel::new()),
            task: Mutex::new(None),
        }
    }
}

impl DispatchExecutor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resumes delivery to `target`, spawning the loop if needed.
    pub fn start(&self, target: Weak<dyn Dispatcher>) -> Result<()> {
        if self.channel.is_closed() {
            return Err(ClientError::closed("dispatch executor"));
        }
        {
            let mut task = self.task.lock();
            if task.is_none() {
                let handle = Handle::try_current().map_err(|_| {
                    ClientError::IllegalState(
                        "dispatch requires a running tokio runtime".to_string(),
                    )
                })?;
                let channel = Arc::clone(&self.channel);
                *task = Some(handle.spawn(run_loop(channel, target)));
            }
        }
        self.channel.start();
        Ok(())
    }

    pub fn stop(&self) {
        self.channel.stop();
    }

    /// Stops the loop for good. Queued dispatches are dropped.
    pub fn close(&self) {
        self.channel.close();
        self.channel.clear();
        // The loop may be the caller (a listener closing its own session), so
        // it is left to observe the closed flag rather than awaited here.
        self.task.lock().take();
    }

    pub fn execute(&self, dispatch: MessageDispatch) {
        self.channel.enqueue(dispatch);
    }

    pub fn execute_first(&self, dispatch: MessageDispatch) {
        self.channel.enqueue_first(dispatch);
    }

    /// Requeues `unconsumed` ahead of the pending queue, preserving its order.
    pub fn redispatch(&self, unconsumed: Vec<MessageDispatch>) {
        trace!("Redispatching {} messages", unconsumed.len());
        self.channel.requeue_front(unconsumed);
    }

    /// Forces the loop to re-check its queue and targets.
    pub fn wakeup(&self) {
        self.channel.wakeup();
    }

    pub fn clear(&self) -> Vec<MessageDispatch> {
        self.channel.remove_all()
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_running()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }
}

async fn run_loop(channel: Arc<MessageDispatchChannel>, target: Weak<dyn Dispatcher>) {
    debug!("Dispatch loop started");
    loop {
        let notified = channel.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if channel.is_closed() {
            break;
        }
        let Some(dispatcher) = target.upgrade() else {
            break;
        };

        if let Some(dispatch) = channel.dequeue_no_wait() {
            dispatcher.dispatch(dispatch).await;
            continue;
        }
        if channel.is_running() && dispatcher.iterate().await {
            continue;
        }
        drop(dispatcher);

        notified.await;
    }
    debug!("Dispatch loop finished");
}
