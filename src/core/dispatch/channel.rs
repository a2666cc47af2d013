// src/core/dispatch/channel.rs

//! A pausable FIFO of message dispatches.

use crate::core::commands::MessageDispatch;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<MessageDispatch>,
    running: bool,
    closed: bool,
}

/// Queue shared by a producer side (routing, redelivery) and a consumer side
/// (the delivery loop or a blocking `receive`).
///
/// Stopping the channel keeps its contents; only [`clear`](Self::clear) and
/// [`remove_all`](Self::remove_all) discard them. A closed channel drops
/// whatever is pushed into it.
#[derive(Debug, Default)]
pub struct MessageDispatchChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl MessageDispatchChannel {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn enqueue(&self, dispatch: MessageDispatch) {
        {
            let mut state = self.state.lock();
            if state.closed {
                trace!("Dropping dispatch pushed into a closed channel");
                return;
            }
            state.queue.push_back(dispatch);
        }
        self.notify.notify_waiters();
    }

    pub fn enqueue_first(&self, dispatch: MessageDispatch) {
        {
            let mut state = self.state.lock();
            if state.closed {
                trace!("Dropping dispatch pushed into a closed channel");
                return;
            }
            state.queue.push_front(dispatch);
        }
        self.notify.notify_waiters();
    }

    /// Puts `dispatches` ahead of everything queued, keeping their order.
    pub fn requeue_front(&self, dispatches: Vec<MessageDispatch>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                trace!(
                    "Dropping {} dispatches requeued into a closed channel",
                    dispatches.len()
                );
                return;
            }
            for dispatch in dispatches.into_iter().rev() {
                state.queue.push_front(dispatch);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.running = true;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.state.lock().running = false;
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.running = false;
        }
        self.notify.notify_waiters();
    }

    /// Wakes every waiter so it re-checks the queue.
    pub fn wakeup(&self) {
        self.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Takes the head of the queue if the channel is running.
    pub fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut state = self.state.lock();
        if state.closed || !state.running {
            return None;
        }
        state.queue.pop_front()
    }

    /// Waits for the next dispatch.
    ///
    /// Returns `None` when the channel closes or `timeout` elapses first. A
    /// `None` timeout waits indefinitely.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        // A timeout too large to represent waits indefinitely.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let notified = self.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.running {
                    if let Some(dispatch) = state.queue.pop_front() {
                        return Some(dispatch);
                    }
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn clear(&self) {
        self.state.lock().queue.clear();
    }

    /// Drains the queue regardless of the running flag.
    pub fn remove_all(&self) -> Vec<MessageDispatch> {
        self.state.lock().queue.drain(..).collect()
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
