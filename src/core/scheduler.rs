// src/core/scheduler.rs

//! Deferred execution of small cleanup tasks.

use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once `delay` has elapsed. Tasks scheduled separately carry no
/// ordering guarantee relative to each other.
pub trait Scheduler: Send + Sync {
    fn execute_after_delay(&self, task: Task, delay: Duration);
}

/// The default scheduler, backed by the ambient tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn execute_after_delay(&self, task: Task, delay: Duration) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    task();
                });
            }
            Err(_) => {
                debug!("No tokio runtime available, running deferred task on a thread");
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    task();
                });
            }
        }
    }
}
