//! Worker and scheduler threads.

use super::{Migrator, Task};
use crate::error::TierResult;
use crate::metrics::{
    MIGRATIONS_ABORTED, MIGRATIONS_DEMOTED, MIGRATIONS_FAILED, MIGRATIONS_PROMOTED,
};
use crate::tier::Status;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, select};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Running scheduler and worker threads. Stops them when dropped.
pub struct MigratorHandle {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MigratorHandle {
    /// Signal every thread and wait for it to exit.
    ///
    /// A migration that is copying finishes (or aborts on delete) first.
    pub fn stop(&mut self) {
        // disconnecting the channel is the signal
        if self.stop.take().is_none() {
            return;
        }
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("unnamed").to_string();
            if thread.join().is_err() {
                error!(thread = %name, "migration thread panicked");
            }
        }
        info!("migrator stopped");
    }

    /// Number of threads started.
    pub fn threads(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for MigratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Migrator {
    /// Spawn the worker pool and the scheduler thread.
    pub fn start(self: &Arc<Self>) -> TierResult<MigratorHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let mut handle = MigratorHandle {
            stop: Some(stop_tx),
            threads: Vec::with_capacity(self.config.threads + 1),
        };

        if self.config.threads == 0 {
            warn!("no migration workers configured, queued tasks will not run");
        }

        for worker_id in 0..self.config.threads {
            let migrator = self.clone();
            let stop = stop_rx.clone();
            let thread = thread::Builder::new()
                .name(format!("tier-migrator-{}", worker_id))
                .spawn(move || migrator.work(worker_id, stop))?;
            handle.threads.push(thread);
        }

        let migrator = self.clone();
        let thread = thread::Builder::new()
            .name("tier-scheduler".to_string())
            .spawn(move || migrator.schedule(stop_rx))?;
        handle.threads.push(thread);

        info!(
            threads = self.config.threads,
            threshold = self.config.threshold,
            readmit_threshold = self.config.readmit_threshold,
            "migrator started"
        );
        Ok(handle)
    }

    fn work(&self, worker_id: usize, stop: Receiver<()>) {
        debug!(worker_id, "migration worker started");
        loop {
            if let Err(TryRecvError::Disconnected) = stop.try_recv() {
                break;
            }
            if let Some(task) = self.next_task() {
                self.run_task(task);
                continue;
            }
            select! {
                recv(stop) -> _ => break,
                recv(self.demote_rx) -> task => if let Ok(task) = task {
                    self.run_task(task);
                },
                recv(self.promote_rx) -> task => if let Ok(task) = task {
                    self.run_task(task);
                },
            }
        }
        debug!(worker_id, "migration worker stopped");
    }

    fn schedule(&self, stop: Receiver<()>) {
        let mut wait = self.config.initial_delay;
        loop {
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            self.schedule_once();
            wait = self.config.interval;
        }
        debug!("scheduler stopped");
    }

    /// Drive one task and return its speculation to the accounting.
    pub(crate) fn run_task(&self, task: Task) {
        let delta = task.pending_delta();
        let Task {
            channel,
            target,
            size,
        } = task;

        let result = channel.set_mode(target);
        channel.set_status(Status::Initializing);
        self.usage.adjust_pending(-delta);

        match result {
            Ok(true) => {
                if target.is_home() {
                    MIGRATIONS_PROMOTED.increment();
                } else {
                    MIGRATIONS_DEMOTED.increment();
                }
            }
            Ok(false) => {
                MIGRATIONS_ABORTED.increment();
                debug!(channel = %channel, target = %target, size, "migration did not proceed");
            }
            Err(e) => {
                MIGRATIONS_FAILED.increment();
                error!(channel = %channel, target = %target, size, error = %e, "migration failed");
            }
        }
    }
}
