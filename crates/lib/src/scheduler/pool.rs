//! The worker pool and its completion queue.
//!
//! Workers pull [`WorkItem`]s from a shared channel, run the command, and
//! post a [`Completion`] onto a bounded queue read by the script thread.
//! The per-job outstanding counter is decremented (release) before the
//! completion is sent, so the script thread never observes a message whose
//! work is still counted as pending.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::command::{self, CommandOutcome, CommandSpec};

/// Which piece of script work a command belongs to: a traversal job (by its
/// schedule index) or the ambient scope outside any traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobToken {
  Ambient,
  Node(u32),
}

pub struct WorkItem {
  pub token: JobToken,
  pub outstanding: Arc<AtomicU32>,
  pub spec: CommandSpec,
}

pub struct Completion {
  pub token: JobToken,
  pub outcome: CommandOutcome,
}

const COMPLETION_QUEUE_DEPTH: usize = 1024;

pub struct WorkerPool {
  work_tx: Option<mpsc::Sender<WorkItem>>,
  completions: Receiver<Completion>,
  workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn new(jobs: usize) -> WorkerPool {
    let jobs = jobs.max(1);
    let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (completion_tx, completions) = mpsc::sync_channel(COMPLETION_QUEUE_DEPTH);

    let workers = (0..jobs)
      .map(|index| {
        let work_rx = work_rx.clone();
        let completion_tx: SyncSender<Completion> = completion_tx.clone();
        std::thread::Builder::new()
          .name(format!("forge-worker-{index}"))
          .spawn(move || worker_loop(work_rx, completion_tx))
          .expect("failed to spawn worker thread")
      })
      .collect();

    debug!(workers = jobs, "worker pool started");
    WorkerPool {
      work_tx: Some(work_tx),
      completions,
      workers,
    }
  }

  pub fn submit(&self, item: WorkItem) {
    if let Some(work_tx) = &self.work_tx {
      // Send only fails when every worker has exited, which only happens
      // on shutdown.
      let _ = work_tx.send(item);
    }
  }

  /// Blocking pop; `None` when the pool has shut down.
  pub fn recv(&self) -> Option<Completion> {
    self.completions.recv().ok()
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Result<Completion, RecvTimeoutError> {
    self.completions.recv_timeout(timeout)
  }

  pub fn try_recv(&self) -> Option<Completion> {
    match self.completions.try_recv() {
      Ok(completion) => Some(completion),
      Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    // Closing the work channel lets the workers drain and exit.
    self.work_tx.take();
    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
  }
}

fn worker_loop(work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>, completion_tx: SyncSender<Completion>) {
  loop {
    let item = work_rx.lock().unwrap().recv();
    let Ok(item) = item else {
      break;
    };
    let outcome = command::run(&item.spec);
    // Decrement before sending: when the script thread sees the message,
    // the counter already reflects it.
    item.outstanding.fetch_sub(1, Ordering::Release);
    if completion_tx.send(Completion {
      token: item.token,
      outcome,
    })
    .is_err()
    {
      break;
    }
  }
}
