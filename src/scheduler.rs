//! The background scheduler that periodically walks the shard tree and
//! rebuilds any leaf with pending work (spec §4.5).
//!
//! The original design spawns one goroutine per node; a tree with a
//! meaningful shard count would turn that into thousands of OS threads
//! here, so this crate runs a single scheduler thread per store instead,
//! borrowing the disconnect-on-drop gen-server shape from this crate's
//! lineage (`thread::Thread`) rather than its per-node multiplicity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{error, trace};

use crate::node::ShardNode;
use crate::schema::RecordLayout;

pub(crate) struct Scheduler {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn spawn<K>(
        root: Arc<ShardNode<K>>,
        layout: Arc<RecordLayout>,
        interval: Duration,
        warn_bytes: usize,
    ) -> Scheduler
    where
        K: crate::key::KeyComponent,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_loop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let _ = ready_tx.send(());
            while !stop_loop.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if stop_loop.load(Ordering::Relaxed) {
                    break;
                }
                trace!(target: "flatmap::scheduler", "tick");
                if let Err(err) = root.tick(&layout, warn_bytes, &[]) {
                    error!(target: "flatmap::scheduler", "tick failed: {}", err);
                }
            }
        });

        let _ = ready_rx.recv();
        Scheduler {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the scheduler thread to stop after its current tick and
    /// wait for it to exit.
    pub(crate) fn close_wait(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "flatmap::scheduler", "scheduler thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close_wait();
    }
}
