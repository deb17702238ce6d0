use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::{rc::Rc, sync::Arc};

use anyhow::Error;
use tokio::{runtime::Builder, task::LocalSet, time::sleep};

use crate::{
    conn::{Conn, ConnSeed},
    stat::ResponseLog,
};

/// Receive scratch buffer size.
pub const RECVBUF: usize = 1 << 15;
/// Stop-flag polling period [ms].
pub const WATCHDOG_MS: u64 = 10;

/// State shared by every connection owned by one worker.
///
/// Touched by exactly one thread; the scratch buffer is borrowed only
/// between suspension points, never across one.
pub struct WorkerShared {
    /// Receive scratch buffer, one per worker.
    pub buf: RefCell<Box<[u8]>>,
    pub is_running: Arc<AtomicBool>,
    /// Connections still producing traffic, across all workers.
    pub run: Arc<AtomicUsize>,
    pub rlog: Option<Arc<ResponseLog>>,
    /// Whether cookie echo is enabled.
    pub cookies: bool,
}

/// One worker thread: a single-threaded reactor driving a contiguous slice
/// of the connections.
pub struct Worker {
    id: usize,
    seeds: Vec<ConnSeed>,
    is_running: Arc<AtomicBool>,
    run: Arc<AtomicUsize>,
    rlog: Option<Arc<ResponseLog>>,
    cookies: bool,
}

impl Worker {
    pub fn new(
        id: usize,
        seeds: Vec<ConnSeed>,
        is_running: Arc<AtomicBool>,
        run: Arc<AtomicUsize>,
        rlog: Option<Arc<ResponseLog>>,
        cookies: bool,
    ) -> Self {
        Self {
            id,
            seeds,
            is_running,
            run,
            rlog,
            cookies,
        }
    }

    /// Runs the reactor until the stop flag clears.
    ///
    /// Connections run as cooperative tasks on a [`LocalSet`]; suspension
    /// points are exactly the socket readiness awaits and timers. When the
    /// watchdog observes the stop flag, the set is torn down, abandoning
    /// in-flight I/O and closing the sockets.
    pub fn run(self) -> Result<(), Error> {
        let Self {
            id,
            seeds,
            is_running,
            run,
            rlog,
            cookies,
        } = self;

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let local = LocalSet::new();

        let shared = Rc::new(WorkerShared {
            buf: RefCell::new(vec![0u8; RECVBUF + 1].into_boxed_slice()),
            is_running: is_running.clone(),
            run,
            rlog,
            cookies,
        });

        log::debug!("worker {id}: driving {} connections", seeds.len());
        for seed in seeds {
            let conn = Conn::new(seed, shared.clone());
            local.spawn_local(conn.run());
        }

        runtime.block_on(local.run_until(watchdog(is_running)));

        Ok(())
    }
}

async fn watchdog(is_running: Arc<AtomicBool>) {
    while is_running.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(WATCHDOG_MS)).await;
    }
}
