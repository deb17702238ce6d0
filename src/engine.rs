use core::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    sync::Arc,
    thread::{self, Builder},
    time::Instant,
};

use anyhow::Error;
use bytes::Bytes;

use crate::{
    cfg::{Config, Scheme},
    conn::ConnSeed,
    mcg::Mcg,
    stat::{ConnStats, ResponseLog, Summary},
    tls::TlsContext,
    worker::{Worker, WATCHDOG_MS},
};

/// The coordinator: expands templates into client instances, fans the
/// instances out over worker threads with a staggered start, waits out the
/// deadline and aggregates the statistics after joining.
pub struct Engine {
    cfg: Config,
    seeds: Vec<ConnSeed>,
    stats: Vec<Arc<ConnStats>>,
    is_running: Arc<AtomicBool>,
    run: Arc<AtomicUsize>,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, Error> {
        // One process-wide TLS context, initialized before any worker
        // starts.
        let tls = if cfg.templates.iter().any(|t| t.scheme == Scheme::Https) {
            Some(Arc::new(TlsContext::new(cfg.ssl_version)?))
        } else {
            None
        };

        let mut seeds = Vec::new();
        let mut stats = Vec::new();
        for tmpl in &cfg.templates {
            for clone in 0..tmpl.clients {
                let conn_stats = Arc::new(ConnStats::default());
                let mut prng = Mcg::new(body_seed(tmpl.id, clone));
                let payload = tmpl.chunk_plan.map(|plan| {
                    let mut buf = vec![0u8; plan.buffer_len()];
                    prng.fill(&mut buf);
                    Bytes::from(buf)
                });

                stats.push(conn_stats.clone());
                seeds.push(ConnSeed {
                    id: seeds.len(),
                    tmpl: tmpl.clone(),
                    stats: conn_stats,
                    payload,
                    prng,
                    tls: tls.clone(),
                });
            }
        }

        Ok(Self {
            cfg,
            seeds,
            stats,
            is_running: Arc::new(AtomicBool::new(true)),
            run: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Handle for requesting a cooperative stop, e.g. from a signal
    /// handler. Workers observe the change within one watchdog tick.
    #[inline]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.is_running.clone()
    }

    /// Per-connection counters, readable after [`run`](Self::run) returns.
    #[inline]
    pub fn conn_stats(&self) -> &[Arc<ConnStats>] {
        &self.stats
    }

    pub fn run(self) -> Result<Summary, Error> {
        let total = self.seeds.len();
        let mut threads = self.cfg.threads;
        if threads > total {
            log::info!(
                "threads ({threads}) > connections ({total}): \
                 lowering the number of threads to {total}"
            );
            threads = total;
        }

        self.run.store(total, Ordering::SeqCst);

        let rlog = self
            .cfg
            .response_file
            .as_deref()
            .map(|p| Arc::new(ResponseLog::open(p)));

        let stagger = if self.cfg.ramp_up.is_zero() {
            Duration::ZERO
        } else {
            self.cfg.ramp_up / threads as u32
        };

        let start = Instant::now();
        let mut handles = Vec::with_capacity(threads);
        let mut seeds = self.seeds;
        for (idx, take) in slice_sizes(total, threads).into_iter().enumerate() {
            let slice: Vec<ConnSeed> = seeds.drain(..take).collect();
            let worker = Worker::new(
                idx,
                slice,
                self.is_running.clone(),
                self.run.clone(),
                rlog.clone(),
                self.cfg.cookies,
            );

            let handle = Builder::new()
                .name(format!("volley:{idx:02}"))
                .spawn(move || worker.run())?;
            handles.push(handle);

            if !stagger.is_zero() && idx + 1 < threads {
                thread::sleep(stagger);
            }
        }

        // Wait out the deadline; leave early once every connection reached
        // its request cap or a signal asked for a stop.
        let deadline = start + self.cfg.duration;
        loop {
            if !self.is_running.load(Ordering::SeqCst) || self.run.load(Ordering::Acquire) == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(WATCHDOG_MS)));
        }
        self.is_running.store(false, Ordering::SeqCst);

        for handle in handles {
            handle.join().expect("no self join")?;
        }

        Ok(Summary::collect(&self.stats, start.elapsed()))
    }
}

/// Distinct generator seed per template and clone, so replicated clients
/// produce different body streams while staying reproducible run to run.
#[inline]
fn body_seed(template: usize, clone: usize) -> u64 {
    ((template as u64) << 32) | clone as u64
}

/// Splits `total` connections over `threads` workers.
///
/// Slices differ in length by at most one, larger ones first, so no worker
/// idles while another drives two extra connections.
pub fn slice_sizes(total: usize, threads: usize) -> Vec<usize> {
    let base = total / threads;
    let rem = total % threads;

    (0..threads)
        .map(|idx| if idx < rem { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_cover_every_connection() {
        for total in 1..50 {
            for threads in 1..=total {
                let sizes = slice_sizes(total, threads);
                assert_eq!(sizes.len(), threads);
                assert_eq!(sizes.iter().sum::<usize>(), total);
                assert!(sizes.iter().all(|&s| s > 0));
            }
        }
    }

    #[test]
    fn eight_connections_over_three_workers() {
        assert_eq!(slice_sizes(8, 3), vec![3, 3, 2]);
    }

    #[test]
    fn even_split_stays_even() {
        assert_eq!(slice_sizes(8, 4), vec![2, 2, 2, 2]);
    }

    #[test]
    fn clone_seeds_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for tmpl in 0..4 {
            for clone in 0..4 {
                assert!(seen.insert(body_seed(tmpl, clone)));
            }
        }
    }
}
