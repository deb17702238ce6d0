use core::{cell::UnsafeCell, time::Duration};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

/// Microseconds since the Epoch.
#[inline]
pub fn time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Per-connection counters.
///
/// Written only by the worker thread owning the connection; read by the
/// coordinator after the workers are joined, so plain cells are enough and
/// no atomics are paid for on the hot path.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// When this connection was first attempted.
    start: UnsafeCell<u64>,
    /// When the socket first became writable.
    writeable: UnsafeCell<u64>,
    /// When the socket was first writable just before a request was issued.
    established: UnsafeCell<u64>,
    /// When the first byte was successfully written after connecting.
    handshake: UnsafeCell<u64>,
    /// Times connected, initial connection plus reconnections.
    connections: UnsafeCell<u64>,
    /// Requests sent over the currently established connection.
    reqs: UnsafeCell<u64>,
    /// Requests sent over this connection in total.
    reqs_total: UnsafeCell<u64>,
    written_total: UnsafeCell<u64>,
    read_total: UnsafeCell<u64>,
    err_conn: UnsafeCell<u64>,
    err_status: UnsafeCell<u64>,
    err_parser: UnsafeCell<u64>,
}

unsafe impl Sync for ConnStats {}

macro_rules! getter {
    ($name:ident) => {
        #[inline]
        pub fn $name(&self) -> u64 {
            unsafe { *self.$name.get() }
        }
    };
}

impl ConnStats {
    getter!(start);
    getter!(writeable);
    getter!(established);
    getter!(handshake);
    getter!(connections);
    getter!(reqs);
    getter!(reqs_total);
    getter!(written_total);
    getter!(read_total);
    getter!(err_conn);
    getter!(err_status);
    getter!(err_parser);

    /// Stamps the first connection attempt. Later calls are no-ops.
    #[inline]
    pub fn stamp_start(&self) {
        let cell = self.start.get();
        unsafe {
            if *cell == 0 {
                *cell = time_us();
            }
        }
    }

    #[inline]
    pub fn stamp_writeable(&self) {
        let cell = self.writeable.get();
        unsafe {
            if *cell == 0 {
                *cell = time_us();
            }
        }
    }

    #[inline]
    pub fn stamp_established(&self) {
        let cell = self.established.get();
        unsafe {
            if *cell == 0 {
                *cell = time_us();
            }
        }
    }

    #[inline]
    pub fn stamp_handshake(&self) {
        let cell = self.handshake.get();
        unsafe {
            if *cell == 0 {
                *cell = time_us();
            }
        }
    }

    /// Counts an established connection and resets the per-connection
    /// request counter.
    #[inline]
    pub fn on_connect(&self) {
        unsafe {
            *self.connections.get() += 1;
            *self.reqs.get() = 0;
        }
    }

    /// Counts a completed response.
    #[inline]
    pub fn on_response(&self) {
        unsafe {
            *self.reqs.get() += 1;
            *self.reqs_total.get() += 1;
        }
    }

    #[inline]
    pub fn on_send(&self, n: u64) {
        unsafe { *self.written_total.get() += n };
    }

    #[inline]
    pub fn on_recv(&self, n: u64) {
        unsafe { *self.read_total.get() += n };
    }

    #[inline]
    pub fn on_err_conn(&self) {
        unsafe { *self.err_conn.get() += 1 };
    }

    #[inline]
    pub fn on_err_status(&self) {
        unsafe { *self.err_status.get() += 1 };
    }

    #[inline]
    pub fn on_err_parser(&self) {
        unsafe { *self.err_parser.get() += 1 };
    }
}

/// Post-join aggregate over every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub elapsed: Duration,
    pub reqs: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub err_conn: u64,
    pub err_status: u64,
    pub err_parser: u64,
}

impl Summary {
    pub fn collect(stats: &[Arc<ConnStats>], elapsed: Duration) -> Self {
        let mut m = Self { elapsed, ..Self::default() };

        for s in stats {
            m.reqs += s.reqs_total();
            m.sent_bytes += s.written_total();
            m.recv_bytes += s.read_total();
            m.err_conn += s.err_conn();
            m.err_status += s.err_status();
            m.err_parser += s.err_parser();
        }

        m
    }

    /// Renders the final report. Safe to call more than once.
    pub fn render<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let secs = self.elapsed.as_secs_f64();
        let rate = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };

        writeln!(w, "Time: {secs:.2}s")?;
        writeln!(
            w,
            "Sent: {}, {}/s",
            format_bytes(self.sent_bytes as f64),
            format_bytes(rate(self.sent_bytes))
        )?;
        writeln!(
            w,
            "Recv: {}, {}/s",
            format_bytes(self.recv_bytes as f64),
            format_bytes(rate(self.recv_bytes))
        )?;
        writeln!(w, "Hits: {}, {:.2}/s", self.reqs, rate(self.reqs))?;
        if self.err_conn != 0 || self.err_status != 0 || self.err_parser != 0 {
            writeln!(
                w,
                "Errors connection: {}, status: {}, parser: {}",
                self.err_conn, self.err_status, self.err_parser
            )?;
        }

        Ok(())
    }
}

/// Formats a byte quantity with binary (1024) prefixes.
pub fn format_bytes(mut n: f64) -> String {
    const SUFFIX: [&str; 9] = ["B", "kiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];
    let base = 1024.0;

    let mut idx = 0;
    while n > base && idx + 1 < SUFFIX.len() {
        n /= base;
        idx += 1;
    }

    format!("{n:.2}{}", SUFFIX[idx])
}

/// Per-response record sink, one line per completed response.
///
/// Falls back to stdout when the requested file cannot be opened.
pub struct ResponseLog {
    w: Mutex<Box<dyn Write + Send>>,
}

impl ResponseLog {
    pub fn open(path: &Path) -> Self {
        let w: Box<dyn Write + Send> = match File::create(path) {
            Ok(f) => Box::new(BufWriter::new(f)),
            Err(err) => {
                log::error!(
                    "cannot open file `{}' for writing, using stdout: {err}",
                    path.display()
                );
                Box::new(io::stdout())
            }
        };

        Self { w: Mutex::new(w) }
    }

    /// Appends one record: round-trip time, HTTP status, connection id.
    pub fn record(&self, elapsed_us: u64, status: u16, conn: usize) {
        if let Ok(mut w) = self.w.lock() {
            let _ = writeln!(w, "{elapsed_us} {status} {conn}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_formatting_uses_binary_prefixes() {
        assert_eq!(format_bytes(0.0), "0.00B");
        assert_eq!(format_bytes(512.0), "512.00B");
        assert_eq!(format_bytes(2048.0), "2.00kiB");
        assert_eq!(format_bytes(1024.0 * 1024.0 * 3.5), "3.50MiB");
    }

    #[test]
    fn summary_sums_connections() {
        let a = Arc::new(ConnStats::default());
        let b = Arc::new(ConnStats::default());

        a.on_response();
        a.on_response();
        a.on_send(100);
        a.on_recv(50);
        a.on_err_status();
        b.on_response();
        b.on_send(10);
        b.on_err_conn();

        let summary = Summary::collect(&[a, b], Duration::from_secs(2));
        assert_eq!(summary.reqs, 3);
        assert_eq!(summary.sent_bytes, 110);
        assert_eq!(summary.recv_bytes, 50);
        assert_eq!(summary.err_conn, 1);
        assert_eq!(summary.err_status, 1);
        assert_eq!(summary.err_parser, 0);
    }

    #[test]
    fn render_is_repeatable() {
        let summary = Summary {
            elapsed: Duration::from_secs(1),
            reqs: 10,
            sent_bytes: 1000,
            recv_bytes: 2000,
            err_conn: 1,
            ..Summary::default()
        };

        let mut first = Vec::new();
        let mut second = Vec::new();
        summary.render(&mut first).unwrap();
        summary.render(&mut second).unwrap();

        assert_eq!(first, second);
        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("Hits: 10, 10.00/s"));
        assert!(text.contains("Errors connection: 1, status: 0, parser: 0"));
    }

    #[test]
    fn stamps_keep_the_first_value() {
        let stats = ConnStats::default();

        stats.stamp_start();
        let first = stats.start();
        assert_ne!(first, 0);
        stats.stamp_start();
        assert_eq!(stats.start(), first);
    }

    #[test]
    fn connect_resets_the_keep_alive_counter() {
        let stats = ConnStats::default();

        stats.on_connect();
        stats.on_response();
        stats.on_response();
        assert_eq!(stats.reqs(), 2);
        assert_eq!(stats.reqs_total(), 2);

        stats.on_connect();
        assert_eq!(stats.reqs(), 0);
        assert_eq!(stats.reqs_total(), 2);
        assert_eq!(stats.connections(), 2);
    }
}
