use core::{sync::atomic::Ordering, time::Duration};
use std::{io, rc::Rc, sync::Arc, time::Instant};

use bytes::Bytes;
use tokio::time::sleep;

use crate::{
    cfg::{Scheme, Template},
    mcg::Mcg,
    request::{chunk_frame, BodySpec, CHUNK_TERMINATOR},
    response::{ParseError, ResponseParser},
    stat::ConnStats,
    tls::TlsContext,
    transport::{self, Transport},
    worker::WorkerShared,
};

/// Delay before retrying a failed connect [ms].
pub const CONNECT_RETRY_MS: u64 = 100;

/// Decides whether the next request must carry `Connection: close`.
///
/// That is the case for the last request before a keep-alive rollover, for
/// the last request the connection will ever send, and for templates
/// configured to close after every request.
#[inline]
pub fn next_is_cclose(
    reqs: u64,
    reqs_total: u64,
    keep_alive_reqs: u64,
    reqs_max: u64,
    cclose: bool,
) -> bool {
    cclose
        || (keep_alive_reqs > 0 && reqs + 1 >= keep_alive_reqs)
        || (reqs_max > 0 && reqs_total + 1 >= reqs_max)
}

/// Everything the coordinator prepares for one client instance.
///
/// Shipped into the owning worker thread, which turns it into a live
/// [`Conn`]. The request images stay shared through the template `Arc`; the
/// payload buffer is per instance, filled from a per-instance generator
/// seed.
pub struct ConnSeed {
    pub id: usize,
    pub tmpl: Arc<Template>,
    pub stats: Arc<ConnStats>,
    /// Random-body payload buffer.
    pub payload: Option<Bytes>,
    /// Generator state left over after filling the payload; drives delay
    /// and ramp-up draws.
    pub prng: Mcg,
    pub tls: Option<Arc<TlsContext>>,
}

/// One live client connection, driven as a cooperative task on its worker's
/// reactor.
pub struct Conn {
    id: usize,
    tmpl: Arc<Template>,
    stats: Arc<ConnStats>,
    payload: Option<Bytes>,
    prng: Mcg,
    tls: Option<Arc<TlsContext>>,
    shared: Rc<WorkerShared>,
    /// Cookies received from and echoed back to the server.
    jar: Vec<String>,
    /// Whether the current request is the close variant.
    header_cclose: bool,
    /// Bytes of the current request emitted so far.
    written: u64,
    /// Bytes of `written` that were chunked-encoding framing.
    written_overhead: u64,
    /// Bytes of the current body chunk still to flush after a partial write.
    body_unsent: u64,
    /// Offset into the payload buffer the next flush resumes from.
    body_offset: u64,
    /// Bytes of the current response consumed so far.
    read: u64,
}

enum ReadError {
    Io(io::Error),
    Parser(ParseError),
}

impl Conn {
    pub fn new(seed: ConnSeed, shared: Rc<WorkerShared>) -> Self {
        Self {
            id: seed.id,
            tmpl: seed.tmpl,
            stats: seed.stats,
            payload: seed.payload,
            prng: seed.prng,
            tls: seed.tls,
            shared,
            jar: Vec::new(),
            header_cclose: false,
            written: 0,
            written_overhead: 0,
            body_unsent: 0,
            body_offset: 0,
            read: 0,
        }
    }

    #[inline]
    fn running(&self) -> bool {
        self.shared.is_running.load(Ordering::Relaxed)
    }

    /// Drives the connection until the stop flag clears or its request cap
    /// is reached.
    pub async fn run(mut self) {
        // JMeter-style ramp-up: stagger the first connect within the
        // configured window.
        if self.tmpl.ramp_up_ms > 0 {
            let ms = self.prng.next_range(0, self.tmpl.ramp_up_ms);
            if ms > 0 {
                sleep(Duration::from_millis(ms)).await;
            }
        }

        let mut parser = ResponseParser::new(self.shared.cookies);

        'connect: while self.running() {
            let mut t = match self.connect().await {
                Ok(t) => t,
                Err(err) => {
                    log::debug!("connection {}: connect failed: {err}", self.id);
                    self.stats.on_err_conn();
                    sleep(Duration::from_millis(CONNECT_RETRY_MS)).await;
                    continue 'connect;
                }
            };
            self.stats.on_connect();

            loop {
                if self.tmpl.delay_max > 0 {
                    let ms = self.prng.next_range(self.tmpl.delay_min, self.tmpl.delay_max);
                    if ms > 0 {
                        sleep(Duration::from_millis(ms)).await;
                    }
                }
                if !self.running() {
                    return;
                }

                self.header_cclose = next_is_cclose(
                    self.stats.reqs(),
                    self.stats.reqs_total(),
                    self.tmpl.keep_alive_reqs,
                    self.tmpl.reqs_max,
                    self.tmpl.cclose,
                );

                let started = Instant::now();
                if let Err(err) = self.write_request(&mut t).await {
                    log::debug!("connection {}: write failed: {err}", self.id);
                    self.stats.on_err_conn();
                    continue 'connect;
                }

                match self.read_response(&mut t, &mut parser).await {
                    Ok(()) => {}
                    Err(ReadError::Parser(err)) => {
                        log::debug!("connection {}: {err}", self.id);
                        self.stats.on_err_parser();
                        continue 'connect;
                    }
                    Err(ReadError::Io(err)) => {
                        log::debug!("connection {}: read failed: {err}", self.id);
                        self.stats.on_err_conn();
                        continue 'connect;
                    }
                }

                let status = parser.status();
                log::trace!(
                    "connection {}: response {status}, {} bytes",
                    self.id,
                    self.read
                );
                self.stats.on_response();
                if status >= 400 {
                    self.stats.on_err_status();
                }
                if let Some(rlog) = &self.shared.rlog {
                    rlog.record(started.elapsed().as_micros() as u64, status, self.id);
                }
                if self.shared.cookies {
                    self.jar.extend(parser.take_cookies());
                }

                if self.tmpl.reqs_max > 0 && self.stats.reqs_total() >= self.tmpl.reqs_max {
                    // Request cap reached: this connection stops producing
                    // traffic for the rest of the test.
                    self.shared.run.fetch_sub(1, Ordering::AcqRel);
                    return;
                }

                if self.header_cclose || parser.server_close() {
                    if !self.tmpl.close_client {
                        self.drain_until_close(&mut t).await;
                    }
                    continue 'connect;
                }
            }
        }
    }

    /// Opens, binds and connects the socket, then completes the TLS
    /// handshake when the template asks for one.
    async fn connect(&mut self) -> io::Result<Transport> {
        self.stats.stamp_start();

        let sock = transport::open_socket(&self.tmpl)?;
        sock.writable().await?;
        self.stats.stamp_writeable();
        if let Some(err) = sock.take_error()? {
            return Err(err);
        }

        let mut t = match (self.tmpl.scheme, &self.tls) {
            (Scheme::Https, Some(ctx)) => {
                let session = ctx
                    .session(&self.tmpl.host, self.tmpl.tls_session_reuse)
                    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
                Transport::tls(sock, session)
            }
            _ => Transport::plain(sock),
        };

        t.handshake().await?;
        if matches!(t, Transport::Tls(..)) {
            self.stats.stamp_handshake();
        }

        Ok(t)
    }

    /// Emits one full request: the pre-rendered image, then chunk framing
    /// and payload for random bodies.
    async fn write_request(&mut self, t: &mut Transport) -> io::Result<()> {
        self.written = 0;
        self.written_overhead = 0;
        self.body_unsent = 0;
        self.body_offset = 0;
        self.stats.stamp_established();

        let image = if self.header_cclose {
            &self.tmpl.request_cclose
        } else {
            &self.tmpl.request
        };
        let head = if self.jar.is_empty() {
            image.bytes().clone()
        } else {
            image.with_cookies(&self.jar.join("; "))
        };
        self.write_all(t, &head, false).await?;

        if let Some(BodySpec::Random(size)) = &self.tmpl.body {
            let size = *size;
            let Some(payload) = self.payload.clone() else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "random body without a payload buffer",
                ));
            };

            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(payload.len() as u64) as usize;
                self.write_all(t, &chunk_frame(n), true).await?;
                self.write_chunk_payload(t, &payload, n).await?;
                self.write_all(t, b"\r\n", true).await?;
                remaining -= n as u64;
            }
            self.write_all(t, CHUNK_TERMINATOR, true).await?;
        }

        t.flush().await?;
        log::trace!(
            "connection {}: request emitted, {} bytes ({} framing)",
            self.id,
            self.written,
            self.written_overhead
        );

        Ok(())
    }

    async fn write_all(
        &mut self,
        t: &mut Transport,
        mut data: &[u8],
        overhead: bool,
    ) -> io::Result<()> {
        while !data.is_empty() {
            match t.try_write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    data = &data[n..];
                    self.written += n as u64;
                    if overhead {
                        self.written_overhead += n as u64;
                    }
                    self.stats.on_send(n as u64);
                    self.stats.stamp_handshake();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    t.writable().await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Flushes one chunk's payload, resuming from the exact byte offset
    /// after a partial write. The payload buffer is positional, so no
    /// generator state needs replaying.
    async fn write_chunk_payload(
        &mut self,
        t: &mut Transport,
        payload: &Bytes,
        len: usize,
    ) -> io::Result<()> {
        self.body_offset = 0;
        self.body_unsent = len as u64;

        while self.body_unsent > 0 {
            let off = self.body_offset as usize;
            match t.try_write(&payload[off..len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.body_offset += n as u64;
                    self.body_unsent -= n as u64;
                    self.written += n as u64;
                    self.stats.on_send(n as u64);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    t.writable().await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Reads the response incrementally through the worker's scratch buffer
    /// until the parser reports a complete message.
    async fn read_response(
        &mut self,
        t: &mut Transport,
        parser: &mut ResponseParser,
    ) -> Result<(), ReadError> {
        parser.reset();
        self.read = 0;

        loop {
            t.readable().await.map_err(ReadError::Io)?;

            let n = {
                let mut buf = self.shared.buf.borrow_mut();
                match t.try_read(&mut buf) {
                    Ok(0) => None,
                    Ok(n) => {
                        parser.feed(&buf[..n]).map_err(ReadError::Parser)?;
                        Some(n)
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) => return Err(ReadError::Io(err)),
                }
            };

            match n {
                None => {
                    // Peer closed. That finishes a close-delimited body and
                    // breaks anything else mid-message.
                    if parser.on_eof() {
                        return Ok(());
                    }
                    return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                Some(n) => {
                    self.stats.on_recv(n as u64);
                    self.read += n as u64;
                    if parser.is_complete() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Waits for the server's FIN after a `Connection: close` exchange when
    /// the client is not the one configured to close first.
    async fn drain_until_close(&mut self, t: &mut Transport) {
        loop {
            if t.readable().await.is_err() {
                return;
            }

            let mut buf = self.shared.buf.borrow_mut();
            match t.try_read(&mut buf) {
                Ok(0) => return,
                Ok(n) => self.stats.on_recv(n as u64),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(..) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_rollover_marks_every_kth_request() {
        // keep_alive_reqs = 3: requests 3, 6, 9, ... are close variants.
        let mut marked = Vec::new();
        let mut reqs = 0;
        for total in 0..9u64 {
            if next_is_cclose(reqs, total, 3, 0, false) {
                marked.push(total + 1);
                reqs = 0;
            } else {
                reqs += 1;
            }
        }

        assert_eq!(marked, vec![3, 6, 9]);
    }

    #[test]
    fn request_cap_closes_the_last_request() {
        assert!(!next_is_cclose(0, 8, 0, 10, false));
        assert!(next_is_cclose(0, 9, 0, 10, false));
    }

    #[test]
    fn configured_cclose_always_closes() {
        assert!(next_is_cclose(0, 0, 0, 0, true));
    }

    #[test]
    fn unlimited_connection_stays_open() {
        assert!(!next_is_cclose(1000, 1000, 0, 0, false));
    }

    #[test]
    fn cap_below_keep_alive_wins() {
        // reqs_max = 2 < keep_alive_reqs = 5: the second request is final.
        assert!(!next_is_cclose(0, 0, 5, 2, false));
        assert!(next_is_cclose(1, 1, 5, 2, false));
    }
}
