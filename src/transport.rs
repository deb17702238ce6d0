use std::{
    io::{self, Read, Write},
    time::Duration,
};

use rustls::ClientConnection;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;

use crate::cfg::Template;

/// Opens a non-blocking TCP socket configured per the template and starts
/// connecting it.
///
/// The connect is expected to be in flight when this returns; the caller
/// awaits writability and checks `SO_ERROR` (via `take_error`) to learn the
/// outcome.
pub fn open_socket(tmpl: &Template) -> io::Result<TcpStream> {
    let addr = tmpl.addr_to;
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;

    let ka = &tmpl.tcp_keep_alive;
    if ka.enable {
        let mut keepalive = TcpKeepalive::new();
        if ka.idle > 0 {
            keepalive = keepalive.with_time(Duration::from_secs(ka.idle));
        }
        if ka.intvl > 0 {
            keepalive = keepalive.with_interval(Duration::from_secs(ka.intvl));
        }
        if ka.cnt > 0 {
            keepalive = keepalive.with_retries(ka.cnt);
        }
        sock.set_tcp_keepalive(&keepalive)?;
    }
    if let Some(secs) = tmpl.close_linger {
        sock.set_linger(Some(Duration::from_secs(secs)))?;
    }
    if let Some(from) = tmpl.addr_from {
        sock.bind(&from.into())?;
    }

    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) => return Err(err),
    }

    TcpStream::from_std(sock.into())
}

/// A connected stream, plain or TLS.
///
/// Exposes readiness-style I/O in both cases: `try_read`/`try_write` never
/// block and report `WouldBlock`, `readable`/`writable` suspend until the
/// next attempt can make progress. For TLS, `readable` also reports ready
/// when decrypted bytes are already buffered even though the socket itself
/// has nothing to offer.
pub enum Transport {
    Plain(TcpStream),
    Tls(TlsStream),
}

impl Transport {
    #[inline]
    pub fn plain(sock: TcpStream) -> Self {
        Self::Plain(sock)
    }

    #[inline]
    pub fn tls(sock: TcpStream, session: ClientConnection) -> Self {
        Self::Tls(TlsStream {
            sock,
            tls: session,
            plaintext: 0,
            eof: false,
        })
    }

    #[inline]
    pub fn sock(&self) -> &TcpStream {
        match self {
            Self::Plain(sock) => sock,
            Self::Tls(t) => &t.sock,
        }
    }

    /// Drives the TLS handshake to completion. No-op on plain transports.
    pub async fn handshake(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(..) => Ok(()),
            Self::Tls(t) => t.handshake().await,
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Plain(sock) => sock.readable(),
            Self::Tls(t) => {
                if t.plaintext > 0 || t.eof {
                    return Ok(());
                }
                t.sock.readable()
            }
        }
        .await
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.sock().writable().await
    }

    /// Non-blocking read. `Ok(0)` means the peer closed the stream.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.try_read(buf),
            Self::Tls(t) => t.try_read(buf),
        }
    }

    /// Non-blocking write of as much of `buf` as currently fits.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.try_write(buf),
            Self::Tls(t) => t.try_write(buf),
        }
    }

    /// Pushes out anything the transport still has buffered.
    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(..) => Ok(()),
            Self::Tls(t) => t.flush().await,
        }
    }
}

/// TLS session over a non-blocking socket.
pub struct TlsStream {
    sock: TcpStream,
    tls: ClientConnection,
    /// Decrypted bytes buffered inside the TLS layer.
    plaintext: usize,
    eof: bool,
}

/// Adapts the tokio readiness API to the blocking-style `Read`/`Write`
/// rustls drives its record layer with.
struct SockIo<'a>(&'a TcpStream);

impl Read for SockIo<'_> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SockIo<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsStream {
    async fn handshake(&mut self) -> io::Result<()> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() && !self.pump_write()? {
                self.sock.writable().await?;
                continue;
            }
            if !self.tls.is_handshaking() {
                break;
            }
            if self.tls.wants_read() {
                self.sock.readable().await?;
                match self.pump_read() {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(..) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
            }
        }

        // The tail of the handshake flight may still be buffered.
        self.flush().await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.plaintext == 0 && !self.eof {
            self.pump_read()?;
        }

        if self.plaintext == 0 {
            if self.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        match self.tls.reader().read(buf) {
            Ok(n) => {
                self.plaintext = self.plaintext.saturating_sub(n);
                Ok(n)
            }
            // The peer went away without a close_notify; report a clean end
            // of stream, the response framing decides whether that is fine.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.pump_write()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = self.tls.writer().write(buf)?;
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        // Opportunistic flush; whatever the socket does not take now stays
        // buffered for the next writable round.
        self.pump_write()?;

        Ok(n)
    }

    async fn flush(&mut self) -> io::Result<()> {
        while !self.pump_write()? {
            self.sock.writable().await?;
        }

        Ok(())
    }

    /// Writes buffered TLS records to the socket.
    ///
    /// Returns whether the TLS layer was fully drained.
    fn pump_write(&mut self) -> io::Result<bool> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut SockIo(&self.sock)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(..) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }

        Ok(true)
    }

    /// Reads ciphertext from the socket and decrypts it.
    fn pump_read(&mut self) -> io::Result<usize> {
        match self.tls.read_tls(&mut SockIo(&self.sock)) {
            Ok(0) => {
                self.eof = true;
                self.process()?;
                Ok(0)
            }
            Ok(n) => {
                self.process()?;
                Ok(n)
            }
            Err(err) => Err(err),
        }
    }

    fn process(&mut self) -> io::Result<()> {
        let state = self
            .tls
            .process_new_packets()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        self.plaintext = state.plaintext_bytes_to_read();
        if state.peer_has_closed() {
            self.eof = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn plain_roundtrip_over_readiness_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(b"pong").unwrap();
            buf
        });

        let sock = TcpStream::connect(addr).await.unwrap();
        let mut t = Transport::plain(sock);

        let mut sent = 0;
        while sent < 4 {
            t.writable().await.unwrap();
            match t.try_write(&b"ping"[sent..]) {
                Ok(n) => sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("{err}"),
            }
        }
        t.flush().await.unwrap();

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            t.readable().await.unwrap();
            match t.try_read(&mut buf[read..]) {
                Ok(0) => panic!("early eof"),
                Ok(n) => read += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("{err}"),
            }
        }

        assert_eq!(&buf, b"pong");
        assert_eq!(&server.join().unwrap(), b"ping");
    }
}
