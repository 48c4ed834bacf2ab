use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainCursor;
use crate::config::{Endpoint, Host, RedisOptions, RespVersion};
use crate::decode::RespReader;
use crate::encode::RespWriter;
use crate::error::{Error, Result};
use crate::pipe::{DEFAULT_PIPE_CAPACITY, PipeReader, PipeWriter, byte_pipe};
use crate::reply::{BuildStep, Reply, ReplyBuilder};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RECV_BUFFER_HINT: usize = 4 * 1024;

/// Lifecycle of a connection.
///
/// ```text
/// New → Connecting → Handshaking → Ready ↔ Busy
///                                    ↓        ↓
///                                   Failed ← (any error)
///                                    ↓
///                                  Closed
/// ```
///
/// `Failed` is terminal: a failed connection is never reused, only disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    New = 0,
    Connecting = 1,
    Handshaking = 2,
    Ready = 3,
    Busy = 4,
    Failed = 5,
    Closed = 6,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Ready,
            4 => Self::Busy,
            5 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

/// Shared, lock-free view of a connection's status. The pumps hold clones so
/// an I/O failure on either direction can fail the connection immediately.
#[derive(Debug, Clone)]
pub(crate) struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionStatus::New as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Move to `Failed` unless already terminal.
    pub(crate) fn fail(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match ConnectionStatus::from_u8(cur) {
                    ConnectionStatus::Failed | ConnectionStatus::Closed => None,
                    _ => Some(ConnectionStatus::Failed as u8),
                }
            });
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The live I/O half of a connection: one pipe towards the socket, one back,
/// and the two pump tasks shuttling bytes between them and the kernel.
#[derive(Debug)]
struct Io {
    to_socket: PipeWriter,
    from_socket: PipeReader,
    resp: RespReader,
    /// Receive-stream position the decoder has committed past.
    consumed: u64,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

/// One TCP connection to a Redis server.
///
/// A connection is created unconnected (`New`); [`connect`](Self::connect)
/// opens the socket, starts the pumps and performs the `HELLO` handshake.
/// Commands are single-outstanding per connection: concurrent callers
/// serialize through the pool, each rental owning its connection exclusively.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    options: Arc<RedisOptions>,
    status: StatusCell,
    negotiated: RespVersion,
    io: Option<Io>,
}

impl Connection {
    pub fn new(id: u64, options: Arc<RedisOptions>) -> Self {
        Self {
            id,
            options,
            status: StatusCell::new(),
            negotiated: RespVersion::Unknown,
            io: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// The protocol version in effect: the handshake outcome if one
    /// happened, the configured version otherwise.
    pub fn resp_version(&self) -> RespVersion {
        match self.negotiated {
            RespVersion::Unknown => self.options.resp_version(),
            v => v,
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_failed(&self) {
        self.status.fail();
    }

    /// Open the socket, start the pumps and handshake, all before `deadline`.
    pub async fn connect(&mut self, deadline: Instant) -> Result<()> {
        let current = self.status.get();
        if current != ConnectionStatus::New {
            return Err(match current {
                ConnectionStatus::Failed => Error::ConnectionBroken,
                other => Error::InvalidState(other),
            });
        }
        self.status.store(ConnectionStatus::Connecting);
        match tokio::time::timeout_at(deadline, self.connect_inner()).await {
            Ok(Ok(())) => {
                self.status.store(ConnectionStatus::Ready);
                tracing::debug!(id = self.id, version = ?self.negotiated, "connection ready");
                Ok(())
            }
            Ok(Err(e)) => {
                self.status.fail();
                Err(e)
            }
            Err(_) => {
                self.status.fail();
                Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect deadline elapsed",
                )))
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<()> {
        let endpoint = self
            .options
            .endpoint()
            .cloned()
            .ok_or(Error::Config(crate::config::ConfigError::MissingEndpoint))?;
        tracing::debug!(id = self.id, endpoint = %endpoint, "connecting");
        let stream = open_socket(&endpoint, self.options.no_delay()).await?;
        let (read_half, write_half) = stream.into_split();

        let (send_writer, send_reader) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let (recv_writer, recv_reader) = byte_pipe(DEFAULT_PIPE_CAPACITY);
        let send_task = tokio::spawn(run_send_pump(
            send_reader,
            write_half,
            self.status.clone(),
            self.id,
        ));
        let recv_task = tokio::spawn(run_recv_pump(
            recv_writer,
            read_half,
            self.options.allocate_receive_buffer_on_demand(),
            self.status.clone(),
            self.id,
        ));
        self.io = Some(Io {
            to_socket: send_writer,
            from_socket: recv_reader,
            resp: RespReader::new(),
            consumed: 0,
            send_task,
            recv_task,
        });

        self.status.store(ConnectionStatus::Handshaking);
        match self.options.resp_version() {
            RespVersion::Two => self.legacy_handshake().await,
            _ => self.hello_handshake().await,
        }
    }

    /// `HELLO 3`, optionally with inline `AUTH` and `SETNAME`. A `NOPROTO`
    /// error reply downgrades to the RESP2 `AUTH`/`PING` path.
    async fn hello_handshake(&mut self) -> Result<()> {
        let username = self.options.username().map(str::to_owned);
        let password = self.options.password().map(str::to_owned);
        let client_name = self.options.client_name().map(str::to_owned);

        {
            let io = self.io_mut()?;
            let mut w = RespWriter::new(&mut io.to_socket);
            let mut parts: i64 = 2;
            if password.is_some() {
                parts += 3;
            }
            if client_name.is_some() {
                parts += 2;
            }
            w.write_array_start(parts)?;
            w.write_raw(b"$5\r\nHELLO\r\n");
            w.write_bulk_string_byte(b'3');
            if let Some(pass) = &password {
                w.write_bulk_string(b"AUTH")?;
                w.write_bulk_string(username.as_deref().unwrap_or("default").as_bytes())?;
                w.write_bulk_string(pass.as_bytes())?;
            }
            if let Some(name) = &client_name {
                w.write_bulk_string(b"SETNAME")?;
                w.write_bulk_string(name.as_bytes())?;
            }
            w.flush();
        }
        self.flush_send().await?;

        match self.read_reply_internal().await? {
            reply @ (Reply::Map(_) | Reply::Array(_)) => {
                let proto = reply
                    .lookup(b"proto")
                    .and_then(Reply::as_integer)
                    .unwrap_or(3);
                self.negotiated = if proto <= 2 {
                    RespVersion::Two
                } else {
                    RespVersion::Three
                };
                tracing::debug!(id = self.id, proto, "HELLO accepted");
                Ok(())
            }
            Reply::Error(msg) if msg.starts_with(b"NOPROTO") => {
                tracing::debug!(id = self.id, "server lacks RESP3, retrying with RESP2");
                self.legacy_handshake().await
            }
            Reply::Error(msg) => Err(Error::HandshakeFailed {
                server_message: Some(String::from_utf8_lossy(&msg).into_owned()),
            }),
            _ => Err(Error::HandshakeFailed {
                server_message: None,
            }),
        }
    }

    /// Pre-HELLO handshake: `AUTH` when credentials are configured, then a
    /// `PING` to prove the line is usable.
    async fn legacy_handshake(&mut self) -> Result<()> {
        let username = self.options.username().map(str::to_owned);
        let password = self.options.password().map(str::to_owned);

        if let Some(pass) = &password {
            let mut args: Vec<&[u8]> = vec![b"AUTH"];
            if let Some(user) = &username {
                args.push(user.as_bytes());
            }
            args.push(pass.as_bytes());
            self.write_command(&args)?;
            self.flush_send().await?;
            if let Reply::Error(msg) = self.read_reply_internal().await? {
                return Err(Error::HandshakeFailed {
                    server_message: Some(String::from_utf8_lossy(&msg).into_owned()),
                });
            }
        }

        self.write_command(&[&b"PING"[..]])?;
        self.flush_send().await?;
        match self.read_reply_internal().await? {
            Reply::Simple(pong) if &pong[..] == b"PONG" => {
                self.negotiated = RespVersion::Two;
                Ok(())
            }
            Reply::Error(msg) => Err(Error::HandshakeFailed {
                server_message: Some(String::from_utf8_lossy(&msg).into_owned()),
            }),
            _ => Err(Error::HandshakeFailed {
                server_message: None,
            }),
        }
    }

    /// Send one command as an array of bulk strings. The connection moves to
    /// `Busy` until the matching [`read_reply`](Self::read_reply).
    pub async fn send_command<B: AsRef<[u8]>>(
        &mut self,
        args: &[B],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            // Nothing was sent; the connection stays usable.
            return Err(Error::Canceled);
        }
        if args.is_empty() {
            return Err(Error::ArgumentOutOfRange(
                "a command needs at least one argument",
            ));
        }
        let current = self.status.get();
        if current != ConnectionStatus::Ready {
            return Err(match current {
                ConnectionStatus::Failed => Error::ConnectionBroken,
                other => Error::InvalidState(other),
            });
        }
        self.status.store(ConnectionStatus::Busy);

        let sent = tokio::select! {
            r = async {
                self.write_command(args)?;
                self.flush_send().await
            } => r,
            _ = cancel.cancelled() => Err(Error::Canceled),
        };
        if let Err(e) = sent {
            // Bytes may be in flight; the wire can no longer be trusted.
            self.status.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Read one complete top-level reply value off the wire.
    pub async fn read_reply(&mut self, cancel: &CancellationToken) -> Result<Reply> {
        let current = self.status.get();
        if current != ConnectionStatus::Busy {
            return Err(match current {
                ConnectionStatus::Failed => Error::ConnectionBroken,
                other => Error::InvalidState(other),
            });
        }
        let result = tokio::select! {
            r = self.read_reply_internal() => r,
            _ = cancel.cancelled() => Err(Error::Canceled),
        };
        match result {
            Ok(reply) => {
                self.status.transition(ConnectionStatus::Busy, ConnectionStatus::Ready);
                Ok(reply)
            }
            Err(e) => {
                self.status.fail();
                Err(e)
            }
        }
    }

    /// Send a command and read its reply. An error *reply* (`-ERR …`) is a
    /// successful exchange: it surfaces as [`Reply::Error`] with the
    /// connection back in `Ready`.
    pub async fn issue<B: AsRef<[u8]>>(
        &mut self,
        args: &[B],
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.send_command(args, cancel).await?;
        self.read_reply(cancel).await
    }

    /// Close the socket, stop both pumps, mark `Closed`.
    pub fn dispose(&mut self) {
        if let Some(io) = self.io.take() {
            // Aborting the pumps drops their socket halves and pipe ends,
            // which unblocks anything still waiting on either pipe.
            io.send_task.abort();
            io.recv_task.abort();
        }
        self.status.store(ConnectionStatus::Closed);
        tracing::debug!(id = self.id, "connection disposed");
    }

    fn io_mut(&mut self) -> Result<&mut Io> {
        self.io.as_mut().ok_or(Error::ConnectionBroken)
    }

    fn write_command<B: AsRef<[u8]>>(&mut self, args: &[B]) -> Result<()> {
        let io = self.io_mut()?;
        let mut w = RespWriter::new(&mut io.to_socket);
        w.write_array_start(args.len() as i64)?;
        for arg in args {
            w.write_bulk_string(arg.as_ref())?;
        }
        w.flush();
        Ok(())
    }

    async fn flush_send(&mut self) -> Result<()> {
        let io = self.io_mut()?;
        let out = io.to_socket.flush().await;
        if out.is_canceled {
            return Err(Error::ConnectionBroken);
        }
        Ok(())
    }

    /// Drive the decoder over the receive pipe until one top-level value is
    /// complete. Consumed bytes are released back to the pipe only at token
    /// boundaries, so a partial token survives across reads untouched.
    async fn read_reply_internal(&mut self) -> Result<Reply> {
        let io = self.io.as_mut().ok_or(Error::ConnectionBroken)?;
        let mut builder = ReplyBuilder::new();
        let mut pending_payload: Option<i64> = None;
        let mut seen_end = io.consumed;

        loop {
            let out = io.from_socket.read_past(seen_end).await;
            let chain = out.buffer;
            let mut cursor = ChainCursor::at(&chain, io.consumed);

            loop {
                let got = match pending_payload {
                    Some(len) => io.resp.try_read_bulk_string(&mut cursor, len)?,
                    None => io.resp.try_read(&mut cursor)?,
                };
                if !got {
                    break;
                }
                let Some(kind) = io.resp.kind() else {
                    break;
                };
                match builder.offer(kind, io.resp.value())? {
                    BuildStep::NeedToken => pending_payload = None,
                    BuildStep::NeedBulkPayload(len) => pending_payload = Some(len),
                    BuildStep::Complete(reply) => {
                        io.consumed = cursor.position();
                        io.from_socket.advance_to(io.consumed);
                        return Ok(reply);
                    }
                }
            }

            io.consumed = cursor.position();
            seen_end = chain.end();
            io.from_socket.advance_to(io.consumed);

            if out.is_completed {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection mid-reply",
                )));
            }
            if out.is_canceled {
                return Err(Error::ConnectionBroken);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.io.is_some() {
            self.dispose();
        }
    }
}

/// Resolve and open the TCP socket. Name endpoints go through DNS on every
/// call; stale resolutions are never reused.
async fn open_socket(endpoint: &Endpoint, no_delay: bool) -> Result<TcpStream> {
    let stream = match &endpoint.host {
        Host::Ip(ip) => TcpStream::connect((*ip, endpoint.port)).await?,
        Host::Name(name) => {
            let addrs = tokio::net::lookup_host((name.as_str(), endpoint.port)).await?;
            let mut last_err: Option<io::Error> = None;
            let mut connected = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(s) => {
                        connected = Some(s);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match connected {
                Some(s) => s,
                None => {
                    return Err(Error::Transport(last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "hostname resolved to no addresses")
                    })));
                }
            }
        }
    };
    stream.set_nodelay(no_delay)?;
    Ok(stream)
}

/// Drain the send pipe into the socket. Multi-segment views go out in one
/// vectored write; partial writes advance the pipe and loop.
async fn run_send_pump(
    mut pipe: PipeReader,
    mut sock: OwnedWriteHalf,
    status: StatusCell,
    id: u64,
) {
    loop {
        let out = pipe.read().await;
        if out.is_canceled {
            break;
        }
        let chain = out.buffer;
        if !chain.is_empty() {
            let slices = chain.io_slices();
            match sock.write_vectored(&slices).await {
                Ok(0) => {
                    status.fail();
                    break;
                }
                Ok(n) => {
                    pipe.advance_to(chain.start() + n as u64);
                    if out.is_completed && n as u64 == chain.len() {
                        let _ = sock.shutdown().await;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(id, error = ?e, "send pump: socket write failed");
                    status.fail();
                    break;
                }
            }
        } else if out.is_completed {
            let _ = sock.shutdown().await;
            break;
        }
    }
    tracing::trace!(id, "send pump stopped");
}

/// Fill the receive pipe from the socket. With on-demand buffering the pump
/// waits for readability before staging memory, so idle connections hold no
/// receive buffer.
async fn run_recv_pump(
    mut pipe: PipeWriter,
    mut sock: OwnedReadHalf,
    on_demand: bool,
    status: StatusCell,
    id: u64,
) {
    loop {
        if on_demand {
            if let Err(e) = sock.readable().await {
                tracing::warn!(id, error = ?e, "recv pump: readiness wait failed");
                status.fail();
                break;
            }
        }
        let buf = pipe.get_memory(RECV_BUFFER_HINT);
        match sock.read(buf).await {
            Ok(0) => {
                // Peer closed its write side.
                pipe.complete();
                break;
            }
            Ok(n) => {
                pipe.advance(n);
                let out = pipe.flush().await;
                if out.is_canceled {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(id, error = ?e, "recv pump: socket read failed");
                status.fail();
                break;
            }
        }
    }
    tracing::trace!(id, "recv pump stopped");
}
