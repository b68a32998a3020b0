//! Full duplex websocket connection engine.
//!
//! [`Connection`] owns an already-open byte transport and multiplexes framed
//! data, control traffic and liveness monitoring over it. The receive side
//! surfaces one data frame header at a time and streams its payload through
//! [`Connection::receive`], consuming interleaved control frames internally.
//! The send side serializes every frame through a single write permit so
//! bytes of concurrent frames never interleave on the wire, while readers
//! and writers proceed concurrently over the full duplex transport.
//!
//! The closing handshake runs through an atomic four state machine; either
//! peer may initiate and the engine never answers a received close frame by
//! itself, leaving the reply to the caller to avoid racing a concurrent
//! local close.

use std::io;
use std::mem;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, warn};
use rand::{thread_rng, Rng};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::buffer::{
    carve_control_block, reassemble_control_block, BufferPool, RawBlock, CONTROL_BLOCK_SIZE, HEADER_PREFIX,
};
use crate::transport::{TransportRead, TransportWrite};
use crate::util::current_time_nanos;
use crate::ws::close::AtomicCloseState;
use crate::ws::header::{mask_in_place, wire_header_length};
use crate::ws::ping::{PingAction, PingHandler, PingPayload};
use crate::ws::protocol::MAX_CONTROL_PAYLOAD;

mod close;
mod error;
mod header;
mod ping;
mod protocol;

pub use close::{CloseReason, CloseState};
pub use error::Error;
pub use header::{FrameHeader, OpCode};
pub use ping::PingMode;

// staged ping layout inside the out-ping slice: header room, one length
// byte, then up to 125 payload bytes
const PING_LENGTH_AT: usize = HEADER_PREFIX;
const PING_PAYLOAD_AT: usize = HEADER_PREFIX + 1;

/// Which side of the connection this engine plays. Clients mask every
/// outbound frame, servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection options, snapshotted at construction.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub ping_mode: PingMode,
    pub ping_interval: Duration,
    /// `None` means the peer is never timed out.
    pub ping_timeout: Option<Duration>,
    pub send_buffer_size: usize,
    /// Reserved extension bits accepted on inbound frames and allowed on
    /// outbound ones, as a 3 bit set.
    pub permitted_rsv: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ping_mode: PingMode::default(),
            ping_interval: Duration::from_secs(5),
            ping_timeout: None,
            send_buffer_size: 8192,
            permitted_rsv: 0,
        }
    }
}

impl Options {
    /// Set [`Self::ping_mode`].
    pub fn ping_mode(mut self, ping_mode: PingMode) -> Self {
        self.ping_mode = ping_mode;
        self
    }

    /// Set [`Self::ping_interval`].
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Set [`Self::ping_timeout`].
    pub fn ping_timeout(mut self, ping_timeout: Option<Duration>) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Set [`Self::send_buffer_size`].
    pub fn send_buffer_size(mut self, send_buffer_size: usize) -> Self {
        self.send_buffer_size = send_buffer_size;
        self
    }

    /// Set [`Self::permitted_rsv`].
    pub fn permitted_rsv(mut self, permitted_rsv: u8) -> Self {
        self.permitted_rsv = permitted_rsv & 0x07;
        self
    }
}

/// How long a send may wait for the write permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    #[default]
    Infinite,
    /// Skip the send when the permit is contended.
    NoWait,
    After(Duration),
}

/// Per-send behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub lock_timeout: LockTimeout,
    /// Caller already holds the write permit.
    pub no_lock: bool,
    /// Send regardless of close state.
    pub ignore_close: bool,
    /// Swallow failures and report them through the returned bool.
    pub no_errors: bool,
}

impl SendOptions {
    pub const fn new() -> Self {
        Self {
            lock_timeout: LockTimeout::Infinite,
            no_lock: false,
            ignore_close: false,
            no_errors: false,
        }
    }

    pub const fn lock_timeout(mut self, lock_timeout: LockTimeout) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub const fn no_lock(mut self) -> Self {
        self.no_lock = true;
        self
    }

    pub const fn ignore_close(mut self) -> Self {
        self.ignore_close = true;
        self
    }

    pub const fn no_errors(mut self) -> Self {
        self.no_errors = true;
        self
    }
}

struct RecvState<R> {
    reader: R,
    header_scratch: &'static mut [u8],
    in_ping: &'static mut [u8],
    in_pong: &'static mut [u8],
    in_close: &'static mut [u8],
    out_pong: &'static mut [u8],
}

struct WriteState<W> {
    writer: W,
    out_close: &'static mut [u8],
}

struct PingState {
    out_ping: &'static mut [u8],
}

struct SendBuf {
    data: Vec<u8>,
}

enum ControlOutcome {
    Handled,
    CloseFrame,
}

/// Full duplex websocket connection over a split byte transport.
///
/// All methods take `&self`; internal atomics and mutexes enforce the single
/// reader / single writer discipline and serialize wire access.
pub struct Connection<R, W> {
    role: Role,
    mask_outbound: bool,
    options: Options,
    pool: Arc<dyn BufferPool>,
    recv: Mutex<RecvState<R>>,
    write: Mutex<WriteState<W>>,
    ping: Mutex<PingState>,
    send_buf: Mutex<SendBuf>,
    write_permit: Semaphore,
    reading: AtomicBool,
    writing: AtomicBool,
    state: AtomicCloseState,
    header: StdMutex<Option<FrameHeader>>,
    close_reason: StdMutex<Option<CloseReason>>,
    latency_nanos: AtomicU64,
    handler: PingHandler,
    shutdown: CancellationToken,
    block: StdMutex<Option<RawBlock>>,
}

impl<T> Connection<ReadHalf<T>, WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-open transport, taking both pooled buffers.
    pub fn new(transport: T, role: Role, options: Options, pool: Arc<dyn BufferPool>) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self::from_split(reader, writer, role, options, pool)
    }
}

impl<R: TransportRead, W: TransportWrite> Connection<R, W> {
    /// Wraps pre-split transport halves.
    pub fn from_split(reader: R, writer: W, role: Role, options: Options, pool: Arc<dyn BufferPool>) -> Self {
        let now = current_time_nanos();
        let (slices, raw) = carve_control_block(pool.acquire(CONTROL_BLOCK_SIZE));
        let send_data = pool.acquire(HEADER_PREFIX + options.send_buffer_size);
        let handler = PingHandler::new(options.ping_mode, options.ping_interval, options.ping_timeout, now);
        Self {
            role,
            mask_outbound: role == Role::Client,
            options,
            pool,
            recv: Mutex::new(RecvState {
                reader,
                header_scratch: slices.header_scratch,
                in_ping: slices.in_ping,
                in_pong: slices.in_pong,
                in_close: slices.in_close,
                out_pong: slices.out_pong,
            }),
            write: Mutex::new(WriteState {
                writer,
                out_close: slices.out_close,
            }),
            ping: Mutex::new(PingState {
                out_ping: slices.out_ping,
            }),
            send_buf: Mutex::new(SendBuf { data: send_data }),
            write_permit: Semaphore::new(1),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            state: AtomicCloseState::new(),
            header: StdMutex::new(None),
            close_reason: StdMutex::new(None),
            latency_nanos: AtomicU64::new(u64::MAX),
            handler,
            shutdown: CancellationToken::new(),
            block: StdMutex::new(Some(raw)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Header of the data frame currently being received, if any.
    pub fn current_header(&self) -> Option<FrameHeader> {
        *self.header.lock().unwrap()
    }

    /// Reason of the last observed close, local or remote.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    /// Last measured round trip latency estimate. `Duration::MAX` until a
    /// measurement exists; only meaningful under [`PingMode::LatencyControl`].
    pub fn latency(&self) -> Duration {
        match self.latency_nanos.load(Ordering::Acquire) {
            u64::MAX => Duration::MAX,
            nanos => Duration::from_nanos(nanos),
        }
    }

    pub fn state(&self) -> CloseState {
        self.state.load()
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send()
    }

    pub fn can_receive(&self) -> bool {
        self.state.can_receive()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Advances the receive side to the start of the next data frame.
    ///
    /// Control frames encountered on the way are consumed internally: pings
    /// are answered, pongs feed the liveness handler and a close frame
    /// transitions the close state. Returns `None` when the transport ends
    /// cleanly or after a close frame was processed.
    ///
    /// Only one task may read at a time; a concurrent attempt fails with a
    /// state error, as does calling again before the previous frame's
    /// payload has been fully consumed.
    pub async fn await_header(&self, cancel: &CancellationToken) -> Result<Option<FrameHeader>, Error> {
        if self
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::State("concurrent read attempt"));
        }
        let _reading = ClearOnDrop(&self.reading);

        {
            let mut header = self.header.lock().unwrap();
            if let Some(current) = header.as_ref() {
                if current.remaining != 0 {
                    return Err(Error::State("previous frame not fully consumed"));
                }
                *header = None;
            }
        }
        if !self.can_receive() {
            return Err(Error::State("receive after close"));
        }

        let mut recv = self.recv.lock().await;
        let recv = &mut *recv;
        loop {
            match self.read_frame_start(&mut recv.reader, &mut recv.header_scratch[..2], cancel).await {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(err) => return Err(self.fail_receive(err, CloseReason::ProtocolError, cancel).await),
            }
            let total = wire_header_length(recv.header_scratch[1]);
            if let Err(err) = self
                .read_exact(&mut recv.reader, &mut recv.header_scratch[2..total], cancel)
                .await
            {
                return Err(self.fail_receive(err, CloseReason::ProtocolError, cancel).await);
            }

            let header = match FrameHeader::parse(&recv.header_scratch[..total], self.options.permitted_rsv) {
                Ok(header) => header,
                Err(err) => return Err(self.fail_receive(err, CloseReason::ProtocolError, cancel).await),
            };
            self.handler.notify_activity(current_time_nanos());

            if header.opcode.is_control() {
                match self.process_control(recv, &header, cancel).await {
                    Ok(ControlOutcome::Handled) => continue,
                    Ok(ControlOutcome::CloseFrame) => return Ok(None),
                    Err(err) => return Err(self.fail_receive(err, CloseReason::ProtocolError, cancel).await),
                }
            }

            *self.header.lock().unwrap() = Some(header);
            return Ok(Some(header));
        }
    }

    /// Streams payload bytes of the current data frame into `dst`, unmasking
    /// in place. Never reads past the frame boundary; returns 0 once the
    /// frame is exhausted.
    pub async fn receive(&self, dst: &mut [u8], cancel: &CancellationToken) -> Result<usize, Error> {
        let header = self.current_header().ok_or(Error::State("no frame in progress"))?;
        if header.remaining <= 0 {
            return Ok(0);
        }
        let len = dst.len().min(header.remaining as usize);
        if len == 0 {
            return Ok(0);
        }

        let mut recv = match self.recv.try_lock() {
            Ok(recv) => recv,
            Err(_) => return Err(Error::State("concurrent read attempt")),
        };
        let read = self.guard_io(recv.reader.read(&mut dst[..len], cancel)).await;
        drop(recv);

        let n = match read {
            Ok(0) => {
                let err = Error::Transport(unexpected_eof());
                return Err(self.fail_receive(err, CloseReason::UnexpectedCondition, cancel).await);
            }
            Ok(n) => n,
            Err(err) => return Err(self.fail_receive(err, CloseReason::UnexpectedCondition, cancel).await),
        };

        let position = (header.payload_len as i64 - header.remaining) as u64;
        mask_in_place(&mut dst[..n], header.mask_or_zero(), position);
        if let Some(current) = self.header.lock().unwrap().as_mut() {
            current.remaining -= n as i64;
        }
        Ok(n)
    }

    /// Retires the current header once its payload has been fully consumed.
    pub fn dispose_header_if_finished(&self) {
        let mut header = self.header.lock().unwrap();
        if let Some(current) = header.as_ref() {
            debug_assert!(current.remaining >= 0, "frame receive counter underflow");
            if current.remaining == 0 {
                *header = None;
            }
        }
    }

    /// Claims the exclusive frame writer, granting access to the send
    /// buffer. Dropping the returned writer ends the write.
    pub fn begin_write(&self) -> Result<FrameWriter<'_, R, W>, Error> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::State("concurrent write attempt"));
        }
        let buf = match self.send_buf.try_lock() {
            Ok(buf) => buf,
            Err(_) => {
                self.writing.store(false, Ordering::Release);
                return Err(Error::State("send buffer unavailable"));
            }
        };
        if self.state.load() == CloseState::Disposed {
            drop(buf);
            self.writing.store(false, Ordering::Release);
            return Err(Error::State("connection disposed"));
        }
        Ok(FrameWriter {
            conn: self,
            buf,
            frame: None,
        })
    }

    /// Stages `data` as the manual ping payload and drives the liveness
    /// handler for one tick. External schedulers call this periodically; a
    /// no-op while the connection cannot send.
    pub async fn ping(&self, data: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        if !self.can_send() {
            return Ok(());
        }
        if data.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::State("ping payload too large"));
        }

        let mut guard = self.ping.lock().await;
        let ping = &mut *guard;
        if ping.out_ping.is_empty() {
            return Ok(());
        }
        if self.handler.is_manual() {
            ping.out_ping[PING_LENGTH_AT] = data.len() as u8;
            ping.out_ping[PING_PAYLOAD_AT..PING_PAYLOAD_AT + data.len()].copy_from_slice(data);
        }

        match self.handler.on_tick(current_time_nanos()) {
            PingAction::Skip => Ok(()),
            PingAction::Dispose => {
                debug!("peer timed out, disposing connection");
                drop(guard);
                self.dispose().await;
                Ok(())
            }
            PingAction::Close(reason) => {
                debug!("peer timed out, closing connection: {reason:?}");
                drop(guard);
                self.close(reason, cancel).await
            }
            PingAction::Send { payload, lock } => {
                let len = match payload {
                    PingPayload::Timestamp => {
                        ping.out_ping[PING_LENGTH_AT] = 8;
                        ping.out_ping[PING_PAYLOAD_AT..PING_PAYLOAD_AT + 8]
                            .copy_from_slice(&current_time_nanos().to_le_bytes());
                        8
                    }
                    PingPayload::Staged => ping.out_ping[PING_LENGTH_AT] as usize,
                    PingPayload::Empty => {
                        ping.out_ping[PING_LENGTH_AT] = 0;
                        0
                    }
                };
                let mask = self.next_mask_key();
                mask_in_place(&mut ping.out_ping[PING_PAYLOAD_AT..PING_PAYLOAD_AT + len], mask, 0);
                let header = FrameHeader::outbound(true, OpCode::Ping, len as u64, mask);
                let start = header.emit(&mut ping.out_ping[..PING_PAYLOAD_AT]);
                let result = self
                    .send_slice(
                        &ping.out_ping[start..PING_PAYLOAD_AT + len],
                        SendOptions::new().lock_timeout(lock),
                        cancel,
                    )
                    .await;
                // restore the staged bytes for the next tick
                mask_in_place(&mut ping.out_ping[PING_PAYLOAD_AT..PING_PAYLOAD_AT + len], mask, 0);
                result.map(|_| ())
            }
        }
    }

    /// Runs the local half of the closing handshake.
    ///
    /// Transitions Open to CloseSent, or CloseReceived to Closed when the
    /// peer already initiated; any other state makes this a no-op. The close
    /// frame carries the 2 byte big-endian status code. I/O failures are
    /// swallowed on this path since the transport is about to die.
    pub async fn close(&self, reason: CloseReason, cancel: &CancellationToken) -> Result<(), Error> {
        let transitioned = self.state.transition(CloseState::Open, CloseState::CloseSent)
            || self.state.transition(CloseState::CloseReceived, CloseState::Closed);
        if !transitioned {
            return Ok(());
        }
        self.close_reason.lock().unwrap().get_or_insert(reason);

        let permit = match self.acquire_permit(LockTimeout::Infinite, cancel).await {
            Ok(permit) => permit,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            // disposed concurrently, nothing left to write to
            Err(_) => return Ok(()),
        };
        let mut write = self.write.lock().await;
        let state = &mut *write;
        if !state.out_close.is_empty() {
            let mask = self.next_mask_key();
            state.out_close[HEADER_PREFIX..HEADER_PREFIX + 2].copy_from_slice(&reason.code().to_be_bytes());
            mask_in_place(&mut state.out_close[HEADER_PREFIX..HEADER_PREFIX + 2], mask, 0);
            let header = FrameHeader::outbound(true, OpCode::Close, 2, mask);
            let start = header.emit(&mut state.out_close[..HEADER_PREFIX]);
            let frame_sent = self
                .guard_io(state.writer.write(&state.out_close[start..HEADER_PREFIX + 2], cancel))
                .await;
            match frame_sent {
                Ok(()) => {
                    if let Err(err) = self.guard_io(state.writer.flush(cancel)).await {
                        debug!("close frame flush failed: {err}");
                    }
                }
                Err(err) => debug!("close frame send failed: {err}"),
            }
        }
        if self.state.load() == CloseState::Closed {
            if let Err(err) = state.writer.close().await {
                debug!("transport close failed: {err}");
            }
        }
        drop(write);
        drop(permit);
        Ok(())
    }

    /// Tears the connection down: closes the transport, closes the write
    /// permit and returns both pooled buffers. Idempotent; in-flight
    /// operations fail promptly instead of touching released buffers.
    pub async fn dispose(&self) {
        if !self.state.dispose() {
            return;
        }
        self.latency_nanos.store(u64::MAX, Ordering::Release);
        self.shutdown.cancel();
        self.write_permit.close();

        {
            let mut send_buf = self.send_buf.lock().await;
            let data = mem::take(&mut send_buf.data);
            if !data.is_empty() {
                self.pool.release(data);
            }
        }
        {
            let mut recv = self.recv.lock().await;
            let recv = &mut *recv;
            mem::take(&mut recv.header_scratch);
            mem::take(&mut recv.in_ping);
            mem::take(&mut recv.in_pong);
            mem::take(&mut recv.in_close);
            mem::take(&mut recv.out_pong);
        }
        {
            let mut ping = self.ping.lock().await;
            mem::take(&mut ping.out_ping);
        }
        {
            let mut write = self.write.lock().await;
            mem::take(&mut write.out_close);
            if let Err(err) = write.writer.close().await {
                debug!("transport close failed: {err}");
            }
        }
        if let Some(raw) = self.block.lock().unwrap().take() {
            // Safety: every carved slice was replaced with an empty one above
            // and the disposed state keeps later lock holders away from them
            let block = unsafe { reassemble_control_block(raw) };
            self.pool.release(block);
        }
    }

    async fn guard_io<Out>(&self, op: impl std::future::Future<Output = io::Result<Out>>) -> Result<Out, Error> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::State("connection disposed")),
            result = op => result.map_err(Error::from),
        }
    }

    /// Reads the first two header bytes. `false` means the transport ended
    /// cleanly at a frame boundary.
    async fn read_frame_start(
        &self,
        reader: &mut R,
        scratch: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let mut filled = 0;
        while filled < scratch.len() {
            let n = self.guard_io(reader.read(&mut scratch[filled..], cancel)).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Transport(unexpected_eof()));
            }
            filled += n;
        }
        Ok(true)
    }

    async fn read_exact(&self, reader: &mut R, buf: &mut [u8], cancel: &CancellationToken) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.guard_io(reader.read(&mut buf[filled..], cancel)).await?;
            if n == 0 {
                return Err(Error::Transport(unexpected_eof()));
            }
            filled += n;
        }
        Ok(())
    }

    /// Consumes one control frame entirely before the next caller-visible
    /// read.
    async fn process_control(
        &self,
        recv: &mut RecvState<R>,
        header: &FrameHeader,
        cancel: &CancellationToken,
    ) -> Result<ControlOutcome, Error> {
        let len = header.payload_len as usize;
        let key = header.mask_or_zero();
        match header.opcode {
            OpCode::Close => {
                let take = len.min(2);
                self.read_exact(&mut recv.reader, &mut recv.in_close[..take], cancel).await?;
                mask_in_place(&mut recv.in_close[..take], key, 0);
                let reason = if take == 2 {
                    CloseReason::from(u16::from_be_bytes([recv.in_close[0], recv.in_close[1]]))
                } else {
                    CloseReason::NormalClose
                };
                debug!("close frame received: {reason:?}");
                self.close_reason.lock().unwrap().replace(reason);
                let closed = if self.state.transition(CloseState::Open, CloseState::CloseReceived) {
                    false
                } else {
                    self.state.transition(CloseState::CloseSent, CloseState::Closed)
                };
                if closed {
                    let mut write = self.write.lock().await;
                    if let Err(err) = write.writer.close().await {
                        debug!("transport close failed: {err}");
                    }
                }
                Ok(ControlOutcome::CloseFrame)
            }
            OpCode::Ping => {
                let take = len.min(MAX_CONTROL_PAYLOAD);
                self.read_exact(&mut recv.reader, &mut recv.in_ping[..take], cancel).await?;
                mask_in_place(&mut recv.in_ping[..take], key, 0);
                recv.out_pong[HEADER_PREFIX..HEADER_PREFIX + take].copy_from_slice(&recv.in_ping[..take]);
                let mask = self.next_mask_key();
                mask_in_place(&mut recv.out_pong[HEADER_PREFIX..HEADER_PREFIX + take], mask, 0);
                let pong = FrameHeader::outbound(true, OpCode::Pong, take as u64, mask);
                let start = pong.emit(&mut recv.out_pong[..HEADER_PREFIX]);
                self.send_slice(
                    &recv.out_pong[start..HEADER_PREFIX + take],
                    SendOptions::new().no_errors(),
                    cancel,
                )
                .await?;
                Ok(ControlOutcome::Handled)
            }
            OpCode::Pong => {
                let take = len.min(MAX_CONTROL_PAYLOAD);
                self.read_exact(&mut recv.reader, &mut recv.in_pong[..take], cancel).await?;
                mask_in_place(&mut recv.in_pong[..take], key, 0);
                if let Some(latency) = self.handler.notify_pong(&recv.in_pong[..take], current_time_nanos()) {
                    self.latency_nanos.store(latency, Ordering::Release);
                }
                Ok(ControlOutcome::Handled)
            }
            _ => Err(Error::Protocol("data op code in control path")),
        }
    }

    /// Writes one complete frame to the transport under the write permit.
    async fn send_slice(&self, frame: &[u8], options: SendOptions, cancel: &CancellationToken) -> Result<bool, Error> {
        let permit = if options.no_lock {
            None
        } else {
            match self.acquire_permit(options.lock_timeout, cancel).await {
                Ok(Some(permit)) => Some(permit),
                Ok(None) => return Ok(false),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    return if options.no_errors { Ok(false) } else { Err(err) };
                }
            }
        };
        if !options.ignore_close && !self.can_send() {
            return if options.no_errors {
                Ok(false)
            } else {
                Err(Error::State("send after close"))
            };
        }

        let mut write = self.write.lock().await;
        let written = self.guard_io(write.writer.write(frame, cancel)).await;
        drop(write);
        drop(permit);

        match written {
            Ok(()) => Ok(true),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) if options.no_errors => {
                warn!("frame send failed: {err}");
                Ok(false)
            }
            Err(err) => {
                self.initiate_close(CloseReason::UnexpectedCondition, cancel).await;
                Err(err)
            }
        }
    }

    async fn acquire_permit(
        &self,
        timeout: LockTimeout,
        cancel: &CancellationToken,
    ) -> Result<Option<SemaphorePermit<'_>>, Error> {
        match timeout {
            LockTimeout::NoWait => match self.write_permit.try_acquire() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Ok(None),
                Err(TryAcquireError::Closed) => Err(Error::State("connection disposed")),
            },
            LockTimeout::Infinite => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => Err(Error::State("connection disposed")),
                permit = self.write_permit.acquire() => {
                    permit.map(Some).map_err(|_| Error::State("connection disposed"))
                }
            },
            LockTimeout::After(duration) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => Err(Error::State("connection disposed")),
                acquired = tokio::time::timeout(duration, self.write_permit.acquire()) => match acquired {
                    Ok(permit) => permit.map(Some).map_err(|_| Error::State("connection disposed")),
                    Err(_) => Ok(None),
                }
            },
        }
    }

    /// Converts a receive-path failure into a best-effort close, keeping
    /// cancellation and state errors untouched so they surface exactly once.
    async fn fail_receive(&self, err: Error, reason: CloseReason, cancel: &CancellationToken) -> Error {
        match err {
            Error::Cancelled => Error::Cancelled,
            Error::State(state) => Error::State(state),
            err => {
                self.initiate_close(reason, cancel).await;
                err
            }
        }
    }

    async fn initiate_close(&self, reason: CloseReason, cancel: &CancellationToken) {
        if let Err(err) = self.close(reason, cancel).await {
            debug!("close initiation failed: {err}");
        }
    }

    fn next_mask_key(&self) -> [u8; 4] {
        if !self.mask_outbound {
            return [0u8; 4];
        }
        let mut rng = thread_rng();
        loop {
            let key: u32 = rng.gen();
            if key != 0 {
                return key.to_be_bytes();
            }
        }
    }
}

impl<R, W> Drop for Connection<R, W> {
    fn drop(&mut self) {
        self.state.dispose();
        let send_buf = self.send_buf.get_mut();
        let data = mem::take(&mut send_buf.data);
        if !data.is_empty() {
            self.pool.release(data);
        }
        let recv = self.recv.get_mut();
        mem::take(&mut recv.header_scratch);
        mem::take(&mut recv.in_ping);
        mem::take(&mut recv.in_pong);
        mem::take(&mut recv.in_close);
        mem::take(&mut recv.out_pong);
        mem::take(&mut self.ping.get_mut().out_ping);
        mem::take(&mut self.write.get_mut().out_close);
        if let Some(raw) = self.block.get_mut().unwrap().take() {
            // Safety: exclusive access; every carved slice was emptied above
            let block = unsafe { reassemble_control_block(raw) };
            self.pool.release(block);
        }
    }
}

/// Exclusive access to the send buffer for writing one or more frames.
///
/// Obtained through [`Connection::begin_write`]; dropping it releases the
/// write exclusion. Fill [`Self::payload_mut`], then [`Self::prepare_frame`]
/// and [`Self::send`].
pub struct FrameWriter<'a, R, W> {
    conn: &'a Connection<R, W>,
    buf: tokio::sync::MutexGuard<'a, SendBuf>,
    frame: Option<Range<usize>>,
}

impl<R, W> std::fmt::Debug for FrameWriter<'_, R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").field("frame", &self.frame).finish()
    }
}

impl<R: TransportRead, W: TransportWrite> FrameWriter<'_, R, W> {
    /// Usable payload capacity of the send buffer.
    pub fn capacity(&self) -> usize {
        self.buf.data.len() - HEADER_PREFIX
    }

    /// Payload area of the send buffer, directly after the reserved header
    /// prefix.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf.data[HEADER_PREFIX..]
    }

    /// Serializes a frame in place: emits the header into the reserved
    /// prefix immediately before the payload and masks the payload without
    /// copying it. With `header_sent` the frame goes out as a continuation
    /// of a fragmented message.
    pub fn prepare_frame(
        &mut self,
        len: usize,
        fin: bool,
        header_sent: bool,
        opcode: OpCode,
        rsv: u8,
    ) -> Result<(), Error> {
        if len > self.capacity() {
            return Err(Error::State("payload exceeds send buffer"));
        }
        if rsv & !self.conn.options.permitted_rsv != 0 {
            return Err(Error::Protocol("reserved extension bits set"));
        }
        let opcode = if header_sent { OpCode::Continuation } else { opcode };
        let mask = self.conn.next_mask_key();
        let header = FrameHeader::outbound(fin, opcode, len as u64, mask).with_rsv(rsv);
        let data = &mut self.buf.data;
        mask_in_place(&mut data[HEADER_PREFIX..HEADER_PREFIX + len], mask, 0);
        let start = header.emit(&mut data[..HEADER_PREFIX]);
        self.frame = Some(start..HEADER_PREFIX + len);
        Ok(())
    }

    /// Sends the prepared frame. Returns false when the send was skipped,
    /// either by a contended no-wait permit or by `no_errors` swallowing a
    /// failure.
    pub async fn send(&mut self, options: SendOptions, cancel: &CancellationToken) -> Result<bool, Error> {
        let frame = self.frame.take().ok_or(Error::State("no frame prepared"))?;
        self.conn.send_slice(&self.buf.data[frame], options, cancel).await
    }
}

impl<R, W> Drop for FrameWriter<'_, R, W> {
    fn drop(&mut self) {
        self.conn.writing.store(false, Ordering::Release);
    }
}

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed mid frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::VecBufferPool;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    type TestConnection = Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pool() -> Arc<VecBufferPool> {
        Arc::new(VecBufferPool::new())
    }

    fn pair(options: Options) -> (TestConnection, TestConnection) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let client = Connection::new(near, Role::Client, options, pool());
        let server = Connection::new(far, Role::Server, options, pool());
        (client, server)
    }

    fn server_with_raw_peer(options: Options) -> (TestConnection, DuplexStream) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let server = Connection::new(near, Role::Server, options, pool());
        (server, far)
    }

    fn build_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let header = FrameHeader::outbound(fin, opcode, payload.len() as u64, mask);
        let mut prefix = [0u8; 16];
        let start = header.emit(&mut prefix);
        let mut frame = prefix[start..].to_vec();
        let at = frame.len();
        frame.extend_from_slice(payload);
        mask_in_place(&mut frame[at..], header.mask_or_zero(), 0);
        frame
    }

    async fn read_raw_frame(stream: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
        let mut start = [0u8; 2];
        stream.read_exact(&mut start).await.unwrap();
        let total = wire_header_length(start[1]);
        let mut bytes = vec![0u8; total];
        bytes[..2].copy_from_slice(&start);
        stream.read_exact(&mut bytes[2..]).await.unwrap();
        let header = FrameHeader::parse(&bytes, 0x07).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        mask_in_place(&mut payload, header.mask_or_zero(), 0);
        (header, payload)
    }

    async fn receive_all(conn: &TestConnection, len: usize, cancel: &CancellationToken) -> Vec<u8> {
        let mut collected = vec![0u8; len];
        let mut at = 0;
        while at < len {
            let n = conn.receive(&mut collected[at..], cancel).await.unwrap();
            assert!(n > 0, "receive returned no bytes mid frame");
            at += n;
        }
        conn.dispose_header_if_finished();
        collected
    }

    #[tokio::test]
    async fn should_round_trip_binary_frames_between_peers() {
        let options = Options::default().send_buffer_size(70_000);
        let (client, server) = pair(options);
        let cancel = CancellationToken::new();

        for len in [0usize, 1, 125, 126, 127, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let send = async {
                let mut writer = client.begin_write().unwrap();
                writer.payload_mut()[..len].copy_from_slice(&payload);
                writer.prepare_frame(len, true, false, OpCode::Binary, 0).unwrap();
                assert!(writer.send(SendOptions::new(), &cancel).await.unwrap());
            };
            let recv = async {
                let header = server.await_header(&cancel).await.unwrap().unwrap();
                assert_eq!(OpCode::Binary, header.opcode);
                assert!(header.fin);
                assert!(header.masked, "client frames must be masked");
                assert_eq!(len as u64, header.payload_len);
                receive_all(&server, len, &cancel).await
            };
            let ((), received) = tokio::join!(send, recv);
            assert_eq!(payload, received);
            assert!(server.current_header().is_none());
        }
    }

    #[tokio::test]
    async fn should_unmask_known_client_frame() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&[0x81, 0x82, 0x37, 0xFA, 0x21, 0x3D, 0x48 ^ 0x37, 0x69 ^ 0xFA])
            .await
            .unwrap();

        let header = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Text, header.opcode);
        assert_eq!(2, header.payload_len);
        assert_eq!([0x37, 0xFA, 0x21, 0x3D], header.mask);
        let text = receive_all(&server, 2, &cancel).await;
        assert_eq!(b"Hi", text.as_slice());
    }

    #[tokio::test]
    async fn should_surface_fragment_headers_in_sequence() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&build_frame(false, OpCode::Binary, &[1, 2, 3], [9, 8, 7, 6]))
            .await
            .unwrap();
        peer.write_all(&build_frame(true, OpCode::Continuation, &[4, 5], [5, 4, 3, 2]))
            .await
            .unwrap();

        let first = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Binary, first.opcode);
        assert!(!first.fin);
        assert_eq!(vec![1, 2, 3], receive_all(&server, 3, &cancel).await);

        let second = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Continuation, second.opcode);
        assert!(second.fin);
        assert_eq!(vec![4, 5], receive_all(&server, 2, &cancel).await);
    }

    #[tokio::test]
    async fn should_answer_ping_between_fragments_without_disturbing_payload() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        let part1: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
        let part2: Vec<u8> = (500..1000u32).map(|i| (i % 256) as u8).collect();
        peer.write_all(&build_frame(false, OpCode::Binary, &part1, [1, 2, 3, 4]))
            .await
            .unwrap();
        peer.write_all(&build_frame(true, OpCode::Ping, b"ABCD", [9, 9, 9, 9]))
            .await
            .unwrap();
        peer.write_all(&build_frame(true, OpCode::Continuation, &part2, [4, 3, 2, 1]))
            .await
            .unwrap();

        let first = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(500, first.payload_len);
        assert_eq!(part1, receive_all(&server, 500, &cancel).await);

        // the ping sits between the fragments and is answered while the
        // caller only observes the next data header
        let second = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Continuation, second.opcode);
        assert_eq!(part2, receive_all(&server, 500, &cancel).await);

        let (pong, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Pong, pong.opcode);
        assert!(!pong.masked, "server frames go out unmasked");
        assert_eq!(b"ABCD", payload.as_slice());
    }

    #[tokio::test]
    async fn should_echo_empty_ping_with_empty_pong() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&build_frame(true, OpCode::Ping, &[], [1, 1, 1, 1]))
            .await
            .unwrap();
        peer.write_all(&build_frame(true, OpCode::Binary, &[7], [1, 2, 3, 4]))
            .await
            .unwrap();

        let header = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Binary, header.opcode);

        let (pong, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Pong, pong.opcode);
        assert_eq!(0, pong.payload_len);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn should_complete_close_handshake_initiated_by_peer() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&build_frame(true, OpCode::Close, &1000u16.to_be_bytes(), [1, 2, 3, 4]))
            .await
            .unwrap();

        assert!(server.await_header(&cancel).await.unwrap().is_none());
        assert_eq!(CloseState::CloseReceived, server.state());
        assert_eq!(Some(CloseReason::NormalClose), server.close_reason());
        assert!(!server.can_receive());
        assert!(server.can_send());

        // the answering close frame is only sent on explicit close
        server.close(CloseReason::NormalClose, &cancel).await.unwrap();
        assert_eq!(CloseState::Closed, server.state());
        assert!(server.is_closed());

        let (close, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Close, close.opcode);
        assert_eq!(1000, u16::from_be_bytes([payload[0], payload[1]]));
    }

    #[tokio::test]
    async fn should_not_answer_close_frame_automatically() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&build_frame(true, OpCode::Close, &1000u16.to_be_bytes(), [1, 2, 3, 4]))
            .await
            .unwrap();
        assert!(server.await_header(&cancel).await.unwrap().is_none());

        let mut byte = [0u8; 1];
        let reply = timeout(Duration::from_millis(50), AsyncReadExt::read(&mut peer, &mut byte)).await;
        assert!(reply.is_err(), "no close reply may be sent before local close");
    }

    #[tokio::test]
    async fn should_default_close_reason_when_close_frame_has_no_payload() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        peer.write_all(&build_frame(true, OpCode::Close, &[], [1, 2, 3, 4]))
            .await
            .unwrap();
        assert!(server.await_header(&cancel).await.unwrap().is_none());
        assert_eq!(Some(CloseReason::NormalClose), server.close_reason());
        assert_eq!(CloseState::CloseReceived, server.state());
    }

    #[tokio::test]
    async fn should_close_with_protocol_error_on_bad_length_encoding() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        let mut frame = vec![0x82, 127];
        frame.extend_from_slice(&(1u64 << 63 | 16).to_be_bytes());
        peer.write_all(&frame).await.unwrap();

        let err = server.await_header(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(CloseState::CloseSent, server.state());

        let (close, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Close, close.opcode);
        assert_eq!(1002, u16::from_be_bytes([payload[0], payload[1]]));
    }

    #[tokio::test]
    async fn should_reject_concurrent_readers() {
        let (server, _peer) = server_with_raw_peer(Options::default());
        let server = Arc::new(server);
        let cancel = CancellationToken::new();

        let pending = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.await_header(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = server.await_header(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::State("concurrent read attempt")));

        cancel.cancel();
        let first = pending.await.unwrap();
        assert!(matches!(first, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn should_reject_concurrent_writers() {
        let (server, _peer) = server_with_raw_peer(Options::default());

        let writer = server.begin_write().unwrap();
        let err = server.begin_write().unwrap_err();
        assert!(matches!(err, Error::State("concurrent write attempt")));

        // dropping the writer ends the write
        drop(writer);
        assert!(server.begin_write().is_ok());
    }

    #[tokio::test]
    async fn should_require_prepared_frame_before_send() {
        let (server, _peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        let mut writer = server.begin_write().unwrap();
        let err = writer.send(SendOptions::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::State("no frame prepared")));
    }

    #[tokio::test]
    async fn should_reject_send_after_close_unless_ignored() {
        let (client, server) = pair(Options::default());
        let cancel = CancellationToken::new();

        client.close(CloseReason::NormalClose, &cancel).await.unwrap();
        assert_eq!(CloseState::CloseSent, client.state());
        assert!(!client.can_send());

        let mut writer = client.begin_write().unwrap();
        writer.prepare_frame(0, true, false, OpCode::Binary, 0).unwrap();
        let err = writer.send(SendOptions::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::State("send after close")));

        writer.prepare_frame(0, true, false, OpCode::Binary, 0).unwrap();
        assert!(writer.send(SendOptions::new().ignore_close(), &cancel).await.unwrap());

        drop(writer);
        drop(server);
    }

    #[tokio::test]
    async fn should_send_staged_manual_ping_payload() {
        let options = Options::default()
            .ping_mode(PingMode::Manual)
            .ping_timeout(Some(Duration::from_secs(60)));
        let (client, mut peer) = {
            let (near, far) = tokio::io::duplex(4096);
            (Connection::new(near, Role::Client, options, pool()), far)
        };
        let cancel = CancellationToken::new();

        client.ping(b"abc", &cancel).await.unwrap();
        let (ping, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Ping, ping.opcode);
        assert!(ping.masked);
        assert_eq!(b"abc", payload.as_slice());

        // staged payload survives masking for the next tick
        client.ping(b"abc", &cancel).await.unwrap();
        let (_, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(b"abc", payload.as_slice());
    }

    #[tokio::test]
    async fn should_measure_latency_from_pong_echo() {
        let options = Options::default().ping_mode(PingMode::LatencyControl);
        let (client, mut peer) = {
            let (near, far) = tokio::io::duplex(4096);
            (Connection::new(near, Role::Client, options, pool()), far)
        };
        let cancel = CancellationToken::new();
        assert_eq!(Duration::MAX, client.latency());

        client.ping(&[], &cancel).await.unwrap();
        let (ping, payload) = read_raw_frame(&mut peer).await;
        assert_eq!(OpCode::Ping, ping.opcode);
        assert_eq!(8, payload.len());

        // echo the timestamp back, then a data frame so the header wait ends
        peer.write_all(&build_frame(true, OpCode::Pong, &payload, [0, 0, 0, 0]))
            .await
            .unwrap();
        peer.write_all(&build_frame(true, OpCode::Binary, &[1], [0, 0, 0, 0]))
            .await
            .unwrap();

        let header = client.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(OpCode::Binary, header.opcode);
        assert_ne!(Duration::MAX, client.latency());
    }

    #[tokio::test]
    async fn should_dispose_on_latency_ping_timeout() {
        let options = Options::default()
            .ping_mode(PingMode::LatencyControl)
            .ping_interval(Duration::from_millis(10))
            .ping_timeout(Some(Duration::from_millis(50)));
        let (client, _server) = pair(options);
        let cancel = CancellationToken::new();

        tokio::time::sleep(Duration::from_millis(80)).await;
        client.ping(&[], &cancel).await.unwrap();

        assert_eq!(CloseState::Disposed, client.state());
        assert_eq!(Duration::MAX, client.latency());
        assert!(client.await_header(&cancel).await.is_err());
    }

    struct CountingPool {
        inner: VecBufferPool,
        released: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn acquire(&self, size: usize) -> Vec<u8> {
            self.inner.acquire(size)
        }

        fn release(&self, buffer: Vec<u8>) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release(buffer);
        }
    }

    #[tokio::test]
    async fn should_release_both_buffers_to_pool_exactly_once() {
        let pool = Arc::new(CountingPool {
            inner: VecBufferPool::new(),
            released: AtomicUsize::new(0),
        });
        let (near, _far) = tokio::io::duplex(4096);
        let conn = Connection::new(near, Role::Client, Options::default(), Arc::clone(&pool) as Arc<dyn BufferPool>);

        conn.dispose().await;
        assert_eq!(2, pool.released.load(Ordering::SeqCst));

        // idempotent, including the drop that follows
        conn.dispose().await;
        assert_eq!(2, pool.released.load(Ordering::SeqCst));
        drop(conn);
        assert_eq!(2, pool.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_release_buffers_on_drop_without_dispose() {
        let pool = Arc::new(CountingPool {
            inner: VecBufferPool::new(),
            released: AtomicUsize::new(0),
        });
        let (near, _far) = tokio::io::duplex(4096);
        let conn = Connection::new(near, Role::Client, Options::default(), Arc::clone(&pool) as Arc<dyn BufferPool>);
        drop(conn);
        assert_eq!(2, pool.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_track_frame_remaining_through_partial_receives() {
        let (server, mut peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();

        let payload: Vec<u8> = (0..64u8).collect();
        peer.write_all(&build_frame(true, OpCode::Binary, &payload, [1, 2, 3, 4]))
            .await
            .unwrap();

        let header = server.await_header(&cancel).await.unwrap().unwrap();
        assert_eq!(64, header.remaining);

        let mut chunk = [0u8; 24];
        let mut collected = Vec::new();
        while collected.len() < 64 {
            let n = server.receive(&mut chunk, &cancel).await.unwrap();
            collected.extend_from_slice(&chunk[..n]);
            let remaining = server.current_header().unwrap().remaining;
            assert_eq!(64 - collected.len() as i64, remaining);
        }
        assert_eq!(payload, collected);

        // the frame boundary is never crossed
        assert_eq!(0, server.receive(&mut chunk, &cancel).await.unwrap());
        server.dispose_header_if_finished();
        assert!(server.current_header().is_none());
    }

    #[tokio::test]
    async fn should_fail_receive_before_header() {
        let (server, _peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 8];
        let err = server.receive(&mut buf, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::State("no frame in progress")));
    }

    #[tokio::test]
    async fn should_return_none_when_transport_ends_cleanly() {
        let (server, peer) = server_with_raw_peer(Options::default());
        let cancel = CancellationToken::new();
        drop(peer);
        assert!(server.await_header(&cancel).await.unwrap().is_none());
    }
}
