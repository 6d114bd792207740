//! One multiplexed client connection to a single backend.
//!
//! Calls are correlated by a connection-scoped id. A single io task owns
//! both halves of the socket: it writes queued frames, routes responses to
//! their waiting callers, answers server pings and sends its own keep-alive
//! pings.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use skiff_core::{Code, Frame, RequestFrame, ResponseFrame, Status};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::network::codec::FrameCodec;
use crate::network::config::{ClientConfig, KeepAliveConfig};
use crate::network::until;
use crate::service::{CallResult, Request, Response};
use crate::task::OwnedTask;

type PendingMap = DashMap<u64, oneshot::Sender<ResponseFrame>>;

/// Handle to a live connection. Dropping the last handle closes it.
#[derive(Debug)]
pub struct Connection {
    addr: String,
    tx: mpsc::Sender<Frame>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    max_message_size: usize,
    closed: CancellationToken,
    going_away: Arc<AtomicBool>,
    io: Mutex<Option<OwnedTask>>,
}

impl Connection {
    /// Opens a TCP connection to `addr`, bounded by `dial_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the connect error, or [`io::ErrorKind::TimedOut`] if the dial
    /// timeout elapses first.
    pub async fn connect(addr: &str, config: &ClientConfig) -> io::Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {addr} timed out after {:?}", config.dial_timeout),
                )
            })??;
        stream.set_nodelay(true)?;

        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let pending = Arc::new(PendingMap::new());
        let closed = CancellationToken::new();
        let going_away = Arc::new(AtomicBool::new(false));

        let io_loop = IoLoop {
            addr: addr.to_string(),
            stream,
            rx,
            pending: Arc::clone(&pending),
            closed: closed.clone(),
            going_away: Arc::clone(&going_away),
            keep_alive: config.keep_alive.clone(),
            max_message_size: config.max_message_size,
        };
        let io = OwnedTask::spawn("rpc-client-io", move |cancel| io_loop.run(cancel));
        debug!(addr, "connection established");

        Ok(Arc::new(Self {
            addr: addr.to_string(),
            tx,
            pending,
            next_id: AtomicU64::new(1),
            max_message_size: config.max_message_size,
            closed,
            going_away,
            io: Mutex::new(Some(io)),
        }))
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// `false` once the socket closed or the server sent `GoAway`.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.closed.is_cancelled() && !self.going_away.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Sends `req` and waits for its response or its deadline.
    pub async fn invoke(&self, req: Request) -> CallResult {
        if !self.is_usable() {
            return Err(Status::unavailable(format!(
                "connection to {} is closed",
                self.addr
            )));
        }
        let remaining = req.remaining();
        if remaining.is_some_and(|d| d.is_zero()) {
            return Err(Status::deadline_exceeded(format!(
                "{} deadline passed before sending",
                req.method
            )));
        }
        if req.payload.len() > self.max_message_size {
            return Err(Status::new(
                Code::ResourceExhausted,
                format!(
                    "request of {} bytes exceeds the {} byte limit",
                    req.payload.len(),
                    self.max_message_size
                ),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };

        let deadline = req.deadline;
        let method = req.method;
        let frame = Frame::Request(RequestFrame {
            id,
            method: method.clone(),
            metadata: req.metadata,
            timeout_ms: remaining.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            payload: req.payload.to_vec(),
        });
        if self.tx.send(frame).await.is_err() {
            return Err(Status::unavailable(format!(
                "connection to {} is closed",
                self.addr
            )));
        }

        let reply = match deadline {
            Some(at) => tokio::time::timeout_at(at, reply_rx)
                .await
                .map_err(|_| Status::deadline_exceeded(format!("{method} exceeded its deadline")))?,
            None => reply_rx.await,
        };
        let frame = reply.map_err(|_| {
            Status::unavailable(format!(
                "connection to {} closed before {method} completed",
                self.addr
            ))
        })?;
        let (metadata, payload) = frame.into_result()?;
        Ok(Response {
            metadata,
            payload: Bytes::from(payload),
        })
    }

    /// Closes the socket. Calls still waiting fail with `Unavailable`.
    pub async fn close(&self) {
        let io = self.io.lock().take();
        if let Some(io) = io {
            io.stop().await;
        }
    }
}

/// Removes an abandoned call from the pending map.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

struct IoLoop {
    addr: String,
    stream: TcpStream,
    rx: mpsc::Receiver<Frame>,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
    going_away: Arc<AtomicBool>,
    keep_alive: KeepAliveConfig,
    max_message_size: usize,
}

impl IoLoop {
    async fn run(self, cancel: CancellationToken) {
        let Self {
            addr,
            stream,
            mut rx,
            pending,
            closed,
            going_away,
            keep_alive,
            max_message_size,
        } = self;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(max_message_size));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(max_message_size));

        let mut ping = tokio::time::interval_at(
            Instant::now() + keep_alive.ping_interval,
            keep_alive.ping_interval,
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seq = 0u64;
        // Sequence number and deadline of the unanswered ping.
        let mut awaiting: Option<(u64, Instant)> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(frame) = rx.recv() => {
                    let id = match &frame {
                        Frame::Request(request) => Some(request.id),
                        _ => None,
                    };
                    match (writer.send(frame).await, id) {
                        (Ok(()), _) => {}
                        (Err(e), Some(id)) if e.is_frame_local() => {
                            debug!(%addr, call_id = id, error = %e, "request could not be sent");
                            if let Some((_, reply)) = pending.remove(&id) {
                                let _ = reply.send(ResponseFrame::error(id, &e.status()));
                            }
                        }
                        (Err(e), _) => {
                            warn!(%addr, error = %e, "write failed; closing connection");
                            break;
                        }
                    }
                }
                _ = ping.tick(), if awaiting.is_none() => {
                    seq += 1;
                    if writer.send(Frame::Ping { seq }).await.is_err() {
                        break;
                    }
                    awaiting = Some((seq, Instant::now() + keep_alive.ping_timeout));
                }
                () = until(awaiting.map(|(_, at)| at)) => {
                    warn!(%addr, "keep-alive ping unanswered; closing connection");
                    break;
                }
                frame = reader.next() => match frame {
                    None => {
                        debug!(%addr, "server closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%addr, error = %e, "malformed frame; closing connection");
                        break;
                    }
                    Some(Ok(Frame::Response(resp))) => {
                        if let Some((_, reply)) = pending.remove(&resp.id) {
                            let _ = reply.send(resp);
                        }
                    }
                    Some(Ok(Frame::Pong { seq: answered })) => {
                        if awaiting.is_some_and(|(expected, _)| expected == answered) {
                            awaiting = None;
                        }
                    }
                    Some(Ok(Frame::Ping { seq })) => {
                        if writer.send(Frame::Pong { seq }).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::GoAway { reason })) => {
                        debug!(%addr, %reason, "server sent go-away");
                        going_away.store(true, Ordering::Release);
                    }
                    Some(Ok(Frame::Request(_))) => {
                        debug!(%addr, "ignoring request frame from server");
                    }
                },
            }
        }

        closed.cancel();
        // Waiting callers see their reply sender dropped.
        pending.clear();
        let _ = writer.close().await;
    }
}
