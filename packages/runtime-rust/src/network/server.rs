//! RPC server: listener, per-connection frame loop, graceful stop.
//!
//! Lifecycle:
//! 1. `RpcServer::new()` builds the default interceptor chain
//! 2. `route()` / `unary()` / `intercept()` configure it
//! 3. `start()` binds, starts the accept loop and returns a [`RunningServer`]
//!    carrying the real bound address
//! 4. `RunningServer::stop(deadline)` drains, then forces if needed

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiff_core::{Code, Frame, RequestFrame, ResponseFrame, Status};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::codec::{CodecError, FrameCodec};
use super::config::ServerConfig;
use super::shutdown::{ServingState, ShutdownController};
use super::until;
use crate::service::middleware::LoadShed;
use crate::service::{Chain, ChainError, Handler, Pipeline, Request, Router, Side, Stage};
use crate::task::OwnedTask;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Graceful stop did not finish in time; remaining calls were aborted.
    #[error("graceful stop exceeded {deadline:?}; forced with {in_flight} calls in flight")]
    DeadlineExceeded { deadline: Duration, in_flight: u64 },
}

/// A configured, not yet listening RPC server.
pub struct RpcServer {
    config: ServerConfig,
    chain: Chain,
    router: Router,
}

impl RpcServer {
    /// Creates a server with the default chain (recovery, trace, log,
    /// metric), preceded by a load-shedding stage when
    /// `max_concurrent_calls` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Chain`] if `max_interceptors` is too small for
    /// the default stages.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let mut chain = Chain::with_limit(config.max_interceptors);
        if let Some(max) = config.max_concurrent_calls {
            chain.push(Stage::LoadShed(LoadShed::new(max)))?;
        }
        chain.extend(Chain::server_stages())?;
        Ok(Self {
            config,
            chain,
            router: Router::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Appends a stage after the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TooManyInterceptors`] past `max_interceptors`.
    pub fn intercept(&mut self, stage: Stage) -> Result<&mut Self, ChainError> {
        self.chain.push(stage)?;
        Ok(self)
    }

    pub fn route(&mut self, method: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.router.route(method, handler);
        self
    }

    /// Registers a typed unary handler; see [`Router::unary`].
    pub fn unary<Req, Resp, F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.router.unary(method, f);
        self
    }

    /// Binds the listener and starts serving in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let shutdown = Arc::new(ShutdownController::new());
        let shared = Arc::new(Shared {
            config: self.config,
            pipeline: self.chain.compose(Arc::new(self.router)),
            shutdown: Arc::clone(&shutdown),
        });

        let accept = OwnedTask::spawn_with_token(
            "rpc-accept",
            shutdown.force_token(),
            move |_force| accept_loop(listener, shared),
        );
        shutdown.set_serving();
        info!(%local_addr, "rpc server listening");

        Ok(RunningServer {
            local_addr,
            shutdown,
            accept: Some(accept),
        })
    }
}

/// A serving RPC server. Dropping it forces an immediate stop.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: Arc<ShutdownController>,
    accept: Option<OwnedTask>,
}

impl RunningServer {
    /// Address actually bound, with the OS-assigned port when configured
    /// with port 0.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn state(&self) -> ServingState {
        self.shutdown.state()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shutdown.in_flight_count()
    }

    /// Stops accepting calls and waits up to `deadline` for in-flight calls
    /// to finish and their responses to be written.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::DeadlineExceeded`] if calls were still running
    /// at the deadline. They are aborted and the server is stopped anyway.
    pub async fn stop(mut self, deadline: Duration) -> Result<(), ServerError> {
        let Some(mut accept) = self.accept.take() else {
            return Ok(());
        };
        info!(addr = %self.local_addr, ?deadline, "rpc server draining");
        self.shutdown.begin_drain();

        let result = if tokio::time::timeout(deadline, accept.finished()).await.is_ok() {
            Ok(())
        } else {
            let in_flight = self.shutdown.in_flight_count();
            warn!(addr = %self.local_addr, in_flight, "drain deadline exceeded; forcing stop");
            self.shutdown.force();
            accept.stop().await;
            Err(ServerError::DeadlineExceeded {
                deadline,
                in_flight,
            })
        };
        self.shutdown.mark_stopped();
        info!(addr = %self.local_addr, "rpc server stopped");
        result
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.accept.is_some() {
            self.shutdown.force();
        }
    }
}

struct Shared {
    config: ServerConfig,
    pipeline: Pipeline,
    shutdown: Arc<ShutdownController>,
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let drain = shared.shutdown.drain_token();
    let force = shared.shutdown.force_token();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = drain.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    connections.spawn(serve_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    // Connections finish their in-flight calls, then close themselves.
    loop {
        tokio::select! {
            () = force.cancelled() => {
                connections.abort_all();
                break;
            }
            next = connections.join_next() => {
                if next.is_none() {
                    break;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "set_nodelay failed");
    }
    let keep_alive = &shared.config.keep_alive;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::new(shared.config.max_message_size));
    let mut writer = FramedWrite::new(write_half, FrameCodec::new(shared.config.max_message_size));

    let (tx, mut rx) = mpsc::channel::<Frame>(shared.config.outbound_channel_capacity);
    let drain = shared.shutdown.drain_token();
    let force = shared.shutdown.force_token();
    let mut calls = JoinSet::new();

    let max_age_at = keep_alive.max_connection_age.map(|age| Instant::now() + age);
    let mut close_at: Option<Instant> = None;
    let mut going_away = false;
    let mut last_activity = Instant::now();

    loop {
        let idle_at = calls
            .is_empty()
            .then(|| last_activity + keep_alive.idle_timeout);

        tokio::select! {
            biased;

            () = force.cancelled() => {
                debug!(%peer, aborted = calls.len(), "connection force-closed");
                return;
            }
            Some(frame) = rx.recv() => {
                last_activity = Instant::now();
                if let Err(e) = write_frame(&mut writer, frame).await {
                    warn!(%peer, error = %e, "write failed; closing connection");
                    return;
                }
            }
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(%peer, "call task panicked");
                    }
                }
                if going_away && calls.is_empty() {
                    break;
                }
            }
            () = drain.cancelled(), if !going_away => {
                going_away = true;
                if writer.send(Frame::GoAway { reason: "server shutting down".to_string() }).await.is_err() {
                    return;
                }
                if calls.is_empty() {
                    break;
                }
            }
            () = until(max_age_at), if !going_away => {
                going_away = true;
                close_at = Some(Instant::now() + keep_alive.max_connection_age_grace);
                debug!(%peer, "max connection age reached");
                if writer.send(Frame::GoAway { reason: "max connection age".to_string() }).await.is_err() {
                    return;
                }
                if calls.is_empty() {
                    break;
                }
            }
            () = until(close_at) => {
                debug!(%peer, aborted = calls.len(), "connection age grace elapsed");
                break;
            }
            () = until(idle_at) => {
                debug!(%peer, "idle connection closed");
                break;
            }
            frame = reader.next() => {
                last_activity = Instant::now();
                match frame {
                    None => {
                        debug!(%peer, "peer closed connection");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(%peer, error = %e, "malformed frame; closing connection");
                        return;
                    }
                    Some(Ok(Frame::Request(request))) => {
                        if going_away {
                            let status = Status::unavailable("server is not accepting new calls");
                            let reply = Frame::Response(ResponseFrame::error(request.id, &status));
                            if writer.send(reply).await.is_err() {
                                return;
                            }
                        } else {
                            let guard = shared.shutdown.in_flight_guard();
                            let shared = Arc::clone(&shared);
                            let tx = tx.clone();
                            calls.spawn(async move {
                                let _guard = guard;
                                let reply = dispatch(request, peer, &shared).await;
                                // The connection may already be gone.
                                let _ = tx.send(Frame::Response(reply)).await;
                            });
                        }
                    }
                    Some(Ok(Frame::Ping { seq })) => {
                        if writer.send(Frame::Pong { seq }).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(other)) => debug!(%peer, frame = ?other, "ignoring unexpected frame"),
                }
            }
        }
    }

    // Flush responses that finished just before the loop ended.
    while let Ok(frame) = rx.try_recv() {
        if write_frame(&mut writer, frame).await.is_err() {
            return;
        }
    }
    let _ = writer.close().await;
}

/// Writes one outbound frame. A response that cannot be encoded is replaced
/// by an error response for the same call; only stream failures are fatal.
async fn write_frame(
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    frame: Frame,
) -> Result<(), CodecError> {
    let id = match &frame {
        Frame::Response(response) => Some(response.id),
        _ => None,
    };
    match (writer.send(frame).await, id) {
        (Err(e), Some(id)) if e.is_frame_local() => {
            warn!(call_id = id, error = %e, "response could not be sent; replying with an error");
            writer
                .send(Frame::Response(ResponseFrame::error(id, &e.status())))
                .await
        }
        (result, _) => result,
    }
}

async fn dispatch(frame: RequestFrame, peer: SocketAddr, shared: &Shared) -> ResponseFrame {
    let id = frame.id;
    let mut req = Request::new(Side::Server, frame.method, Bytes::from(frame.payload));
    req.metadata = frame.metadata;
    req.peer = Some(peer.to_string());
    if let Some(ms) = frame.timeout_ms {
        req.deadline = Some(Instant::now() + Duration::from_millis(ms));
    }

    let result = match req.deadline {
        Some(deadline) => {
            let method = req.method.clone();
            tokio::time::timeout_at(deadline, shared.pipeline.handle(req))
                .await
                .unwrap_or_else(|_| {
                    Err(Status::deadline_exceeded(format!(
                        "{method} exceeded its deadline"
                    )))
                })
        }
        None => shared.pipeline.handle(req).await,
    };

    match result {
        Ok(resp) if resp.payload.len() > shared.config.max_message_size => ResponseFrame::error(
            id,
            &Status::new(
                Code::ResourceExhausted,
                format!(
                    "response of {} bytes exceeds the {} byte limit",
                    resp.payload.len(),
                    shared.config.max_message_size
                ),
            ),
        ),
        Ok(resp) => ResponseFrame::ok(id, resp.metadata, resp.payload.to_vec()),
        Err(status) => ResponseFrame::error(id, &status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_reports_ephemeral_port() {
        let server = RpcServer::new(config()).unwrap().start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.state(), ServingState::Serving);
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = RpcServer::new(config()).unwrap().start().await.unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..config()
        };
        let err = RpcServer::new(taken).unwrap().start().await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn load_shed_goes_first_when_capped() {
        let server = RpcServer::new(ServerConfig {
            max_concurrent_calls: Some(8),
            ..config()
        })
        .unwrap();
        assert_eq!(
            server.chain.names(),
            vec!["load_shed", "recovery", "trace", "log", "metric"]
        );
    }

    #[test]
    fn interceptor_limit_is_enforced() {
        let too_small = RpcServer::new(ServerConfig {
            max_interceptors: 3,
            ..config()
        });
        assert!(matches!(too_small, Err(ServerError::Chain(_))));

        let mut server = RpcServer::new(ServerConfig {
            max_interceptors: 5,
            ..config()
        })
        .unwrap();
        server.intercept(Stage::Log(crate::service::middleware::Log)).unwrap();
        assert!(server
            .intercept(Stage::Log(crate::service::middleware::Log))
            .is_err());
    }
}
