use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use robust_core::ids::ConnectionId;

use crate::error::TransportError;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Liveness tuning. The idle window is how long the peer may stay silent
/// before we probe it; the probe window is how long we wait for any frame
/// after probing before declaring the peer dead.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    pub recv_timeout: Duration,
    pub wait_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(45),
            wait_timeout: Duration::from_secs(15),
        }
    }
}

/// Lifecycle of a single connection attempt. There is no internal retry;
/// a manager that reaches `Closed` stays there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callbacks composed in by the owner. All of them run on the io task (or
/// the `open` caller for pre-open transitions), so they must not block.
#[derive(Default)]
pub struct ConnectionHooks {
    pub on_connecting: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_open: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_closing: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_close: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_frame: Option<Box<dyn Fn(String) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(TransportError) + Send + Sync>>,
}

impl ConnectionHooks {
    fn connecting(&self) {
        if let Some(f) = &self.on_connecting {
            f();
        }
    }

    fn opened(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    fn closing(&self) {
        if let Some(f) = &self.on_closing {
            f();
        }
    }

    fn closed(&self) {
        if let Some(f) = &self.on_close {
            f();
        }
    }

    fn frame(&self, line: String) {
        if let Some(f) = &self.on_frame {
            f(line);
        }
    }

    fn error(&self, err: TransportError) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }
}

/// Queue handle for outbound frames. Cheap to clone and usable before the
/// connection is open; frames queue up and flush once the socket exists.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<String>,
}

impl FrameSender {
    /// Queue one frame for delivery. The trailing newline is appended on
    /// the wire, never included here.
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Receiving end of the outbound queue, consumed by [`ConnectionManager::open`].
pub struct FrameReceiver {
    rx: mpsc::Receiver<String>,
}

impl FrameReceiver {
    #[cfg(test)]
    pub(crate) fn into_inner(self) -> mpsc::Receiver<String> {
        self.rx
    }
}

/// Create the outbound frame queue ahead of the connection itself.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Owns one TCP connection carrying newline-delimited frames, plus the
/// two-timer liveness scheme: after `recv_timeout` of inbound silence an
/// empty probe frame is written, and if nothing at all arrives within a
/// further `wait_timeout` the connection is forced closed. Any inbound
/// frame, including an empty one, resets both timers.
pub struct ConnectionManager {
    id: ConnectionId,
    config: ConnectionConfig,
    hooks: Arc<ConnectionHooks>,
    state: Arc<Mutex<ConnState>>,
    outbound: Mutex<Option<FrameReceiver>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, hooks: ConnectionHooks, outbound: FrameReceiver) -> Self {
        Self {
            id: ConnectionId::new(),
            config,
            hooks: Arc::new(hooks),
            state: Arc::new(Mutex::new(ConnState::Idle)),
            outbound: Mutex::new(Some(outbound)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// Connect and start the io task. Resolves once the connection is open;
    /// a pre-open failure moves straight to `Closed` and returns the error.
    /// A manager is single-use: a second call fails with `Reused`.
    pub async fn open(&self, addr: &str) -> Result<(), TransportError> {
        {
            let mut st = self.state.lock();
            if *st != ConnState::Idle {
                return Err(TransportError::Reused);
            }
            *st = ConnState::Connecting;
        }
        self.hooks.connecting();
        debug!(conn = %self.id, %addr, "connecting");

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = TransportError::Connect(e.to_string());
                *self.state.lock() = ConnState::Closed;
                self.hooks.error(err.clone());
                return Err(err);
            }
        };

        let rx = match self.outbound.lock().take() {
            Some(rx) => rx,
            None => return Err(TransportError::Reused),
        };

        // close() may have raced the connect; honor it instead of opening.
        let interrupted = {
            let mut st = self.state.lock();
            if *st == ConnState::Connecting {
                *st = ConnState::Open;
                false
            } else {
                *st = ConnState::Closed;
                true
            }
        };
        if interrupted {
            self.hooks.closed();
            return Err(TransportError::Closed);
        }
        self.hooks.opened();
        info!(conn = %self.id, %addr, "connection open");

        tokio::spawn(run_io(
            stream,
            rx,
            self.config,
            Arc::clone(&self.hooks),
            Arc::clone(&self.state),
            self.cancel.clone(),
            self.id.clone(),
        ));
        Ok(())
    }

    /// Orderly shutdown. Idempotent; a no-op unless the connection is
    /// currently connecting or open.
    pub fn close(&self) {
        let fire = {
            let mut st = self.state.lock();
            match *st {
                ConnState::Connecting | ConnState::Open => {
                    *st = ConnState::Closing;
                    true
                }
                _ => false,
            }
        };
        if fire {
            self.hooks.closing();
            self.cancel.cancel();
        }
    }
}

async fn run_io(
    stream: TcpStream,
    mut outbound: FrameReceiver,
    config: ConnectionConfig,
    hooks: Arc<ConnectionHooks>,
    state: Arc<Mutex<ConnState>>,
    cancel: CancellationToken,
    id: ConnectionId,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut idle = Box::pin(sleep(config.recv_timeout));
    let mut probe: Option<std::pin::Pin<Box<Sleep>>> = None;
    let mut error: Option<TransportError> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    // Proof of life: any inbound frame resets both timers.
                    probe = None;
                    idle.as_mut().reset(Instant::now() + config.recv_timeout);
                    hooks.frame(line);
                }
                Ok(None) => {
                    debug!(conn = %id, "peer closed connection");
                    break;
                }
                Err(e) => {
                    error = Some(TransportError::Read(e.to_string()));
                    break;
                }
            },

            frame = outbound.rx.recv() => match frame {
                Some(frame) => {
                    let mut wire = frame.into_bytes();
                    wire.push(b'\n');
                    if let Err(e) = write_half.write_all(&wire).await {
                        error = Some(TransportError::Send(e.to_string()));
                        break;
                    }
                }
                None => break,
            },

            _ = &mut idle, if probe.is_none() => {
                debug!(conn = %id, "peer quiet, probing");
                if let Err(e) = write_half.write_all(b"\n").await {
                    error = Some(TransportError::Send(e.to_string()));
                    break;
                }
                probe = Some(Box::pin(sleep(config.wait_timeout)));
            },

            _ = async {
                match probe.as_mut() {
                    Some(p) => p.as_mut().await,
                    None => std::future::pending().await,
                }
            }, if probe.is_some() => {
                warn!(conn = %id, "no response to liveness probe, closing");
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;

    let was_closing = {
        let mut st = state.lock();
        let was = *st == ConnState::Closing;
        *st = ConnState::Closed;
        was
    };
    if let Some(err) = error {
        hooks.error(err);
    }
    if !was_closing {
        hooks.closing();
    }
    hooks.closed();
    info!(conn = %id, "connection closed");
}
