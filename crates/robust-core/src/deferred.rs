use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Misuse of a [`DeferredIterable`]. `Reused` is a caller programming error
/// and fails fast; `Aborted` carries a mid-stream producer failure.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum IterError {
    #[error("iterable may not be reused")]
    Reused,
    #[error("progress before a consumption mode was chosen")]
    NotStarted,
    #[error("iteration aborted: {0}")]
    Aborted(String),
}

enum Mode<T, R> {
    ForEach(Box<dyn FnMut(T) + Send>),
    Map {
        f: Box<dyn FnMut(T) -> R + Send>,
        buffer: Vec<R>,
    },
}

struct Inner<T, R> {
    started: bool,
    settled: bool,
    mode: Option<Mode<T, R>>,
    tx: Option<oneshot::Sender<Result<Vec<R>, IterError>>>,
    rx: Option<oneshot::Receiver<Result<Vec<R>, IterError>>>,
}

/// A single-resolution future that can be driven item-by-item before final
/// settlement. The consumer picks exactly one mode (`for_each` or `map`) on
/// first use; the producer then pushes items with `progress` and finishes
/// with `resolve` or `reject`. Clones share state, so the producer side
/// holds a clone while the consumer awaits the [`Completion`].
pub struct DeferredIterable<T, R = ()> {
    inner: Arc<Mutex<Inner<T, R>>>,
}

impl<T, R> Clone for DeferredIterable<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> Default for DeferredIterable<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> DeferredIterable<T, R> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                started: false,
                settled: false,
                mode: None,
                tx: Some(tx),
                rx: Some(rx),
            })),
        }
    }

    /// Consume with a side-effecting callback. The completion resolves with
    /// no accumulated items.
    pub fn for_each<F>(&self, f: F) -> Result<Completion<R>, IterError>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.start(Mode::ForEach(Box::new(f)))
    }

    /// Consume by mapping each item; the completion resolves with the mapped
    /// values in production order.
    pub fn map<F>(&self, f: F) -> Result<Completion<R>, IterError>
    where
        F: FnMut(T) -> R + Send + 'static,
    {
        self.start(Mode::Map {
            f: Box::new(f),
            buffer: Vec::new(),
        })
    }

    fn start(&self, mode: Mode<T, R>) -> Result<Completion<R>, IterError> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Err(IterError::Reused);
        }
        inner.started = true;
        inner.mode = Some(mode);
        // rx is always present until first start; started guards reuse.
        let rx = inner.rx.take().ok_or(IterError::Reused)?;
        Ok(Completion { rx })
    }

    /// Push one produced item. Errors if no mode has been chosen yet;
    /// silently ignored once the iterable has settled.
    pub fn progress(&self, item: T) -> Result<(), IterError> {
        let mut inner = self.inner.lock();
        if inner.settled {
            return Ok(());
        }
        match inner.mode.as_mut() {
            None => Err(IterError::NotStarted),
            Some(Mode::ForEach(f)) => {
                f(item);
                Ok(())
            }
            Some(Mode::Map { f, buffer }) => {
                let mapped = f(item);
                buffer.push(mapped);
                Ok(())
            }
        }
    }

    /// End of data: settle in the chosen mode. No-op if already settled.
    pub fn resolve(&self) {
        let mut inner = self.inner.lock();
        if inner.settled {
            return;
        }
        inner.settled = true;
        let buffer = match inner.mode.take() {
            Some(Mode::Map { buffer, .. }) => buffer,
            _ => Vec::new(),
        };
        if let Some(tx) = inner.tx.take() {
            let _ = tx.send(Ok(buffer));
        }
    }

    /// Mid-stream failure: settle with an error. Later progress calls are
    /// ignored.
    pub fn reject(&self, detail: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.settled {
            return;
        }
        inner.settled = true;
        inner.mode = None;
        if let Some(tx) = inner.tx.take() {
            let _ = tx.send(Err(IterError::Aborted(detail.into())));
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled
    }
}

/// The final resolution of a [`DeferredIterable`]. For-each completions
/// resolve with an empty vec; map completions carry the accumulated items.
pub struct Completion<R> {
    rx: oneshot::Receiver<Result<Vec<R>, IterError>>,
}

impl<R> Completion<R> {
    pub async fn wait(self) -> Result<Vec<R>, IterError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(IterError::Aborted("producer dropped".into())))
    }
}
