use crate::error::RuntimeError;
use crate::gate::{Gate, Wake};
use crate::host_loop::HostLoop;
use bytes::{Buf, Bytes};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Completion callback for a write or for finalization.
pub type WriteCallback = Box<dyn FnOnce(Option<&RuntimeError>)>;

enum WriteOp {
    Data(Bytes, WriteCallback),
    Final(WriteCallback),
}

struct WriteState<W> {
    host: HostLoop,
    writer: RefCell<Option<W>>,
    queue: RefCell<VecDeque<WriteOp>>,
    /// Callback of the operation the drain task is performing
    current: RefCell<Option<WriteCallback>>,
    draining: Cell<bool>,
    destroyed: Cell<bool>,
    /// Parks the drain task until a writer is attached
    ready: Gate,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl<W> WriteState<W> {
    /// Fail everything still queued. Final callbacks get `error`, pending
    /// writes get [`RuntimeError::StreamDestroyed`].
    fn fail_queue(&self, error: &RuntimeError) {
        let destroyed = RuntimeError::StreamDestroyed;
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(WriteOp::Data(_, callback)) => callback(Some(&destroyed)),
                Some(WriteOp::Final(callback)) => callback(Some(error)),
                None => break,
            }
        }
    }
}

/// Drains guest writes into a native writer, one write at a time and in
/// order.
pub struct WritableAdapter<W> {
    state: Rc<WriteState<W>>,
}

impl<W> Clone for WritableAdapter<W> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + 'static> WritableAdapter<W> {
    /// Adapter with no writer yet; writes queue until [`attach`](Self::attach).
    pub fn new(host: HostLoop) -> Self {
        Self {
            state: Rc::new(WriteState {
                host,
                writer: RefCell::new(None),
                queue: RefCell::new(VecDeque::new()),
                current: RefCell::new(None),
                draining: Cell::new(false),
                destroyed: Cell::new(false),
                ready: Gate::new(),
                task: RefCell::new(None),
            }),
        }
    }

    pub fn with_writer(host: HostLoop, writer: W) -> Self {
        let adapter = Self::new(host);
        adapter.attach(writer);
        adapter
    }

    pub fn attach(&self, writer: W) {
        if self.state.destroyed.get() {
            return;
        }
        *self.state.writer.borrow_mut() = Some(writer);
        self.state.ready.signal();
    }

    /// Queue `chunk`; `callback` runs once every byte has been accepted.
    pub fn write(&self, chunk: Bytes, callback: WriteCallback) {
        self.enqueue(WriteOp::Data(chunk, callback));
    }

    /// Flush and shut down after pending writes; `callback` runs when done.
    pub fn finish(&self, callback: WriteCallback) {
        self.enqueue(WriteOp::Final(callback));
    }

    fn enqueue(&self, op: WriteOp) {
        let state = &self.state;
        if state.destroyed.get() {
            match op {
                WriteOp::Data(_, callback) | WriteOp::Final(callback) => {
                    callback(Some(&RuntimeError::StreamDestroyed))
                }
            }
            return;
        }
        state.queue.borrow_mut().push_back(op);
        if !state.draining.replace(true) {
            let handle = state.host.spawn(drain(state.clone()));
            *state.task.borrow_mut() = Some(handle);
        }
    }

    /// Drop the writer and fail the write in progress along with queued
    /// writes.
    pub fn destroy(&self) {
        let state = &self.state;
        if state.destroyed.replace(true) {
            return;
        }
        state.ready.close();
        state.writer.borrow_mut().take();
        if let Some(task) = state.task.borrow_mut().take() {
            task.abort();
        }
        let current = state.current.borrow_mut().take();
        if let Some(callback) = current {
            callback(Some(&RuntimeError::StreamDestroyed));
        }
        state.fail_queue(&RuntimeError::StreamDestroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.get()
    }

    /// Writes queued but not yet started.
    pub fn pending(&self) -> usize {
        self.state.queue.borrow().len()
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, mut chunk: Bytes) -> std::io::Result<()> {
    while chunk.has_remaining() {
        let n = writer.write(chunk.chunk()).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        tracing::trace!("writable drain accepted {} of {} bytes", n, chunk.remaining());
        chunk.advance(n);
    }
    Ok(())
}

async fn drain<W: AsyncWrite + Unpin + 'static>(state: Rc<WriteState<W>>) {
    let mut writer = loop {
        if state.destroyed.get() {
            return;
        }
        if let Some(writer) = state.writer.borrow_mut().take() {
            break writer;
        }
        if state.ready.wait().await == Wake::Closed {
            return;
        }
    };

    loop {
        let next = state.queue.borrow_mut().pop_front();
        let Some(op) = next else { break };
        let result = match op {
            WriteOp::Data(chunk, callback) => {
                *state.current.borrow_mut() = Some(callback);
                write_all(&mut writer, chunk).await
            }
            WriteOp::Final(callback) => {
                *state.current.borrow_mut() = Some(callback);
                match writer.flush().await {
                    Ok(()) => writer.shutdown().await,
                    Err(err) => Err(err),
                }
            }
        };
        // Taken by `destroy` while the operation was in progress.
        let Some(callback) = state.current.borrow_mut().take() else {
            return;
        };
        match result {
            Ok(()) => callback(None),
            Err(err) => {
                let error = RuntimeError::Io(err);
                tracing::debug!("writable drain failed: {}", error);
                state.destroyed.set(true);
                state.ready.close();
                callback(Some(&error));
                state.fail_queue(&error);
                state.draining.set(false);
                return;
            }
        }
        if state.destroyed.get() {
            return;
        }
    }

    *state.writer.borrow_mut() = Some(writer);
    state.draining.set(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::task::LocalSet;

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failure_reaches_write_and_final_callbacks() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let adapter = WritableAdapter::with_writer(host.clone(), BrokenPipe);
                let log = Rc::new(RefCell::new(Vec::new()));

                for name in ["write-1", "write-2"] {
                    let log = log.clone();
                    adapter.write(
                        Bytes::from_static(b"data"),
                        Box::new(move |err| log.borrow_mut().push((name, err.map(ToString::to_string)))),
                    );
                }
                let final_log = log.clone();
                adapter.finish(Box::new(move |err| {
                    final_log.borrow_mut().push(("final", err.map(ToString::to_string)))
                }));
                host.run().await;

                let log = log.borrow();
                assert_eq!(log.len(), 3);
                assert_eq!(log[0].0, "write-1");
                assert!(log[0].1.as_deref().is_some_and(|e| e.starts_with("IO error")));
                assert_eq!(log[1], ("write-2", Some("Stream has been destroyed".to_string())));
                assert_eq!(log[2].0, "final");
                assert!(log[2].1.as_deref().is_some_and(|e| e.starts_with("IO error")));
                assert!(adapter.is_destroyed());
            })
            .await;
    }

    struct Stalled;

    impl AsyncWrite for Stalled {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_destroy_fails_write_in_progress() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let adapter = WritableAdapter::with_writer(host.clone(), Stalled);
                let log = Rc::new(RefCell::new(Vec::new()));

                for name in ["w1", "w2"] {
                    let log = log.clone();
                    adapter.write(
                        Bytes::from_static(b"data"),
                        Box::new(move |err| log.borrow_mut().push((name, err.map(ToString::to_string)))),
                    );
                }
                while adapter.pending() > 1 {
                    tokio::task::yield_now().await;
                }
                assert!(log.borrow().is_empty());

                adapter.destroy();
                let destroyed = Some("Stream has been destroyed".to_string());
                assert_eq!(
                    *log.borrow(),
                    vec![("w1", destroyed.clone()), ("w2", destroyed)]
                );
                host.run().await;
                assert_eq!(log.borrow().len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_write_after_destroy() {
        let host = HostLoop::new();
        let adapter: WritableAdapter<tokio::io::Sink> = WritableAdapter::new(host);
        adapter.destroy();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        adapter.write(
            Bytes::from_static(b"late"),
            Box::new(move |err| flag.set(matches!(err, Some(RuntimeError::StreamDestroyed)))),
        );
        assert!(seen.get());
    }
}
