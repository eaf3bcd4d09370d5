use super::PushSink;
use crate::error::RuntimeError;
use crate::gate::{Gate, Wake};
use crate::host_loop::HostLoop;
use bytes::BytesMut;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

struct ReadState<R> {
    host: HostLoop,
    sink: Rc<dyn PushSink>,
    /// Native source; taken by the pump once it starts
    reader: RefCell<Option<R>>,
    chunk_size: usize,
    pumping: Cell<bool>,
    destroyed: Cell<bool>,
    /// Terminal signal (end or error) already delivered
    finished: Cell<bool>,
    /// Parks the pump while the sink is full
    backpressure: Gate,
    /// Parks the pump until a reader is attached
    ready: Gate,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl<R> ReadState<R> {
    fn finish(&self, error: Option<RuntimeError>) {
        if self.finished.replace(true) {
            if let Some(error) = error {
                tracing::warn!("Dropping error on finished stream: {}", error);
            }
            return;
        }
        self.destroyed.set(true);
        self.backpressure.close();
        self.ready.close();
        match error {
            None => self.sink.end(),
            Some(error) => self.sink.fail(error),
        }
    }
}

/// Pumps a native reader into a push sink.
///
/// At most one pump runs per adapter. [`request`](Self::request) starts it
/// or, if it is already running, resumes it from backpressure.
pub struct ReadableAdapter<R> {
    state: Rc<ReadState<R>>,
}

impl<R> Clone for ReadableAdapter<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<R: AsyncRead + Unpin + 'static> ReadableAdapter<R> {
    /// Adapter with no reader yet; the pump waits for [`attach`](Self::attach).
    pub fn new(host: HostLoop, sink: Rc<dyn PushSink>, chunk_size: usize) -> Self {
        Self {
            state: Rc::new(ReadState {
                host,
                sink,
                reader: RefCell::new(None),
                chunk_size: chunk_size.max(1),
                pumping: Cell::new(false),
                destroyed: Cell::new(false),
                finished: Cell::new(false),
                backpressure: Gate::new(),
                ready: Gate::new(),
                task: RefCell::new(None),
            }),
        }
    }

    pub fn with_reader(host: HostLoop, sink: Rc<dyn PushSink>, chunk_size: usize, reader: R) -> Self {
        let adapter = Self::new(host, sink, chunk_size);
        adapter.attach(reader);
        adapter
    }

    /// Supply the native source (e.g. once a socket connects).
    pub fn attach(&self, reader: R) {
        if self.state.destroyed.get() {
            return;
        }
        *self.state.reader.borrow_mut() = Some(reader);
        self.state.ready.signal();
    }

    /// The consumer wants data: start the pump, or resume a paused one.
    pub fn request(&self) {
        let state = &self.state;
        if state.destroyed.get() {
            return;
        }
        if state.pumping.get() {
            state.backpressure.signal();
            return;
        }
        state.pumping.set(true);
        let handle = state.host.spawn(pump(state.clone()));
        *state.task.borrow_mut() = Some(handle);
    }

    /// Stop pumping and release a parked pump. No terminal signal is sent.
    pub fn destroy(&self) {
        let state = &self.state;
        if state.destroyed.replace(true) {
            return;
        }
        state.finished.set(true);
        state.backpressure.close();
        state.ready.close();
        state.reader.borrow_mut().take();
        if let Some(task) = state.task.borrow_mut().take() {
            task.abort();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.get()
    }

    pub fn is_pumping(&self) -> bool {
        self.state.pumping.get() && !self.state.destroyed.get()
    }
}

async fn pump<R: AsyncRead + Unpin + 'static>(state: Rc<ReadState<R>>) {
    let mut reader = loop {
        if state.destroyed.get() {
            return;
        }
        if let Some(reader) = state.reader.borrow_mut().take() {
            break reader;
        }
        if state.ready.wait().await == Wake::Closed {
            return;
        }
    };

    let mut buf = BytesMut::with_capacity(state.chunk_size);
    loop {
        if state.destroyed.get() {
            return;
        }
        buf.reserve(state.chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::trace!("readable pump reached end of stream");
                state.finish(None);
                return;
            }
            Ok(n) => {
                if state.destroyed.get() {
                    return;
                }
                tracing::trace!("readable pump forwarding {} bytes", n);
                let chunk = buf.split().freeze();
                if !state.sink.push(chunk) && state.backpressure.wait().await == Wake::Closed {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!("readable pump failed: {}", err);
                state.finish(Some(RuntimeError::Io(err)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::task::LocalSet;

    /// Yields pre-defined chunks one per read, then EOF (or an error).
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
        fail_at_end: bool,
    }

    impl AsyncRead for ChunkReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                None if self.fail_at_end => Poll::Ready(Err(std::io::Error::other("reset"))),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        chunks: RefCell<Vec<Vec<u8>>>,
        ends: Cell<usize>,
        errors: RefCell<Vec<String>>,
    }

    impl PushSink for Recorder {
        fn push(&self, chunk: bytes::Bytes) -> bool {
            self.chunks.borrow_mut().push(chunk.to_vec());
            true
        }

        fn end(&self) {
            self.ends.set(self.ends.get() + 1);
        }

        fn fail(&self, error: RuntimeError) {
            self.errors.borrow_mut().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_error_is_delivered_once() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let sink = Rc::new(Recorder::default());
                let reader = ChunkReader {
                    chunks: VecDeque::from([b"abc".to_vec()]),
                    fail_at_end: true,
                };
                let adapter = ReadableAdapter::with_reader(host.clone(), sink.clone(), 64, reader);
                adapter.request();
                adapter.request();
                host.run().await;

                assert_eq!(*sink.chunks.borrow(), vec![b"abc".to_vec()]);
                assert_eq!(sink.errors.borrow().len(), 1);
                assert_eq!(sink.ends.get(), 0);
                assert!(adapter.is_destroyed());
            })
            .await;
    }

    #[tokio::test]
    async fn test_destroy_before_attach() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let host = HostLoop::new();
                let sink = Rc::new(Recorder::default());
                let adapter: ReadableAdapter<ChunkReader> = ReadableAdapter::new(host.clone(), sink.clone(), 64);
                adapter.request();
                adapter.destroy();
                host.run().await;
                assert!(sink.chunks.borrow().is_empty());
                assert_eq!(sink.ends.get(), 0);
            })
            .await;
    }
}
