//! Readable byte stream used for worker response bodies
//!
//! A stream buffers bytes until someone reads them. Every read takes
//! everything currently buffered; a read that finds nothing waits in a FIFO
//! queue and the next `enqueue` hands its bytes straight to the oldest
//! waiting read. `close` answers every waiting read with `Done`.

use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use super::{RuntimeResult, ServiceWorkerError};

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReadResult {
    Chunk(Vec<u8>),
    Done,
}

impl StreamReadResult {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamReadResult::Done)
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            StreamReadResult::Chunk(bytes) => Some(bytes),
            StreamReadResult::Done => None,
        }
    }
}

pub type ReadCallback = Box<dyn FnOnce(StreamReadResult)>;

/// Source hook invoked with the stream's controller.
pub type StreamOperation = Box<dyn Fn(&ReadableStreamController)>;

#[derive(Default)]
struct StreamState {
    buffered: Vec<u8>,
    pending_reads: VecDeque<ReadCallback>,
    closed: bool,
}

struct StreamInner {
    state: RefCell<StreamState>,
    pull: Option<StreamOperation>,
    cancel: Option<StreamOperation>,
}

/// Shared handle to a readable stream.
#[derive(Clone)]
pub struct ReadableStream {
    inner: Rc<StreamInner>,
}

/// Producer side of a stream, handed to `start`, `pull` and `cancel`.
#[derive(Clone)]
pub struct ReadableStreamController {
    stream: ReadableStream,
}

impl ReadableStreamController {
    pub fn enqueue(&self, bytes: impl Into<Vec<u8>>) -> RuntimeResult<()> {
        self.stream.enqueue(bytes)
    }

    pub fn close(&self) {
        self.stream.close();
    }
}

impl ReadableStream {
    /// Create a stream. `start` runs immediately; `pull` runs whenever a
    /// read has to wait; `cancel` runs on [`ReadableStream::cancel`].
    pub fn new(
        start: Option<StreamOperation>,
        pull: Option<StreamOperation>,
        cancel: Option<StreamOperation>,
    ) -> Self {
        let stream = Self {
            inner: Rc::new(StreamInner {
                state: RefCell::new(StreamState::default()),
                pull,
                cancel,
            }),
        };
        if let Some(start) = start {
            start(&stream.controller());
        }
        stream
    }

    /// A stream that starts out holding `bytes` and already closed.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let stream = Self::new(None, None, None);
        let bytes = bytes.into();
        {
            let mut state = stream.inner.state.borrow_mut();
            state.buffered = bytes;
            state.closed = true;
        }
        stream
    }

    pub fn controller(&self) -> ReadableStreamController {
        ReadableStreamController {
            stream: self.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.state.borrow().buffered.len()
    }

    pub fn pending_reads(&self) -> usize {
        self.inner.state.borrow().pending_reads.len()
    }

    /// Push bytes into the stream. Fails once the stream is closed.
    pub fn enqueue(&self, bytes: impl Into<Vec<u8>>) -> RuntimeResult<()> {
        let bytes = bytes.into();
        let waiting = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return Err(ServiceWorkerError::StreamClosed);
            }
            match state.pending_reads.pop_front() {
                Some(read) => Some(read),
                None => {
                    state.buffered.extend_from_slice(&bytes);
                    None
                }
            }
        };
        if let Some(read) = waiting {
            read(StreamReadResult::Chunk(bytes));
        }
        Ok(())
    }

    /// Read everything currently buffered, or wait for the next chunk.
    pub fn read<F>(&self, callback: F)
    where
        F: FnOnce(StreamReadResult) + 'static,
    {
        let ready = {
            let mut state = self.inner.state.borrow_mut();
            if !state.buffered.is_empty() {
                Some(StreamReadResult::Chunk(std::mem::take(&mut state.buffered)))
            } else if state.closed {
                Some(StreamReadResult::Done)
            } else {
                None
            }
        };
        match ready {
            Some(result) => callback(result),
            None => {
                self.inner
                    .state
                    .borrow_mut()
                    .pending_reads
                    .push_back(Box::new(callback));
                if let Some(pull) = &self.inner.pull {
                    pull(&self.controller());
                }
            }
        }
    }

    /// Close the stream, answering waiting reads with `Done` in order.
    pub fn close(&self) {
        let waiting: Vec<ReadCallback> = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending_reads.drain(..).collect()
        };
        for read in waiting {
            read(StreamReadResult::Done);
        }
    }

    /// Tell the source to stop, drop buffered bytes and close.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.inner.cancel {
            cancel(&self.controller());
        }
        self.inner.state.borrow_mut().buffered.clear();
        self.close();
    }

    /// Bytes available right now without waiting, and whether the stream
    /// has ended.
    pub fn take_available(&self) -> (Vec<u8>, bool) {
        let mut state = self.inner.state.borrow_mut();
        (std::mem::take(&mut state.buffered), state.closed)
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ReadableStream")
            .field("buffered", &state.buffered.len())
            .field("pending_reads", &state.pending_reads.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn collect(stream: &ReadableStream) -> Rc<RefCell<Vec<StreamReadResult>>> {
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        stream.read(move |result| sink.borrow_mut().push(result));
        results
    }

    #[test]
    fn test_enqueue_then_read() {
        let stream = ReadableStream::new(None, None, None);
        stream.enqueue(b"hello".to_vec()).unwrap();
        stream.enqueue(b" world".to_vec()).unwrap();
        let results = collect(&stream);
        assert_eq!(
            *results.borrow(),
            vec![StreamReadResult::Chunk(b"hello world".to_vec())]
        );
        assert_eq!(stream.buffered_len(), 0);
    }

    #[test]
    fn test_close_then_read_is_done() {
        let stream = ReadableStream::new(None, None, None);
        stream.close();
        let results = collect(&stream);
        assert_eq!(*results.borrow(), vec![StreamReadResult::Done]);
    }

    #[test]
    fn test_waiting_read_gets_next_chunk() {
        let stream = ReadableStream::new(None, None, None);
        let first = collect(&stream);
        let second = collect(&stream);
        assert_eq!(stream.pending_reads(), 2);

        stream.enqueue(b"a".to_vec()).unwrap();
        assert_eq!(*first.borrow(), vec![StreamReadResult::Chunk(b"a".to_vec())]);
        assert!(second.borrow().is_empty());
        assert_eq!(stream.buffered_len(), 0);

        stream.enqueue(b"b".to_vec()).unwrap();
        assert_eq!(*second.borrow(), vec![StreamReadResult::Chunk(b"b".to_vec())]);
    }

    #[test]
    fn test_close_drains_waiting_reads_in_order() {
        let stream = ReadableStream::new(None, None, None);
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            stream.read(move |result| {
                assert!(result.is_done());
                order.borrow_mut().push(n);
            });
        }
        stream.close();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(stream.pending_reads(), 0);
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let stream = ReadableStream::new(None, None, None);
        stream.close();
        assert_eq!(
            stream.enqueue(b"late".to_vec()),
            Err(ServiceWorkerError::StreamClosed)
        );
    }

    #[test]
    fn test_start_and_pull_use_controller() {
        let pulls = Rc::new(Cell::new(0));
        let counter = pulls.clone();
        let stream = ReadableStream::new(
            Some(Box::new(|controller: &ReadableStreamController| {
                controller.enqueue(b"start".to_vec()).unwrap();
            })),
            Some(Box::new(move |controller: &ReadableStreamController| {
                counter.set(counter.get() + 1);
                if counter.get() == 2 {
                    controller.close();
                } else {
                    controller.enqueue(b"pulled".to_vec()).unwrap();
                }
            })),
            None,
        );

        assert_eq!(
            *collect(&stream).borrow(),
            vec![StreamReadResult::Chunk(b"start".to_vec())]
        );
        assert_eq!(
            *collect(&stream).borrow(),
            vec![StreamReadResult::Chunk(b"pulled".to_vec())]
        );
        assert_eq!(*collect(&stream).borrow(), vec![StreamReadResult::Done]);
        assert_eq!(pulls.get(), 2);
    }

    #[test]
    fn test_cancel_discards_and_closes() {
        let cancelled = Rc::new(Cell::new(false));
        let flag = cancelled.clone();
        let stream = ReadableStream::new(
            None,
            None,
            Some(Box::new(move |_: &ReadableStreamController| flag.set(true))),
        );
        stream.enqueue(b"unread".to_vec()).unwrap();
        stream.cancel();
        assert!(cancelled.get());
        assert!(stream.is_closed());
        assert_eq!(*collect(&stream).borrow(), vec![StreamReadResult::Done]);
    }

    #[test]
    fn test_from_bytes() {
        let stream = ReadableStream::from_bytes("body");
        assert!(stream.is_closed());
        assert_eq!(stream.take_available(), (b"body".to_vec(), true));
    }
}
