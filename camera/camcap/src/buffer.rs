use std::sync::mpsc::{Receiver, Sender};

use crate::{ControlList, FrameMetadata, RequestStatus};

/// Memory receiving one frame of one stream.
///
/// A buffer belongs to a slot of a [BufferPool] for its whole life. It is lent
/// to one [Request] at a time and comes back to the pool afterwards.
#[derive(Debug)]
pub struct Buffer {
    index: usize,
    data: Vec<u8>,
    metadata: FrameMetadata,
}

impl Buffer {
    fn new(index: usize, len: usize) -> Self {
        Self {
            index,
            data: vec![0; len],
            metadata: FrameMetadata::default(),
        }
    }

    /// The slot of this buffer within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The bytes filled by the last completed capture.
    pub fn payload(&self) -> &[u8] {
        let used = self.metadata.bytes_used.min(self.data.len());
        &self.data[..used]
    }

    /// The whole backing memory, for the backend to write into.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: FrameMetadata) {
        self.metadata = metadata;
    }

    /// Move the buffer out of `slot`, leaving an empty buffer behind.
    pub(crate) fn take_from(slot: &mut Buffer) -> Buffer {
        let empty = Buffer::new(slot.index, 0);
        std::mem::replace(slot, empty)
    }
}

/// Fixed set of pre-allocated buffers indexed by slot.
///
/// Idle buffers are parked in the pool. Buffers handed to consumers find their
/// way back through the return channel (see [BufferPool::return_handle]).
#[derive(Debug)]
pub struct BufferPool {
    idle: Vec<Buffer>,
    capacity: usize,
    frame_size: usize,
    returned_tx: Sender<Buffer>,
    returned_rx: Receiver<Buffer>,
}

impl BufferPool {
    pub fn new(count: usize, frame_size: usize) -> Self {
        let (returned_tx, returned_rx) = std::sync::mpsc::channel();
        // Reverse so that `take` hands out slot 0 first.
        let idle = (0..count).rev().map(|i| Buffer::new(i, frame_size)).collect();
        Self {
            idle,
            capacity: count,
            frame_size,
            returned_tx,
            returned_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Take an idle buffer, if any.
    pub fn take(&mut self) -> Option<Buffer> {
        self.idle.pop()
    }

    /// Park a buffer back in the pool.
    pub fn put(&mut self, mut buffer: Buffer) {
        debug_assert!(buffer.index < self.capacity);
        debug_assert!(self.idle.iter().all(|b| b.index != buffer.index));
        buffer.metadata = FrameMetadata::default();
        self.idle.push(buffer);
    }

    /// A sender through which buffers lent outside the driver come back.
    pub fn return_handle(&self) -> Sender<Buffer> {
        self.returned_tx.clone()
    }

    /// Buffers which came back through the return channel since the last call.
    pub fn drain_returned(&mut self) -> Vec<Buffer> {
        self.returned_rx.try_iter().collect()
    }
}

/// One capture cycle: a buffer to fill and the parameters to capture with.
///
/// A request created with [Request::returning_to] sends its buffer back to
/// the pool when it is dropped without being turned back into a buffer.
#[derive(Debug)]
pub struct Request {
    id: u64,
    buffer: Buffer,
    controls: ControlList,
    status: RequestStatus,
    return_tx: Option<Sender<Buffer>>,
}

impl Request {
    pub fn new(id: u64, buffer: Buffer) -> Self {
        Self {
            id,
            buffer,
            controls: ControlList::default(),
            status: RequestStatus::Pending,
            return_tx: None,
        }
    }

    /// A request whose buffer goes back through `return_tx` on drop, see
    /// [BufferPool::return_handle].
    pub fn returning_to(id: u64, buffer: Buffer, return_tx: Sender<Buffer>) -> Self {
        let mut request = Self::new(id, buffer);
        request.return_tx = Some(return_tx);
        request
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    /// Mark the request complete with the metadata of the captured frame.
    pub fn complete(&mut self, metadata: FrameMetadata) {
        self.buffer.set_metadata(metadata);
        self.status = RequestStatus::Complete;
    }

    pub fn cancel(&mut self) {
        self.status = RequestStatus::Cancelled;
    }

    pub fn into_buffer(mut self) -> Buffer {
        self.return_tx = None;
        Buffer::take_from(&mut self.buffer)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(tx) = self.return_tx.take() {
            // Nobody listens once the pool is gone.
            let _ = tx.send(Buffer::take_from(&mut self.buffer));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn pool_lends_and_recovers_slots() {
        let mut pool = BufferPool::new(3, 16);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.idle_count(), 3);

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(a.len(), 16);
        assert_eq!(pool.idle_count(), 1);

        pool.put(a);
        assert_eq!(pool.idle_count(), 2);

        let handle = pool.return_handle();
        handle.send(b).unwrap();
        let returned = pool.drain_returned();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].index(), 1);
        assert!(pool.drain_returned().is_empty());
    }

    #[test]
    fn dropped_request_returns_its_buffer() {
        let mut pool = BufferPool::new(2, 8);
        let request = Request::returning_to(1, pool.take().unwrap(), pool.return_handle());
        drop(request);
        let returned = pool.drain_returned();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].index(), 0);
        assert_eq!(returned[0].len(), 8);

        // Turning a request back into its buffer does not return it twice.
        let request = Request::returning_to(2, pool.take().unwrap(), pool.return_handle());
        let buffer = request.into_buffer();
        assert_eq!(buffer.len(), 8);
        assert!(pool.drain_returned().is_empty());
    }

    #[test]
    fn payload_is_bounded_by_bytes_used() {
        let mut pool = BufferPool::new(1, 8);
        let buffer = pool.take().unwrap();
        let mut request = Request::new(7, buffer);
        assert_eq!(request.status(), RequestStatus::Pending);

        request.buffer_mut().data_mut()[..3].copy_from_slice(&[1, 2, 3]);
        request.complete(FrameMetadata {
            sequence: 4,
            bytes_used: 3,
            timestamp: std::time::Duration::from_millis(10),
        });
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(request.buffer().payload(), &[1, 2, 3]);

        let buffer = request.into_buffer();
        pool.put(buffer);
        let buffer = pool.take().unwrap();
        assert_eq!(buffer.metadata().bytes_used, 0);
    }
}
