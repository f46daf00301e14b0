//! Live video relay: datagram socket → bounded queue → control sink.
//!
//! Two tasks share one [`FrameQueue`]:
//!
//! * [`receive_frames`] reassembles frames from the device's datagrams and
//!   pushes each completed frame.
//! * [`publish_frames`] pops frames and forwards each payload as one binary
//!   message.
//!
//! The queue is bounded; when the publisher falls behind the oldest frame is
//! evicted so memory stays flat and the viewer always gets the freshest
//! picture.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetbridge_protocol::FrameAssembler;
use fleetbridge_types::VideoFrame;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::control::ControlSink;
use crate::shutdown::Shutdown;

/// Largest datagram the receiver accepts in one read.
const DATAGRAM_BUF_LEN: usize = 64 * 1024;

/// Bounded FIFO of completed frames with drop-oldest overflow.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    frames: Mutex<VecDeque<VideoFrame>>,
    ready: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<VideoFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `frame`.  When full, the oldest frame is evicted and returned.
    pub fn push(&self, frame: VideoFrame) -> Option<VideoFrame> {
        let evicted = {
            let mut frames = self.frames();
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front()
            } else {
                None
            };
            frames.push_back(frame);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<VideoFrame> {
        self.frames().pop_front()
    }

    /// Wait up to `wait` for a frame.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<VideoFrame> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reassemble frames from `socket` into `queue` until `shutdown`.
///
/// A partial frame that sees no new datagram for a whole poll interval is
/// discarded.  Receive errors and corrupt headers are logged and the loop
/// keeps going.
pub async fn receive_frames(
    socket: &UdpSocket,
    queue: &FrameQueue,
    shutdown: &Shutdown,
    poll_interval: Duration,
) {
    let mut assembler = FrameAssembler::default();
    let mut buf = vec![0u8; DATAGRAM_BUF_LEN];

    while !shutdown.is_triggered() {
        match tokio::time::timeout(poll_interval, socket.recv_from(&mut buf)).await {
            Err(_) => {
                if !assembler.is_idle() {
                    debug!("discarding stale partial frame");
                    assembler.reset();
                }
            }
            Ok(Err(e)) => warn!(error = %e, "datagram receive failed"),
            Ok(Ok((n, peer))) => {
                let pushed = assembler.push(&buf[..n], |frame| {
                    trace!(tag = frame.tag, bytes = frame.len(), "frame assembled");
                    if let Some(stale) = queue.push(frame) {
                        debug!(tag = stale.tag, dropped = queue.dropped(), "frame queue full, dropped oldest");
                    }
                });
                if let Err(e) = pushed {
                    warn!(peer = %peer, error = %e, "corrupt frame header, resynchronising");
                }
            }
        }
    }
    debug!("frame receiver stopped");
}

/// Forward frames from `queue` to `sink` as binary messages until
/// `shutdown`.  Stops at the first send failure.
pub async fn publish_frames(
    queue: &FrameQueue,
    sink: &mut dyn ControlSink,
    shutdown: &Shutdown,
    poll_interval: Duration,
) {
    while !shutdown.is_triggered() {
        let Some(frame) = queue.pop_timeout(poll_interval).await else {
            continue;
        };
        if let Err(e) = sink.send_binary(frame.payload).await {
            error!(error = %e, "frame publish failed, stopping publisher");
            return;
        }
    }
    debug!("frame publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ChannelSink, ControlMessage};
    use fleetbridge_protocol::FrameHeader;
    use std::sync::Arc;

    fn frame(tag: u32) -> VideoFrame {
        VideoFrame { tag, payload: vec![tag as u8; 4] }
    }

    fn frame_bytes(tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameHeader { tag, len: payload.len() as u32 }.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn queue_is_fifo() {
        let queue = FrameQueue::new(4);
        for tag in 0..3 {
            assert!(queue.push(frame(tag)).is_none());
        }
        assert_eq!(queue.len(), 3);
        let tags: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).map(|f| f.tag).collect();
        assert_eq!(tags, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = FrameQueue::new(2);
        queue.push(frame(1));
        queue.push(frame(2));
        let evicted = queue.push(frame(3)).expect("oldest evicted");
        assert_eq!(evicted.tag, 1);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().map(|f| f.tag), Some(2));
        assert_eq!(queue.try_pop().map(|f| f.tag), Some(3));
    }

    #[test]
    fn zero_capacity_holds_one_frame() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().map(|f| f.tag), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_timeout_returns_none_when_empty() {
        let queue = FrameQueue::new(2);
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_secs(1)).await.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(2));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(frame(7));
        });
        let got = queue.pop_timeout(Duration::from_secs(5)).await;
        assert_eq!(got.map(|f| f.tag), Some(7));
    }

    #[tokio::test]
    async fn receiver_reassembles_chunked_datagrams() -> Result<(), Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let target = socket.local_addr()?;
        let device = UdpSocket::bind("127.0.0.1:0").await?;

        let queue = Arc::new(FrameQueue::new(8));
        let shutdown = Shutdown::new();
        let task = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                receive_frames(&socket, &queue, &shutdown, Duration::from_millis(200)).await;
            })
        };

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut bytes = frame_bytes(1, &payload);
        bytes.extend(frame_bytes(2, b"tail"));
        for chunk in bytes.chunks(1400) {
            device.send_to(chunk, target).await?;
        }

        let first = queue.pop_timeout(Duration::from_secs(5)).await.ok_or("no frame")?;
        assert_eq!(first.tag, 1);
        assert_eq!(first.payload, payload);
        let second = queue.pop_timeout(Duration::from_secs(5)).await.ok_or("no frame")?;
        assert_eq!(second.payload, b"tail");

        shutdown.trigger();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn receiver_discards_partial_frame_after_quiet_interval() -> Result<(), Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let target = socket.local_addr()?;
        let device = UdpSocket::bind("127.0.0.1:0").await?;

        let queue = Arc::new(FrameQueue::new(8));
        let shutdown = Shutdown::new();
        let task = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                receive_frames(&socket, &queue, &shutdown, Duration::from_millis(50)).await;
            })
        };

        let stale = frame_bytes(1, &[0xAA; 100]);
        device.send_to(&stale[..60], target).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        device.send_to(&frame_bytes(2, b"fresh"), target).await?;

        let got = queue.pop_timeout(Duration::from_secs(5)).await.ok_or("no frame")?;
        assert_eq!(got.tag, 2);
        assert_eq!(got.payload, b"fresh");
        assert!(queue.is_empty());

        shutdown.trigger();
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn publisher_forwards_in_order() {
        let queue = Arc::new(FrameQueue::new(8));
        for tag in 1..=3 {
            queue.push(frame(tag));
        }
        let (mut sink, mut rx) = ChannelSink::new();
        let shutdown = Shutdown::new();
        let task = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                publish_frames(&queue, &mut sink, &shutdown, Duration::from_millis(20)).await;
            })
        };

        for tag in 1..=3u8 {
            assert_eq!(rx.recv().await, Some(ControlMessage::Binary(vec![tag; 4])));
        }
        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn publisher_stops_on_send_failure() {
        let queue = FrameQueue::new(8);
        queue.push(frame(1));
        queue.push(frame(2));
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);

        let shutdown = Shutdown::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            publish_frames(&queue, &mut sink, &shutdown, Duration::from_millis(20)),
        )
        .await
        .expect("publisher returns on its own");
        assert!(!shutdown.is_triggered());
        assert_eq!(queue.len(), 1);
    }
}
