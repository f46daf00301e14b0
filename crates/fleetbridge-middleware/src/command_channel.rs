//! The device command socket.
//!
//! One TCP connection per device, opened after discovery and never reopened.
//! It is split in two:
//!
//! * [`CommandChannel`] – the single writer.  Each command is encoded up
//!   front and written in one `write_all`, so commands never interleave.
//! * [`DeviceReader`] – the reader.  Every read is bounded by the poll
//!   interval and surfaces [`LinkError::Timeout`] when nothing arrived, which
//!   callers treat as "no data yet".

use std::io;
use std::time::Duration;

use fleetbridge_protocol::response::RESPONSE_OPCODE_LEN;
use fleetbridge_protocol::{Command, DeviceResponse, FrameHeader, Opcode, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use fleetbridge_types::{LinkError, LinkState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, instrument, warn};

use crate::control::ControlSink;
use crate::shutdown::{LinkMonitor, Shutdown};

/// Write half of the device connection.
pub struct CommandChannel<W> {
    endpoint: String,
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> CommandChannel<W> {
    pub fn new(endpoint: impl Into<String>, writer: W) -> Self {
        Self {
            endpoint: endpoint.into(),
            writer,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encode and write one command.
    ///
    /// # Errors
    ///
    /// [`LinkError::Connection`] if the socket write fails.
    #[instrument(name = "command", skip_all, fields(endpoint = %self.endpoint, opcode = ?command.opcode))]
    pub async fn send<Op: Opcode>(&mut self, command: &Command<Op>) -> Result<(), LinkError> {
        let bytes = command.encode();
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| LinkError::connection(&self.endpoint, e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| LinkError::connection(&self.endpoint, e))?;
        debug!(operands = command.operands.len(), "command sent");
        Ok(())
    }

    /// Shut down the write direction.  Errors are logged and ignored.
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(endpoint = %self.endpoint, error = %e, "command channel shutdown");
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Read half of the device connection.
pub struct DeviceReader<R> {
    endpoint: String,
    reader: R,
    poll_interval: Duration,
}

impl<R: AsyncRead + Unpin + Send> DeviceReader<R> {
    pub fn new(endpoint: impl Into<String>, reader: R, poll_interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            reader,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Read whatever is available, waiting at most one poll interval.
    ///
    /// `Ok(0)` means the device closed the connection.
    ///
    /// # Errors
    ///
    /// [`LinkError::Timeout`] when nothing arrived in time,
    /// [`LinkError::Connection`] for any other read failure.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match tokio::time::timeout(self.poll_interval, self.reader.read(buf)).await {
            Err(_) => Err(LinkError::Timeout(format!("data from {}", self.endpoint))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if is_retryable(&e) => {
                Err(LinkError::Timeout(format!("data from {}", self.endpoint)))
            }
            Ok(Err(e)) => Err(LinkError::connection(&self.endpoint, e)),
        }
    }

    /// Fill `buf`, looping over partial reads and timeouts.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only
    /// when the device closed the connection.  Gives up with
    /// [`LinkError::Timeout`] if `shutdown` is triggered while waiting.
    async fn fill(&mut self, buf: &mut [u8], shutdown: &Shutdown) -> Result<usize, LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_some(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.is_transient() => {
                    if shutdown.is_triggered() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Read one still-capture response: a frame header, then exactly the
    /// declared number of bytes.
    ///
    /// # Errors
    ///
    /// * [`LinkError::Framing`] – the header was cut short or declares more
    ///   than [`MAX_FRAME_LEN`].
    /// * [`LinkError::Connection`] – the device closed mid-payload or the
    ///   read failed.
    /// * [`LinkError::Timeout`] – `shutdown` was triggered while waiting.
    pub async fn read_capture(&mut self, shutdown: &Shutdown) -> Result<Vec<u8>, LinkError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let got = self.fill(&mut header, shutdown).await?;
        let header = FrameHeader::decode(&header[..got])?;
        if header.len > MAX_FRAME_LEN {
            return Err(LinkError::Framing(format!(
                "capture declares {} bytes, limit is {MAX_FRAME_LEN}",
                header.len
            )));
        }

        let mut frame = vec![0u8; header.len as usize];
        let got = self.fill(&mut frame, shutdown).await?;
        if got < frame.len() {
            return Err(LinkError::connection(
                &self.endpoint,
                format!("closed after {got} of {} capture bytes", frame.len()),
            ));
        }
        debug!(endpoint = %self.endpoint, bytes = frame.len(), "capture received");
        Ok(frame)
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Decode device-initiated responses and forward each one as JSON.
///
/// Runs until `shutdown` is triggered.  Unknown opcodes are logged and
/// skipped; send failures are logged and the loop keeps reading.  When the
/// device closes the connection the link is marked
/// [`LinkState::Degraded`] and the task idles until shutdown.
#[instrument(skip_all, fields(endpoint = %reader.endpoint))]
pub async fn listen_responses<D, R>(
    reader: &mut DeviceReader<R>,
    sink: &mut dyn ControlSink,
    shutdown: &Shutdown,
    link: &LinkMonitor,
) where
    D: DeviceResponse,
    R: AsyncRead + Unpin + Send,
{
    let mut pending: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    let mut closed = false;

    while !shutdown.is_triggered() {
        if closed {
            tokio::time::sleep(reader.poll_interval()).await;
            continue;
        }
        match reader.read_some(&mut chunk).await {
            Ok(0) => {
                error!("device closed the command connection");
                link.set(LinkState::Degraded);
                closed = true;
                continue;
            }
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                error!(error = %e, "response read failed");
                link.set(LinkState::Degraded);
                tokio::time::sleep(reader.poll_interval()).await;
                continue;
            }
        }

        loop {
            match D::decode(&pending) {
                Ok(Some((response, used))) => {
                    pending.drain(..used);
                    debug!(?response, "device response");
                    if let Err(e) = sink.send_json(&response.to_json()).await {
                        error!(error = %e, "failed to forward device response");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "skipping unrecognised response");
                    pending.drain(..RESPONSE_OPCODE_LEN.min(pending.len()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ChannelSink, ControlMessage};
    use fleetbridge_protocol::{SentryEvent, SentryOp};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Hands out `chunk` bytes at a time and reports "not ready" between
    /// every chunk.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        stall: bool,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self { data, pos: 0, chunk, stall: true }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.stall {
                self.stall = false;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.stall = true;
            let end = (self.pos + self.chunk)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    fn capture_bytes(payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameHeader { tag: 0, len: payload.len() as u32 }.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn send_writes_encoded_commands_in_call_order() {
        let mut channel = CommandChannel::new("test", Vec::new());
        channel.send(&Command::new(SentryOp::Forward).with(5)).await.unwrap();
        channel.send(&Command::new(SentryOp::Stand)).await.unwrap();

        let written = channel.into_inner();
        let mut expected = Command::new(SentryOp::Forward).with(5).encode();
        expected.extend(Command::new(SentryOp::Stand).encode());
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn capture_survives_many_partial_reads() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        for chunk in [1, 5, 1024] {
            let mut reader = DeviceReader::new(
                "cam",
                Trickle::new(capture_bytes(&payload), chunk),
                Duration::from_secs(1),
            );
            let frame = reader.read_capture(&Shutdown::new()).await.unwrap();
            assert_eq!(frame, payload, "chunk size {chunk}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capture_waits_through_timeouts_before_data_arrives() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = DeviceReader::new("cam", host, Duration::from_secs(1));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            device.write_all(&capture_bytes(b"jpeg")).await.unwrap();
            // Keep the pipe open until the reader is done.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let frame = reader.read_capture(&Shutdown::new()).await.unwrap();
        assert_eq!(frame, b"jpeg");
    }

    #[tokio::test]
    async fn capture_cut_short_by_peer_is_connection_error() {
        let mut bytes = capture_bytes(&[7u8; 100]);
        bytes.truncate(FRAME_HEADER_LEN + 40);
        let mut reader = DeviceReader::new("cam", &bytes[..], Duration::from_secs(1));
        let err = reader.read_capture(&Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, LinkError::Connection { ref details, .. } if details.contains("40 of 100")));
    }

    #[tokio::test]
    async fn capture_with_truncated_header_is_framing_error() {
        let bytes = [1u8, 0, 0];
        let mut reader = DeviceReader::new("cam", &bytes[..], Duration::from_secs(1));
        let err = reader.read_capture(&Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, LinkError::Framing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_gives_up_when_shutdown_is_triggered() {
        let (_device, host) = tokio::io::duplex(64);
        let mut reader = DeviceReader::new("cam", host, Duration::from_secs(1));
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let err = reader.read_capture(&shutdown).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn listener_forwards_servo_and_obstacle_events() {
        let (mut device, host) = tokio::io::duplex(1024);
        let mut reader = DeviceReader::new("bot", host, Duration::from_millis(20));
        let (sink, mut rx) = ChannelSink::new();
        let shutdown = Shutdown::new();
        let link = LinkMonitor::new("sentry");

        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut sink = sink;
            listen_responses::<SentryEvent, _>(&mut reader, &mut sink, &task_shutdown, &link).await;
        });

        let mut bytes = 0u32.to_le_bytes().to_vec();
        for angle in 0..12u32 {
            bytes.extend_from_slice(&angle.to_le_bytes());
        }
        bytes.extend_from_slice(&9u32.to_le_bytes()); // unknown opcode
        bytes.extend_from_slice(&1u32.to_le_bytes());
        // Split mid-message to exercise buffering.
        device.write_all(&bytes[..10]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        device.write_all(&bytes[10..]).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ControlMessage::Text("[\"servo\",[0,1,2,3,4,5,6,7,8,9,10,11]]".into()))
        );
        assert_eq!(rx.recv().await, Some(ControlMessage::Text("[\"obstacle\"]".into())));

        shutdown.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn listener_marks_link_degraded_when_device_disconnects() {
        let (device, host) = tokio::io::duplex(64);
        let mut reader = DeviceReader::new("bot", host, Duration::from_millis(20));
        let (mut sink, _rx) = ChannelSink::new();
        let shutdown = Shutdown::new();
        let link = LinkMonitor::new("sentry");
        link.set(LinkState::Connected);
        let mut state = link.subscribe();

        let task_shutdown = shutdown.clone();
        let task_link = link.clone();
        let task = tokio::spawn(async move {
            listen_responses::<SentryEvent, _>(&mut reader, &mut sink, &task_shutdown, &task_link)
                .await;
        });

        drop(device);
        state.wait_for(|s| *s == LinkState::Degraded).await.unwrap();
        assert!(!task.is_finished(), "listener keeps running after a disconnect");

        shutdown.trigger();
        task.await.unwrap();
    }
}
