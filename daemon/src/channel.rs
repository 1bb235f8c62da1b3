/// Duplex byte-stream channel to the module injected into a game process.
///
/// Every command is one fixed 8-byte little-endian record:
/// `[i32 type][i32 controller_id]`.
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::ChannelError;

pub const RECORD_LEN: usize = 8;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pause between attempts while the endpoint does not exist yet.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(windows)]
const ERROR_PIPE_BUSY: i32 = 231;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Enable,
    Disable,
    SetActiveController(i32),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("control record must be {RECORD_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unknown control record type {0}")]
    UnknownType(i32),
}

impl ControlMessage {
    pub fn encode(self) -> [u8; RECORD_LEN] {
        let (tag, controller): (i32, i32) = match self {
            Self::Enable => (0, 0),
            Self::Disable => (1, 0),
            Self::SetActiveController(id) => (2, id),
        };
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&tag.to_le_bytes());
        record[4..].copy_from_slice(&controller.to_le_bytes());
        record
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn decode(record: &[u8]) -> Result<Self, RecordError> {
        let record: &[u8; RECORD_LEN] = record
            .try_into()
            .map_err(|_| RecordError::Length(record.len()))?;
        let tag = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let controller = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        match tag {
            0 => Ok(Self::Enable),
            1 => Ok(Self::Disable),
            2 => Ok(Self::SetActiveController(controller)),
            other => Err(RecordError::UnknownType(other)),
        }
    }
}

/// Endpoint name the injected module listens on for `pid`.
pub fn channel_name(pid: u32) -> String {
    format!("ShufflerHook-{pid}")
}

/// Opens streams to a named endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncWrite + Unpin + Send;

    /// One connection attempt, without retrying.
    async fn connect(&self, name: &str) -> io::Result<Self::Stream>;

    /// Whether the peer is still attached to `stream`.
    fn is_alive(&self, stream: &Self::Stream) -> bool;

    /// Errors meaning "not listening yet", worth retrying until the timeout.
    fn is_transient(&self, error: &io::Error) -> bool {
        error.kind() == io::ErrorKind::NotFound
    }
}

/// Named-pipe client for `\\.\pipe\<name>`.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeConnector;

#[cfg(windows)]
#[async_trait]
impl Connector for PipeConnector {
    type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

    async fn connect(&self, name: &str) -> io::Result<Self::Stream> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(format!(r"\\.\pipe\{name}"))
    }

    fn is_alive(&self, stream: &Self::Stream) -> bool {
        use std::os::windows::io::AsRawHandle;
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        // Fails with ERROR_BROKEN_PIPE once the server end is gone.
        let handle = HANDLE(stream.as_raw_handle() as isize);
        unsafe { PeekNamedPipe(handle, None, 0, None, None, None) }.is_ok()
    }

    fn is_transient(&self, error: &io::Error) -> bool {
        error.kind() == io::ErrorKind::NotFound || error.raw_os_error() == Some(ERROR_PIPE_BUSY)
    }
}

/// Unix-domain socket stand-in (`$TMPDIR/<name>.sock`) so the daemon runs on
/// development hosts.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeConnector;

#[cfg(unix)]
#[async_trait]
impl Connector for PipeConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self, name: &str) -> io::Result<Self::Stream> {
        tokio::net::UnixStream::connect(std::env::temp_dir().join(format!("{name}.sock"))).await
    }

    fn is_alive(&self, stream: &Self::Stream) -> bool {
        // The module never writes back, so a read only reports EOF or nothing.
        let mut probe = [0u8; 1];
        match stream.try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }

    fn is_transient(&self, error: &io::Error) -> bool {
        matches!(
            error.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        )
    }
}

/// A connected control channel.  Dropping it closes the stream.
pub struct ControlChannel<C: Connector> {
    connector: Arc<C>,
    name: String,
    timeout: Duration,
    stream: Option<C::Stream>,
}

impl<C: Connector> ControlChannel<C> {
    /// Connects to the module in `pid`, retrying while the endpoint is absent
    /// or busy until `timeout` elapses.
    pub async fn connect(connector: Arc<C>, pid: u32, timeout: Duration) -> Result<Self, ChannelError> {
        let name = channel_name(pid);
        let stream = connect_with_retry(connector.as_ref(), &name, timeout).await?;
        debug!(channel = %name, "control channel connected");
        Ok(Self {
            connector,
            name,
            timeout,
            stream: Some(stream),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Probes the live stream; not cached.
    pub fn is_connected(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| self.connector.is_alive(stream))
    }

    /// Writes one record.  A dropped connection is re-established once before
    /// writing; a failed write gets one reconnect-and-resend.
    pub async fn send(&mut self, message: ControlMessage) -> Result<(), ChannelError> {
        let record = message.encode();

        if !self.is_connected() {
            debug!(channel = %self.name, "control channel disconnected, reconnecting");
            self.stream = None;
            self.stream = Some(connect_with_retry(self.connector.as_ref(), &self.name, self.timeout).await?);
        }

        let Err(first) = self.write(&record).await else {
            return Ok(());
        };
        warn!(channel = %self.name, ?message, "write failed, reconnecting once: {first}");

        self.stream = None;
        match connect_with_retry(self.connector.as_ref(), &self.name, self.timeout).await {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => {
                debug!(channel = %self.name, "reconnect failed: {e}");
                return Err(ChannelError::SendFailed {
                    name: self.name.clone(),
                    source: first,
                });
            }
        }
        self.write(&record)
            .await
            .map_err(|source| ChannelError::SendFailed {
                name: self.name.clone(),
                source,
            })
    }

    async fn write(&mut self, record: &[u8]) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        stream.write_all(record).await?;
        stream.flush().await
    }
}

async fn connect_with_retry<C: Connector>(
    connector: &C,
    name: &str,
    timeout: Duration,
) -> Result<C::Stream, ChannelError> {
    let deadline = Instant::now() + timeout;
    loop {
        match connector.connect(name).await {
            Ok(stream) => return Ok(stream),
            Err(e) if connector.is_transient(&e) && Instant::now() < deadline => {
                sleep(RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
            }
            Err(e) => {
                return Err(ChannelError::ConnectFailed {
                    name: name.to_string(),
                    timeout,
                    source: Some(e),
                })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FakeConnector;
    use super::*;

    // ── records ──────────────────────────────────────────────────────────────

    #[test]
    fn records_are_little_endian_type_then_controller() {
        assert_eq!(ControlMessage::Enable.encode(), [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ControlMessage::Disable.encode(), [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            ControlMessage::SetActiveController(3).encode(),
            [2, 0, 0, 0, 3, 0, 0, 0]
        );
        assert_eq!(
            ControlMessage::SetActiveController(-1).encode(),
            [2, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn decode_reads_controller_only_for_set_active() {
        assert_eq!(
            ControlMessage::decode(&[2, 0, 0, 0, 0x10, 0x27, 0, 0]),
            Ok(ControlMessage::SetActiveController(10_000))
        );
        assert_eq!(
            ControlMessage::decode(&[0, 0, 0, 0, 9, 9, 9, 9]),
            Ok(ControlMessage::Enable)
        );
    }

    #[test]
    fn decode_rejects_unknown_types_and_bad_lengths() {
        assert_eq!(
            ControlMessage::decode(&[3, 0, 0, 0, 0, 0, 0, 0]),
            Err(RecordError::UnknownType(3))
        );
        assert_eq!(ControlMessage::decode(&[0; 7]), Err(RecordError::Length(7)));
        assert_eq!(ControlMessage::decode(&[0; 16]), Err(RecordError::Length(16)));
    }

    #[test]
    fn channel_name_embeds_the_pid() {
        assert_eq!(channel_name(4242), "ShufflerHook-4242");
    }

    // ── connect ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_the_endpoint_appears() {
        let connector = FakeConnector::listening();
        connector.absent_attempts.store(5, Ordering::SeqCst);

        let channel = ControlChannel::connect(Arc::clone(&connector), 77, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(connector.connect_count(), 6);
        assert_eq!(channel.name(), "ShufflerHook-77");
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_nobody_listens() {
        let connector = FakeConnector::listening();
        connector.absent_attempts.store(usize::MAX, Ordering::SeqCst);
        let started = Instant::now();

        let result = ControlChannel::connect(connector, 1, Duration::from_millis(500)).await;

        assert!(matches!(result, Err(ChannelError::ConnectFailed { .. })));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn connect_fails_fast_on_other_errors() {
        let connector = FakeConnector::listening();
        connector.refuse_hard.store(true, Ordering::SeqCst);

        let result = ControlChannel::connect(Arc::clone(&connector), 1, DEFAULT_CONNECT_TIMEOUT).await;

        assert!(matches!(result, Err(ChannelError::ConnectFailed { .. })));
        assert_eq!(connector.connect_count(), 1);
    }

    // ── send ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn send_writes_one_record() {
        let connector = FakeConnector::listening();
        let mut channel = ControlChannel::connect(Arc::clone(&connector), 1, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();

        channel.send(ControlMessage::Enable).await.unwrap();
        channel.send(ControlMessage::SetActiveController(2)).await.unwrap();

        assert_eq!(
            connector.wire.messages(),
            vec![ControlMessage::Enable, ControlMessage::SetActiveController(2)]
        );
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn send_reconnects_a_dropped_channel_first() {
        let connector = FakeConnector::listening();
        let mut channel = ControlChannel::connect(Arc::clone(&connector), 1, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        connector.wire.alive.store(false, Ordering::SeqCst);
        assert!(!channel.is_connected());

        channel.send(ControlMessage::Disable).await.unwrap();

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.wire.messages(), vec![ControlMessage::Disable]);
    }

    #[tokio::test]
    async fn failed_write_is_resent_once_after_reconnect() {
        let connector = FakeConnector::listening();
        let mut channel = ControlChannel::connect(Arc::clone(&connector), 1, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        connector.wire.failing_writes.store(1, Ordering::SeqCst);

        channel.send(ControlMessage::Enable).await.unwrap();
        channel.send(ControlMessage::SetActiveController(1)).await.unwrap();
        channel.send(ControlMessage::Disable).await.unwrap();

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(
            connector.wire.messages(),
            vec![
                ControlMessage::Enable,
                ControlMessage::SetActiveController(1),
                ControlMessage::Disable
            ]
        );
    }

    #[tokio::test]
    async fn second_write_failure_is_send_failed() {
        let connector = FakeConnector::listening();
        let mut channel = ControlChannel::connect(Arc::clone(&connector), 1, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        connector.wire.failing_writes.store(2, Ordering::SeqCst);

        let result = channel.send(ControlMessage::Enable).await;

        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
        assert_eq!(connector.connect_count(), 2);
        assert!(connector.wire.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_after_write_error_is_send_failed() {
        let connector = FakeConnector::listening();
        let mut channel = ControlChannel::connect(Arc::clone(&connector), 1, Duration::from_millis(200))
            .await
            .unwrap();
        connector.wire.failing_writes.store(1, Ordering::SeqCst);
        connector.absent_attempts.store(usize::MAX, Ordering::SeqCst);

        let result = channel.send(ControlMessage::Enable).await;

        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
    }
}
