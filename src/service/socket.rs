//! Structured transport over a Unix stream socket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::wire::{self, RequestHeader, ResponseHeader, RESPONSE_HEADER_LEN};
use super::{Command, ServiceBackend, ServiceError, ServiceReply};
use crate::config::TransportKind;
use crate::privilege::PrivilegeTier;

/// Where the service listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// Linux abstract-namespace name (written `@name` in config).
    Abstract(String),
    /// Filesystem socket path.
    Path(PathBuf),
}

impl SocketAddress {
    /// Parse `@name` as an abstract address, anything else as a path.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('@') {
            Some(name) => Self::Abstract(name.to_owned()),
            None => Self::Path(PathBuf::from(raw)),
        }
    }
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Abstract(name) => write!(f, "@{name}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Socket-backed service client.
///
/// Holds one stream open between calls. Any framing or I/O error drops the
/// stream so the next call reconnects from scratch.
#[derive(Debug)]
pub struct SocketBackend {
    address: SocketAddress,
    timeout: Duration,
    stream: Mutex<Option<UnixStream>>,
    seq: AtomicU32,
}

impl SocketBackend {
    /// Create a client for `address`. No connection is made until first use.
    pub fn new(address: SocketAddress, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            stream: Mutex::new(None),
            seq: AtomicU32::new(0),
        }
    }

    async fn open(&self) -> Result<UnixStream, ServiceError> {
        let stream = match &self.address {
            SocketAddress::Path(path) => UnixStream::connect(path).await,
            SocketAddress::Abstract(name) => connect_abstract(name),
        };
        stream.map_err(|e| ServiceError::Unavailable(format!("connect {}: {e}", self.address)))
    }

    async fn exchange(
        &self,
        stream: &mut UnixStream,
        frame: &wire::Frame,
    ) -> Result<(ResponseHeader, Vec<u8>), ServiceError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let data_size = u32::try_from(frame.payload.len())
            .map_err(|_| ServiceError::InvalidRequest("payload too large".to_owned()))?;
        let header = RequestHeader {
            opcode: frame.opcode,
            seq,
            data_size,
        };
        stream.write_all(&header.encode()).await?;
        if !frame.payload.is_empty() {
            stream.write_all(&frame.payload).await?;
        }

        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        stream.read_exact(&mut raw).await?;
        let response = ResponseHeader::decode(&raw)?;
        if response.seq != seq {
            return Err(ServiceError::Protocol(format!(
                "response sequence {} does not match request {seq}",
                response.seq
            )));
        }

        let mut payload = vec![0u8; response.data_size as usize];
        stream.read_exact(&mut payload).await?;
        Ok((response, payload))
    }
}

#[async_trait]
impl ServiceBackend for SocketBackend {
    async fn call(&self, command: &Command) -> Result<ServiceReply, ServiceError> {
        let frame = wire::encode(command)?;
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };

        let exchanged = tokio::time::timeout(self.timeout, self.exchange(&mut stream, &frame)).await;
        match exchanged {
            Ok(Ok((response, payload))) => {
                *guard = Some(stream);
                debug!(command = %command, result = response.result, "socket reply");
                Ok(interpret(command, response.result, &payload))
            }
            Ok(Err(err)) => {
                warn!(command = %command, error = %err, "dropping socket after failed exchange");
                Err(err)
            }
            Err(_) => Err(ServiceError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), ServiceError> {
        let taken = self.stream.lock().await.take();
        if let Some(mut stream) = taken {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Socket
    }
}

/// Turn a raw result code and payload into typed reply fields.
fn interpret(command: &Command, result: i32, payload: &[u8]) -> ServiceReply {
    if result < 0 {
        return ServiceReply {
            status: result,
            value: None,
            text: format!("{command} rejected by service (code {result})"),
            structured: true,
        };
    }

    match command {
        Command::ProbeTier(tier) => {
            let granted = wire::decode_i32(payload).is_some_and(|level| match tier {
                PrivilegeTier::Kernel => level != 0,
                PrivilegeTier::Root => level >= 1,
                PrivilegeTier::Shell => level >= 0,
            });
            let code = if granted { tier.code() } else { -1 };
            ServiceReply {
                status: code,
                value: Some(i64::from(code)),
                text: String::new(),
                structured: true,
            }
        }
        Command::ServiceVersion | Command::EngineVersion => {
            let version = wire::decode_i32(payload).unwrap_or(-1);
            ServiceReply {
                status: if version >= 0 { 0 } else { -1 },
                value: Some(i64::from(version)),
                text: version.to_string(),
                structured: true,
            }
        }
        Command::SelinuxContext { .. } | Command::ListRules => ServiceReply {
            status: result,
            value: None,
            text: wire::decode_cstr(payload),
            structured: true,
        },
        _ => ServiceReply::status(result),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> std::io::Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("abstract socket @{name} requires Linux"),
    ))
}
