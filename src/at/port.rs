//! The AT port: device open, init sequence, command/response framing, a
//! per-command-string response cache, and unsolicited-line dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::parser::{classify_final, trim_line};
use super::unsolicited::UnsolicitedRegistry;
use super::{AtCommand, AtError, InitStep};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResponse {
    Ok,
    Err(AtError),
}

struct CacheEntry {
    response: Vec<String>,
}

struct Inner<IO> {
    reader: BufReader<tokio::io::ReadHalf<IO>>,
    writer: tokio::io::WriteHalf<IO>,
    append_lf: bool,
    cache: HashMap<String, CacheEntry>,
    unsolicited: UnsolicitedRegistry,
}

/// A line-framed AT transport session. Cloning an `AtPort` shares the
/// underlying device and its single-command-in-flight guarantee.
#[derive(Clone)]
pub struct AtPort<IO> {
    inner: Arc<Mutex<Inner<IO>>>,
}

impl<IO> AtPort<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Open the port and run the init sequence. Any init step whose final
    /// response is an error and is not flagged `tolerate_errors` fails the
    /// open.
    pub async fn open(io: IO, append_lf: bool, init_sequence: &[InitStep]) -> Result<Self, AtError> {
        let (read_half, write_half) = tokio::io::split(io);
        let inner = Inner {
            reader: BufReader::new(read_half),
            writer: write_half,
            append_lf,
            cache: HashMap::new(),
            unsolicited: UnsolicitedRegistry::new(),
        };
        let port = AtPort { inner: Arc::new(Mutex::new(inner)) };

        for step in init_sequence {
            match port.send(&step.command).await {
                Ok(_) => {}
                Err(e) if step.tolerate_errors => {
                    debug!("init step {:?} tolerated error: {e}", step.command.text);
                }
                Err(e) => return Err(AtError::InitFailed(format!("{}: {e}", step.command.text))),
            }
        }

        Ok(port)
    }

    pub async fn register_unsolicited(&self, pattern: &str, handler: super::unsolicited::Handler) {
        self.inner.lock().await.unsolicited.register(pattern, handler);
    }

    pub async fn clear_unsolicited(&self) {
        self.inner.lock().await.unsolicited.unregister_all();
    }

    /// Flush the response cache; called on every power-state change.
    pub async fn flush_cache(&self) {
        self.inner.lock().await.cache.clear();
    }

    /// Send a command and await its final response. At most one command is
    /// outstanding on this port at a time because `send` holds the port
    /// mutex for the full exchange.
    pub async fn send(&self, cmd: &AtCommand) -> Result<Vec<String>, AtError> {
        if cmd.timeout.is_zero() {
            return Err(AtError::Timeout);
        }

        let mut guard = self.inner.lock().await;

        if cmd.cacheable {
            if let Some(entry) = guard.cache.get(&cmd.text) {
                trace!("AT cache hit for {}", cmd.text);
                return Ok(entry.response.clone());
            }
        }

        trace!("AT -> {}", cmd.text);
        let mut line = cmd.text.clone();
        line.push('\r');
        if guard.append_lf {
            line.push('\n');
        }
        guard.writer.write_all(line.as_bytes()).await.map_err(|_| AtError::PortClosed)?;
        guard.writer.flush().await.map_err(|_| AtError::PortClosed)?;

        let mut payload = Vec::new();
        let result = timeout(cmd.timeout, async {
            loop {
                let raw = read_line(&mut guard.reader).await?;
                let line = trim_line(&raw);
                if line.is_empty() {
                    continue;
                }
                if guard.unsolicited.dispatch(line) {
                    trace!("AT urc: {line}");
                    continue;
                }
                if let Some(final_resp) = classify_final(line) {
                    return Ok(final_resp);
                }
                payload.push(line.to_string());
            }
        })
        .await;

        match result {
            Ok(Ok(FinalResponse::Ok)) => {
                trace!("AT <- OK ({} lines)", payload.len());
                if cmd.cacheable {
                    guard.cache.insert(cmd.text.clone(), CacheEntry { response: payload.clone() });
                }
                Ok(payload)
            }
            Ok(Ok(FinalResponse::Err(e))) => {
                warn!("AT <- error for {}: {e}", cmd.text);
                Err(e)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AtError::Timeout),
        }
    }
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String, AtError> {
    use tokio::io::AsyncBufReadExt;
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await.map_err(|_| AtError::PortClosed)?;
    if n == 0 {
        return Err(AtError::PortClosed);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_collects_payload_until_ok() {
        let (client, mut server) = duplex(4096);
        let port = AtPort::open(client, true, &[]).await.unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AT+COPS?\r\n");
            server.write_all(b"+COPS: 0,2,\"310260\"\r\nOK\r\n").await.unwrap();
        });

        let resp = port.send(&AtCommand::new("AT+COPS?", Duration::from_secs(1))).await.unwrap();
        assert_eq!(resp, vec!["+COPS: 0,2,\"310260\"".to_string()]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn zero_timeout_is_immediate_timeout() {
        let (client, _server) = duplex(64);
        let port = AtPort::open(client, true, &[]).await.unwrap();
        let err = port.send(&AtCommand::new("AT", Duration::from_secs(0))).await.unwrap_err();
        assert_eq!(err, AtError::Timeout);
    }

    #[tokio::test]
    async fn cme_error_maps_to_equipment_error() {
        let (client, mut server) = duplex(4096);
        let port = AtPort::open(client, true, &[]).await.unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"+CME ERROR: 10\r\n").await.unwrap();
        });

        let err = port.send(&AtCommand::new("AT+CPIN?", Duration::from_secs(1))).await.unwrap_err();
        assert_eq!(err, AtError::EquipmentError(10));
        handle.await.unwrap();
    }
}
