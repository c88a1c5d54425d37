//! Unix-socket channel between the bridge and an enclave host
//!
//! ```text
//! ┌───────────────┐     Unix Socket      ┌────────────────┐
//! │ EnclaveBridge │◄───────────────────►│ EnclaveServer  │
//! │ (coordinator) │ /tmp/trinity-shield- │ (enclave host) │
//! └───────────────┘    {chain}.sock      └────────────────┘
//! ```
//!
//! One JSON document per line in each direction. Responses may arrive
//! in any order; the correlation id ties them back to their requests.

use super::protocol::{EnclaveRequest, EnclaveResponse};
use super::software::SoftwareEnclave;
use super::{EnclaveTransport, ResponseSink};
use crate::error::{TrinityError, TrinityResult};
use crate::types::ChainId;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Client side of an enclave socket
pub struct UnixSocketTransport {
    chain: ChainId,
    path: PathBuf,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl UnixSocketTransport {
    /// Transport for `chain` at `path`
    pub fn new(chain: ChainId, path: impl Into<PathBuf>) -> Self {
        Self {
            chain,
            path: path.into(),
            writer: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl EnclaveTransport for UnixSocketTransport {
    fn address(&self) -> String {
        self.path.display().to_string()
    }

    async fn connect(&self, sink: ResponseSink) -> TrinityResult<()> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            debug!("[{}] Cannot reach {}: {}", self.chain, self.path.display(), e);
            TrinityError::EnclaveDisconnected { chain: self.chain }
        })?;
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let chain = self.chain;
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<EnclaveResponse>(&line) {
                        Ok(response) => {
                            sink.deliver(response);
                        }
                        Err(e) => warn!("[{}] Malformed enclave response: {}", chain, e),
                    },
                    Ok(None) => {
                        warn!("[{}] Enclave closed the socket", chain);
                        break;
                    }
                    Err(e) => {
                        error!("[{}] Enclave socket read failed: {}", chain, e);
                        break;
                    }
                }
            }
            writer.lock().await.take();
        });
        Ok(())
    }

    async fn send(&self, request: &EnclaveRequest) -> TrinityResult<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(TrinityError::EnclaveDisconnected { chain: self.chain })?;
        if let Err(e) = writer.write_all(&line).await {
            warn!("[{}] Enclave socket write failed: {}", self.chain, e);
            guard.take();
            return Err(TrinityError::EnclaveDisconnected { chain: self.chain });
        }
        Ok(())
    }
}

/// Serves a [`SoftwareEnclave`] on a Unix socket
pub struct EnclaveServer {
    enclave: Arc<SoftwareEnclave>,
    path: PathBuf,
}

impl EnclaveServer {
    /// Server for `enclave` at `path`
    pub fn new(enclave: Arc<SoftwareEnclave>, path: impl Into<PathBuf>) -> Self {
        Self {
            enclave,
            path: path.into(),
        }
    }

    /// Bind and serve until `cancel` fires
    pub async fn serve(self, cancel: CancellationToken) -> TrinityResult<()> {
        // stale socket from a previous run
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!("[{}] Enclave listening on {}", self.enclave.chain(), self.path.display());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let enclave = self.enclave.clone();
                        tokio::spawn(Self::handle_connection(enclave, stream));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        let _ = std::fs::remove_file(&self.path);
        info!("[{}] Enclave server stopped", self.enclave.chain());
        Ok(())
    }

    async fn handle_connection(enclave: Arc<SoftwareEnclave>, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read request: {}", e);
                    break;
                }
            };

            let enclave = enclave.clone();
            let writer = writer.clone();
            // answer out of order; a slow signature must not hold the line
            tokio::spawn(async move {
                let response = match serde_json::from_str::<EnclaveRequest>(&line) {
                    Ok(request) => {
                        match tokio::task::spawn_blocking(move || enclave.handle(&request)).await {
                            Ok(response) => response,
                            Err(e) => EnclaveResponse::failure("", format!("Handler failed: {}", e)),
                        }
                    }
                    Err(e) => EnclaveResponse::failure("", format!("Parse error: {}", e)),
                };
                let mut json = match serde_json::to_vec(&response) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize response: {}", e);
                        return;
                    }
                };
                json.push(b'\n');
                if let Err(e) = writer.lock().await.write_all(&json).await {
                    error!("Failed to write response: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnclaveConfig;
    use crate::crypto::correlation_id;
    use crate::enclave::EnclaveBridge;

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!("trinity-test-{}.sock", correlation_id().unwrap()))
    }

    #[tokio::test]
    async fn test_bridge_over_unix_socket() {
        let path = socket_path();
        let enclave = Arc::new(SoftwareEnclave::new(ChainId::Solana).unwrap());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(EnclaveServer::new(enclave.clone(), &path).serve(cancel.clone()));

        let transport: Arc<dyn EnclaveTransport> = Arc::new(UnixSocketTransport::new(ChainId::Solana, &path));
        let bridge = EnclaveBridge::new(EnclaveConfig::default(), [(ChainId::Solana, transport)]);

        let mut connected = false;
        for _ in 0..50 {
            if bridge.connect(ChainId::Solana).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(connected);
        assert_eq!(bridge.public_key(ChainId::Solana), Some(enclave.public_key()));

        let signature = bridge.sign_vote(ChainId::Solana, &[3u8; 32]).await.unwrap();
        assert_eq!(signature.bytes.len(), 64);
        let status = bridge.get_status(ChainId::Solana).await.unwrap();
        assert_eq!(status.chain_id, 2);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let transport = UnixSocketTransport::new(ChainId::Ton, socket_path());
        let request = EnclaveRequest::new("id".into(), crate::enclave::MessageType::GetStatus, ChainId::Ton, vec![]);
        assert_eq!(
            transport.send(&request).await.unwrap_err(),
            TrinityError::EnclaveDisconnected { chain: ChainId::Ton }
        );
    }
}
