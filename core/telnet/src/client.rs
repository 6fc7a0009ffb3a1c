// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use probe_registry::{ConnectionState, MethodInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::TelnetError;
use crate::parser::{self, PROMPT};

const READ_BUFFER: usize = 1024;

struct Channel {
    writer: OwnedWriteHalf,
    responses: mpsc::Receiver<String>,
}

/// Line oriented connection to the telnet port of one provider. Commands are
/// executed one at a time; each response ends with the `dubbo>` prompt.
pub struct TelnetClient {
    address: String,
    command_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    // holding this lock for a whole round trip makes it a queue of depth one
    channel: tokio::sync::Mutex<Option<Channel>>,
    methods: Mutex<HashMap<String, Vec<MethodInfo>>>,
    cancel: CancellationToken,
}

impl TelnetClient {
    pub fn new(address: &str, command_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        TelnetClient {
            address: address.to_string(),
            command_timeout,
            state: Arc::new(state),
            channel: tokio::sync::Mutex::new(None),
            methods: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn begin_connect(&self) {
        self.state.send_replace(ConnectionState::Connecting);
    }

    pub async fn connect(&self, timeout: Duration) -> Result<(), TelnetError> {
        self.begin_connect();
        debug!(address = %self.address, "connecting telnet");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => return Err(self.connect_failed(format!("timed out after {:?}", timeout))),
        };

        let (reader, writer) = stream.into_split();
        let (tx, responses) = mpsc::channel(8);
        self.spawn_reader(reader, tx);

        *self.channel.lock().await = Some(Channel { writer, responses });
        self.state.send_replace(ConnectionState::Connected);
        info!(address = %self.address, "telnet connected");
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> TelnetError {
        self.state.send_replace(ConnectionState::Error);
        warn!(address = %self.address, %reason, "telnet connect error");
        TelnetError::Connect {
            address: self.address.clone(),
            reason,
        }
    }

    fn spawn_reader(&self, mut reader: OwnedReadHalf, tx: mpsc::Sender<String>) {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let address = self.address.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER];
            let mut pending: Vec<u8> = Vec::with_capacity(READ_BUFFER);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(%address, "telnet reader stopped");
                        break;
                    }
                    res = reader.read(&mut buf) => {
                        match res {
                            Ok(0) => {
                                debug!(%address, "telnet connection closed by peer");
                                state.send_replace(ConnectionState::Idle);
                                break;
                            }
                            Ok(len) => {
                                pending.extend_from_slice(&buf[..len]);
                                if !pending.ends_with(PROMPT.as_bytes()) {
                                    continue;
                                }

                                let end = pending.len() - PROMPT.len();
                                let text = String::from_utf8_lossy(&pending[..end]).into_owned();
                                pending.clear();

                                if tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(%address, "telnet read error: {}", e);
                                state.send_replace(ConnectionState::Error);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Wait until the connection is established, at most `wait`.
    pub async fn wait_connected(&self, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(wait, rx.wait_for(|s| !s.is_connecting())).await;
        matches!(settled, Ok(Ok(s)) if s.is_connected())
    }

    /// Send one command and return the response, without the prompt.
    pub async fn send_command(&self, cmd: &str) -> Result<String, TelnetError> {
        if !self.state().is_connected() {
            return Err(TelnetError::NotConnected(self.address.clone()));
        }

        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| TelnetError::NotConnected(self.address.clone()))?;

        // left over from a command that timed out
        while channel.responses.try_recv().is_ok() {}

        debug!(address = %self.address, %cmd, "telnet command");
        let line = format!("{}\r\n", cmd);
        if let Err(e) = channel.writer.write_all(line.as_bytes()).await {
            self.fail(&mut guard);
            return Err(e.into());
        }

        let response = tokio::time::timeout(self.command_timeout, channel.responses.recv()).await;
        match response {
            Ok(Some(text)) => {
                trace!(address = %self.address, %text, "telnet response");
                Ok(text)
            }
            Ok(None) => {
                self.fail(&mut guard);
                Err(TelnetError::Closed(self.address.clone()))
            }
            Err(_) => {
                self.fail(&mut guard);
                Err(TelnetError::Timeout(self.command_timeout))
            }
        }
    }

    fn fail(&self, channel: &mut Option<Channel>) {
        self.cancel.cancel();
        channel.take();
        self.state.send_replace(ConnectionState::Error);
    }

    /// Methods of `interface`, cached for the lifetime of the connection.
    pub async fn list_methods(
        &self,
        interface: &str,
        release: Option<&str>,
    ) -> Result<Vec<MethodInfo>, TelnetError> {
        if let Some(methods) = self.methods.lock().get(interface) {
            return Ok(methods.clone());
        }

        let text = self.send_command(&format!("ls -l {}", interface)).await?;
        let methods = parser::parse_listing(release, &text)?;
        debug!(address = %self.address, %interface, count = methods.len(), "methods listed");

        self.methods
            .lock()
            .insert(interface.to_string(), methods.clone());
        Ok(methods)
    }

    pub async fn invoke(
        &self,
        interface: &str,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, TelnetError> {
        let text = self
            .send_command(&parser::invoke_command(interface, method, args))
            .await?;
        parser::parse_invoke_response(&text)
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut channel) = self.channel.lock().await.take() {
            let _ = channel.writer.shutdown().await;
        }
        self.state.send_replace(ConnectionState::Idle);
        debug!(address = %self.address, "telnet closed");
    }
}

impl Drop for TelnetClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
