// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! A provider telnet port served from a local tcp listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::parser::PROMPT;

pub const GREETING_SERVICE: &str = "org.demo.GreetingService";

type Handler = dyn Fn(&str) -> Option<String> + Send + Sync;

pub struct FakeProvider {
    address: String,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl FakeProvider {
    /// Serve every command through `handler`. `None` leaves the command
    /// without any answer.
    pub async fn start<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let provider = FakeProvider {
            address,
            connections: Arc::new(AtomicUsize::new(0)),
            commands: Arc::new(Mutex::new(vec![])),
            cancel: CancellationToken::new(),
        };

        let handler: Arc<Handler> = Arc::new(handler);
        let connections = provider.connections.clone();
        let commands = provider.commands.clone();
        let cancel = provider.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else {
                            break;
                        };
                        connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(
                            stream,
                            handler.clone(),
                            commands.clone(),
                            cancel.clone(),
                        ));
                    }
                }
            }
        });

        Ok(provider)
    }

    /// Provider of [`GREETING_SERVICE`] with `greet(String)` and `ping()`.
    pub async fn greeting() -> std::io::Result<Self> {
        Self::start(greeting_handler).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Close the listener and every open connection.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    stream: TcpStream,
    handler: Arc<Handler>,
    commands: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let Ok(Some(line)) = line else {
            break;
        };

        let cmd = line.trim();
        trace!(%cmd, "fake provider command");
        let reply = if cmd.is_empty() {
            Some(String::new())
        } else {
            commands.lock().push(cmd.to_string());
            handler(cmd).map(|r| format!("{}\r\n", r))
        };

        if let Some(reply) = reply {
            let out = format!("{}{}", reply, PROMPT);
            if writer.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

fn greeting_handler(cmd: &str) -> Option<String> {
    if let Some(iface) = cmd.strip_prefix("ls -l ") {
        return Some(if iface == GREETING_SERVICE {
            format!(
                "{} (as provider):\r\n\tjava.lang.String greet(java.lang.String)\r\n\tvoid ping()",
                GREETING_SERVICE
            )
        } else {
            format!("No such service: {}", iface)
        });
    }

    let call = cmd.strip_prefix("invoke ")?;
    let Some(call) = call.strip_prefix(&format!("{}.", GREETING_SERVICE)) else {
        return Some(format!("No such service {}", call));
    };

    let reply = if let Some(args) = call.strip_prefix("greet(") {
        let name = args.trim_end_matches(')').trim_matches('"');
        format!("result: \"hello {}\"", name)
    } else if call.starts_with("ping(") {
        "result: null".to_string()
    } else {
        format!("No such method {} in service {}", call, GREETING_SERVICE)
    };

    Some(format!(
        "Use default service {}.\r\n{}\r\nelapsed: 1 ms.",
        GREETING_SERVICE, reply
    ))
}
