// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use probe_registry::{GenericReference, InvocationError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{PoolCache, WorkerPool};
use super::{ConcurrentSpec, InvocationRequest, InvocationResult};
use crate::config::ExecutorConfig;
use crate::connection::RegistryConnection;
use crate::errors::ServiceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub batch_timeout: Duration,
    pub result_buffer: usize,
    pub pool_idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for EngineOptions {
    fn from(config: &ExecutorConfig) -> Self {
        EngineOptions {
            batch_timeout: config.batch_timeout,
            result_buffer: config.result_buffer.max(1),
            pool_idle_timeout: config.pool_idle_timeout,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// Holds a reference until it is released. A guard dropped without
/// [`ReferenceGuard::release`] destroys the reference in the background.
struct ReferenceGuard {
    reference: Option<Arc<dyn GenericReference>>,
}

impl ReferenceGuard {
    fn new(reference: Arc<dyn GenericReference>) -> Self {
        ReferenceGuard {
            reference: Some(reference),
        }
    }

    async fn release(mut self) {
        if let Some(reference) = self.reference.take() {
            reference.destroy().await;
        }
    }
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        if let Some(reference) = self.reference.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { reference.destroy().await });
            }
        }
    }
}

/// Results of a concurrent batch, delivered in completion order. Exactly
/// `total` results are produced unless the receiver is dropped.
pub struct ConcurrentInvocation {
    results: mpsc::Receiver<InvocationResult>,
    cancel: CancellationToken,
    total: usize,
}

impl ConcurrentInvocation {
    pub async fn recv(&mut self) -> Option<InvocationResult> {
        self.results.recv().await
    }

    /// Stop the batch. Results already produced are still delivered, the
    /// remaining calls are reported as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn into_stream(self) -> ReceiverStream<InvocationResult> {
        ReceiverStream::new(self.results)
    }

    pub async fn collect(mut self) -> Vec<InvocationResult> {
        let mut out = Vec::with_capacity(self.total);
        while let Some(result) = self.results.recv().await {
            out.push(result);
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    TimedOut,
    /// Worker pool shut down under the batch
    Interrupted,
    /// Nobody listens anymore
    Abandoned,
}

struct Call {
    method: String,
    parameter_types: Vec<String>,
    arguments: Vec<serde_json::Value>,
}

struct Batch {
    connection: Arc<RegistryConnection>,
    request: InvocationRequest,
    total: usize,
    pool: Arc<WorkerPool>,
    timeout: Duration,
    tx: mpsc::Sender<InvocationResult>,
    cancel: CancellationToken,
}

pub struct InvocationEngine {
    pools: Arc<PoolCache>,
    options: EngineOptions,
    sweeper_started: AtomicBool,
}

impl InvocationEngine {
    pub fn new(options: EngineOptions) -> Self {
        InvocationEngine {
            pools: Arc::new(PoolCache::new(options.pool_idle_timeout)),
            options,
            sweeper_started: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn pools(&self) -> &Arc<PoolCache> {
        &self.pools
    }

    /// One call through a reference created for it and released afterwards.
    /// Rpc failures are carried in the result.
    pub async fn invoke_single(
        &self,
        connection: &RegistryConnection,
        request: &InvocationRequest,
    ) -> Result<InvocationResult, ServiceError> {
        if !connection.is_connected() {
            return Err(ServiceError::NotConnected(connection.address().to_string()));
        }

        let reference = match connection.refer(request).await {
            Ok(reference) => reference,
            Err(e) => {
                debug!(iface = %request.interface_name, error = %e, "reference not created");
                return Ok(InvocationResult::failed(e));
            }
        };

        let guard = ReferenceGuard::new(reference.clone());
        let res = reference
            .invoke(
                &request.method_name,
                &request.parameter_types(),
                &request.arguments(),
            )
            .await;
        guard.release().await;

        Ok(res.into())
    }

    /// Fan `request` out to `spec.invocation_count()` calls over a worker
    /// pool of `spec.worker_group_size()`. Returns immediately.
    pub fn execute_concurrent(
        &self,
        connection: Arc<RegistryConnection>,
        request: InvocationRequest,
        spec: ConcurrentSpec,
    ) -> ConcurrentInvocation {
        if !self.sweeper_started.swap(true, Ordering::SeqCst) {
            self.pools.start_sweeper(self.options.sweep_interval);
        }

        let total = spec.invocation_count();
        let (tx, rx) = mpsc::channel(self.options.result_buffer);
        let cancel = CancellationToken::new();

        let batch = Batch {
            connection,
            request,
            total,
            pool: self.pools.get(spec.worker_group_size()),
            timeout: self.options.batch_timeout,
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(run_batch(batch));

        ConcurrentInvocation {
            results: rx,
            cancel,
            total,
        }
    }

    /// Interrupt every running batch and stop pool maintenance.
    pub fn shutdown_now(&self) {
        self.pools.shutdown_now();
    }
}

async fn run_batch(batch: Batch) {
    let Batch {
        connection,
        request,
        total,
        pool,
        timeout,
        tx,
        cancel,
    } = batch;

    info!(
        iface = %request.interface_name,
        method = %request.method_name,
        %total,
        workers = pool.size(),
        "concurrent batch started"
    );

    let reference = match connection.refer(&request).await {
        Ok(reference) => reference,
        Err(e) => {
            warn!(iface = %request.interface_name, error = %e, "concurrent batch without reference");
            for _ in 0..total {
                if tx.send(InvocationResult::failed(e.clone())).await.is_err() {
                    break;
                }
            }
            return;
        }
    };
    let guard = ReferenceGuard::new(reference.clone());

    let call = Arc::new(Call {
        method: request.method_name.clone(),
        parameter_types: request.parameter_types(),
        arguments: request.arguments(),
    });

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let handles: Vec<_> = (0..total)
        .map(|_| {
            let reference = reference.clone();
            let call = call.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                let res = reference
                    .invoke(&call.method, &call.parameter_types, &call.arguments)
                    .await;
                let _ = done_tx.send(InvocationResult::from(res));
            })
        })
        .collect();
    drop(done_tx);
    drop(reference);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut pending: VecDeque<InvocationResult> = VecDeque::new();
    let mut received = 0;
    let mut sent = 0;

    let outcome = loop {
        if sent == total {
            break Outcome::Completed;
        }

        tokio::select! {
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = &mut deadline => break Outcome::TimedOut,
            permit = tx.reserve(), if !pending.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(result) = pending.pop_front() {
                        permit.send(result);
                        sent += 1;
                    }
                }
                Err(_) => break Outcome::Abandoned,
            },
            res = done_rx.recv(), if received < total => match res {
                Some(result) => {
                    pending.push_back(result);
                    received += 1;
                }
                None => break Outcome::Interrupted,
            },
            _ = tx.closed(), if pending.is_empty() => break Outcome::Abandoned,
        }
    };

    if outcome != Outcome::Completed {
        for handle in &handles {
            handle.abort();
        }
    }
    for handle in handles {
        let _ = handle.await;
    }
    guard.release().await;
    pool.touch();

    if outcome != Outcome::Abandoned {
        while let Ok(result) = done_rx.try_recv() {
            pending.push_back(result);
        }

        let filler = match outcome {
            Outcome::TimedOut => InvocationError::Timeout(timeout),
            _ => InvocationError::Cancelled,
        };
        let missing = total.saturating_sub(sent + pending.len());
        let rest = pending
            .into_iter()
            .chain(std::iter::repeat_n(InvocationResult::failed(filler), missing));
        for result in rest {
            if tx.send(result).await.is_err() {
                break;
            }
            sent += 1;
        }
    }

    match outcome {
        Outcome::Completed => info!(%total, "concurrent batch finished"),
        Outcome::Cancelled => info!(%total, %received, "concurrent batch cancelled"),
        Outcome::TimedOut => warn!(%total, %received, ?timeout, "concurrent batch timed out"),
        Outcome::Interrupted => warn!(%total, %received, "concurrent batch interrupted"),
        Outcome::Abandoned => debug!(%total, %sent, "concurrent batch abandoned"),
    }
}
