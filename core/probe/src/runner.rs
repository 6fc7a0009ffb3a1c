// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::args::{Args, Command};
use crate::config::ConfigLoader;
use probe_registry::MethodInfo;
use probe_service::{
    ClientRegistry, ConcurrentSpec, Execution, InvocationRequest, InvocationResult, NoopListener,
    ServiceInfo,
};

/// Load the configuration, build the runtime and run the command of `args`.
/// Blocks until the command is done.
pub fn run(args: Args) -> Result<()> {
    let mut config = match args.config() {
        Some(path) => ConfigLoader::new(path).context("failed to load configuration")?,
        None => ConfigLoader::default(),
    };

    let drain_timeout = config.runtime().drain_timeout();
    let runtime = config
        .runtime()
        .build()
        .context("invalid runtime configuration")?;

    runtime.block_on(run_command(config, args, drain_timeout))
}

async fn run_command(mut config: ConfigLoader, args: Args, drain_timeout: Duration) -> Result<()> {
    let tracing_conf = config.tracing().clone();
    tracing_conf
        .setup_tracing_subscriber()
        .context("invalid tracing filter")?;
    debug!(?tracing_conf);

    let client_config = config
        .client()
        .context("invalid client configuration")?
        .clone();

    let address = args
        .registry()
        .map(str::to_string)
        .or_else(|| client_config.registries().first().map(|r| r.address.clone()))
        .context("no registry address given")?;

    let client = ClientRegistry::new(client_config);
    let mut stdout = std::io::stdout();
    let res = execute(&client, &address, &args, &mut stdout).await;

    if tokio::time::timeout(drain_timeout, client.dispose())
        .await
        .is_err()
    {
        warn!(timeout = ?drain_timeout, "client shutdown timed out");
    }
    res
}

/// Connect to `address`, wait for the providers to be pushed and run the
/// command, writing its output to `out`.
pub async fn execute<W: Write>(
    client: &ClientRegistry,
    address: &str,
    args: &Args,
    out: &mut W,
) -> Result<()> {
    client
        .connect(client.known_registry(address), Arc::new(NoopListener))
        .await
        .with_context(|| format!("unable to connect to {}", address))?;
    info!(%address, wait = ?args.wait(), "connected, waiting for providers");
    tokio::time::sleep(args.wait()).await;

    match args.command() {
        Command::Services { app, interface } => {
            let mut services = client.services(address, app.as_deref(), interface.as_deref())?;
            services.sort_by(|a, b| {
                (&a.app_name, &a.interface_name, &a.provider_address).cmp(&(
                    &b.app_name,
                    &b.interface_name,
                    &b.provider_address,
                ))
            });
            for info in &services {
                writeln!(out, "{}", format_service(info))?;
            }
        }
        Command::Methods { interface, app } => {
            let methods = introspect(client, address, interface, app.as_deref()).await?;
            for m in &methods {
                writeln!(out, "{}", format_method(m))?;
            }
        }
        Command::Invoke {
            interface,
            method,
            args: parameters,
            version,
            group,
            provider,
            app,
            count,
            workers,
        } => {
            let app = match app {
                Some(app) => app.clone(),
                None => client
                    .directory()
                    .services(address, None, Some(interface.as_str()))
                    .first()
                    .map(|s| s.app_name.clone())
                    .unwrap_or_default(),
            };

            let mut request = InvocationRequest::new(&app, interface, method, version)
                .with_provider(provider.clone())
                .with_group(group.clone());
            request.parameters = parameters.clone();

            let spec = match count {
                Some(n) => ConcurrentSpec::new(*n, *workers),
                None => ConcurrentSpec::NONE,
            };

            match client.execute(address, request, spec).await? {
                Execution::Single(result) => writeln!(out, "{}", format_result(&result))?,
                Execution::Batch(batch) => stream_batch(batch, out).await?,
            }
        }
    }

    out.flush()?;
    Ok(())
}

async fn introspect(
    client: &ClientRegistry,
    address: &str,
    interface: &str,
    app: Option<&str>,
) -> Result<Vec<MethodInfo>> {
    let services = client.services(address, app, Some(interface))?;
    if services.is_empty() {
        bail!("no provider registered for {}", interface);
    }

    let mut last_error = None;
    for info in &services {
        match client.get_service_info(info).await {
            Ok(info) => return Ok(info.methods.unwrap_or_default()),
            Err(e) => {
                warn!(provider = %info.provider_address, error = %e, "introspection failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => anyhow!(e),
        None => anyhow!("no provider answered for {}", interface),
    })
}

async fn stream_batch<W: Write>(
    batch: probe_service::ConcurrentInvocation,
    out: &mut W,
) -> Result<()> {
    let cancel = batch.canceller();
    let total = batch.total();
    let mut results = batch.into_stream();

    let mut received = 0;
    let mut failed = 0;
    loop {
        tokio::select! {
            next = results.next() => match next {
                Some(result) => {
                    received += 1;
                    if !result.is_success() {
                        failed += 1;
                    }
                    writeln!(out, "[{}/{}] {}", received, total, format_result(&result))?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                info!("interrupted, cancelling the remaining calls");
                cancel.cancel();
            }
        }
    }

    writeln!(out, "{} calls, {} failed", received, failed)?;
    Ok(())
}

pub fn format_service(info: &ServiceInfo) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        info.app_name,
        info.interface_name,
        if info.version.is_empty() { "-" } else { info.version.as_str() },
        info.group.as_deref().unwrap_or("-"),
        info.provider_address
    )
}

pub fn format_method(method: &MethodInfo) -> String {
    format!(
        "{}\t{} {}({})",
        method.key(),
        method.return_type(),
        method.name(),
        method.argument_types().join(", ")
    )
}

pub fn format_result(result: &InvocationResult) -> String {
    let mut line = match (&result.exception, &result.data) {
        (Some(e), _) => format!("error: {}", e),
        (None, Some(data)) => data.to_string(),
        (None, None) => "null".to_string(),
    };

    if !result.attachments.is_empty() {
        let mut attachments: Vec<_> = result
            .attachments
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        attachments.sort();
        line.push_str(&format!(" [{}]", attachments.join(", ")));
    }
    line
}
