// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use clap::{Parser, Subcommand};
use probe_service::Parameter;

/// Browse and invoke Dubbo services through their registry
#[derive(Parser, Debug)]
#[command(name = "dubbo-probe", version, about)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "DUBBO_PROBE_CONFIG", global = true)]
    config: Option<String>,

    /// Registry address, e.g. zookeeper://127.0.0.1:2181 or multicast://224.5.6.7:1234
    #[arg(short, long, env = "DUBBO_PROBE_REGISTRY", global = true)]
    registry: Option<String>,

    /// How long to collect provider notifications after connecting (e.g. 3s)
    #[arg(long, default_value = "3s", value_parser = parse_duration, global = true)]
    wait: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List the registered providers
    #[command(alias = "ls")]
    Services {
        /// Only the services of this application
        #[arg(long)]
        app: Option<String>,

        /// Only the providers of this interface
        #[arg(long)]
        interface: Option<String>,
    },

    /// Show the methods of an interface, asking one of its providers
    Methods {
        interface: String,

        #[arg(long)]
        app: Option<String>,
    },

    /// Call a method, once or as a concurrent batch
    Invoke {
        interface: String,

        method: String,

        /// Argument as TYPE=JSON, e.g. java.lang.String='"bob"'. Repeat in order.
        #[arg(short = 'a', long = "arg", value_parser = parse_parameter)]
        args: Vec<Parameter>,

        #[arg(long, default_value = "")]
        version: String,

        #[arg(long)]
        group: Option<String>,

        /// Call this provider (host:port) instead of a random one
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        app: Option<String>,

        /// Number of calls of a concurrent batch
        #[arg(long)]
        count: Option<usize>,

        /// Calls running at the same time in a batch
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
}

impl Args {
    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

fn parse_duration(input: &str) -> Result<Duration, String> {
    duration_str::parse(input).map_err(|e| e.to_string())
}

/// `TYPE=VALUE`. The value is read as JSON, or taken as a plain string when
/// it is not valid JSON.
pub fn parse_parameter(input: &str) -> Result<Parameter, String> {
    let (type_name, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=VALUE, got '{}'", input))?;

    let type_name = type_name.trim();
    if type_name.is_empty() {
        return Err(format!("missing argument type in '{}'", input));
    }

    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    Ok(Parameter {
        type_name: type_name.to_string(),
        value,
    })
}
