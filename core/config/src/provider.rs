// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod env;
pub mod file;

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_yaml::Value;
use thiserror::Error;
use tracing::trace;

use env::EnvConfigProvider;
use file::FileConfigProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("error reading file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("environment variable not set: {0}")]
    EnvNotFound(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// A source for values referenced as `${provider:key}` in configuration files.
pub trait ConfigProvider {
    fn load(&self, key: &str) -> Result<String, ProviderError>;
}

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\$\{(?P<provider>[a-z]+):(?P<key>[^}]+)\}").expect("valid placeholder regex");
}

pub struct ConfigResolver {
    providers: HashMap<&'static str, Box<dyn ConfigProvider + Send + Sync>>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        let mut providers: HashMap<&'static str, Box<dyn ConfigProvider + Send + Sync>> =
            HashMap::new();
        providers.insert("env", Box::new(EnvConfigProvider));
        providers.insert("file", Box::new(FileConfigProvider));

        ConfigResolver { providers }
    }

    /// Replace every placeholder found in the string values of the tree.
    pub fn resolve(&self, value: &mut Value) -> Result<(), ProviderError> {
        match value {
            Value::String(s) => {
                if PLACEHOLDER.is_match(s) {
                    *s = self.resolve_str(s)?;
                }
            }
            Value::Sequence(seq) => {
                for v in seq.iter_mut() {
                    self.resolve(v)?;
                }
            }
            Value::Mapping(map) => {
                for (_, v) in map.iter_mut() {
                    self.resolve(v)?;
                }
            }
            Value::Tagged(tagged) => self.resolve(&mut tagged.value)?,
            _ => {}
        }

        Ok(())
    }

    pub fn resolve_str(&self, input: &str) -> Result<String, ProviderError> {
        let mut error = None;
        let out = PLACEHOLDER.replace_all(input, |caps: &Captures| {
            let provider = &caps["provider"];
            let key = &caps["key"];
            trace!(%provider, %key, "resolving placeholder");

            let res = match self.providers.get(provider) {
                Some(p) => p.load(key),
                None => Err(ProviderError::UnknownProvider(provider.to_string())),
            };

            match res {
                Ok(v) => v,
                Err(e) => {
                    error.get_or_insert(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(out.into_owned()),
        }
    }
}
