// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use super::ConfigProvider;
use super::ProviderError;

// Environment-based config provider
pub struct EnvConfigProvider;

impl ConfigProvider for EnvConfigProvider {
    fn load(&self, key: &str) -> Result<String, ProviderError> {
        std::env::var(key).map_err(|_| ProviderError::EnvNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_existing_variable() {
        // PATH is set in every environment the tests run in
        let value = EnvConfigProvider.load("PATH").unwrap();
        assert!(!value.is_empty());
    }
}
