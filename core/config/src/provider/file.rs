// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use super::ConfigProvider;
use super::ProviderError;

/// Reads `${file:path}` values, e.g. a registry password kept in a secret
/// file. A single trailing newline is dropped.
pub struct FileConfigProvider;

impl ConfigProvider for FileConfigProvider {
    fn load(&self, file_path: &str) -> Result<String, ProviderError> {
        let mut content = std::fs::read_to_string(file_path)?;
        if content.ends_with('\n') {
            content.pop();
            if content.ends_with('\r') {
                content.pop();
            }
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_newline_is_dropped() {
        let path = std::env::temp_dir().join(format!("probe-secret-{}", std::process::id()));
        std::fs::write(&path, "s3cret\n").unwrap();

        let value = FileConfigProvider.load(path.to_str().unwrap()).unwrap();
        assert_eq!(value, "s3cret");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let res = FileConfigProvider.load("/does/not/exist");
        assert!(matches!(res, Err(ProviderError::IoError(_))));
    }
}
