// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Configuration for the exception backend.
///
/// Fault handlers have been observed to exceed the default `SIGSTKSZ` in
/// practice, and some runtimes install their own alternate stack and check
/// the stack pointer from their chained handler. Both knobs exist so
/// embedders can match the behavior of the runtime they live inside: use an
/// existing alternate stack without creating one, or create and use a fresh
/// guarded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl BackendConfig {
    pub fn new(create_alt_stack: bool, use_alt_stack: bool) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        Ok(Self {
            create_alt_stack,
            use_alt_stack,
        })
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            create_alt_stack: false,
            use_alt_stack: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_without_use_is_rejected() {
        assert!(BackendConfig::new(true, false).is_err());
        assert!(BackendConfig::new(true, true).is_ok());
        assert!(BackendConfig::new(false, true).is_ok());
        assert!(BackendConfig::new(false, false).is_ok());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = BackendConfig::new(true, true).expect("config");
        let json = serde_json::to_string(&config).expect("serialize");
        let back: BackendConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }
}
