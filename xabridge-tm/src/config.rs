//! Transaction-manager configuration.
//!
//! Built once, validated in [`TmConfigBuilder::build`], and frozen before
//! `init()`. The coordinator name is embedded in every global xid it
//! creates, so its length is bounded by the xid layout.

use std::sync::Arc;

use xabridge_core::xid::MAX_TM_NAME_LEN;
use xabridge_core::{Result, TxError};

use crate::log::TxLog;

/// Default cap on branches per transaction.
pub const DEFAULT_MAX_BRANCHES: u8 = 16;

/// Validated coordinator configuration.
pub struct TmConfig {
    pub(crate) tm_name: String,
    pub(crate) max_branches: u8,
    pub(crate) log: Option<Arc<dyn TxLog>>,
}

impl std::fmt::Debug for TmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmConfig")
            .field("tm_name", &self.tm_name)
            .field("max_branches", &self.max_branches)
            .field("log", &self.log.as_ref().map(|_| "Arc<dyn TxLog>"))
            .finish()
    }
}

impl TmConfig {
    /// Starts building a configuration.
    pub fn builder() -> TmConfigBuilder {
        TmConfigBuilder::default()
    }

    /// The coordinator name embedded in global xids.
    pub fn tm_name(&self) -> &str {
        &self.tm_name
    }

    /// The per-transaction branch cap.
    pub fn max_branches(&self) -> u8 {
        self.max_branches
    }
}

/// Builder for [`TmConfig`].
#[derive(Default)]
pub struct TmConfigBuilder {
    tm_name: Option<String>,
    max_branches: Option<u8>,
    log: Option<Arc<dyn TxLog>>,
}

impl TmConfigBuilder {
    /// Sets the coordinator name (required). Embedded in every global xid.
    pub fn tm_name(mut self, name: impl Into<String>) -> Self {
        self.tm_name = Some(name.into());
        self
    }

    /// Caps the number of branches per transaction (default 16).
    pub fn max_branches(mut self, max: u8) -> Self {
        self.max_branches = Some(max);
        self
    }

    /// Installs a transaction-log backend. Without one the coordinator uses
    /// the in-memory log.
    pub fn tx_log(mut self, log: Arc<dyn TxLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<TmConfig> {
        let tm_name = self
            .tm_name
            .ok_or_else(|| TxError::Config("tm_name is required".to_string()))?;
        if tm_name.is_empty() {
            return Err(TxError::Config("tm_name must not be empty".to_string()));
        }
        if tm_name.len() > MAX_TM_NAME_LEN {
            return Err(TxError::NameTooLong(format!(
                "tm name '{}' is {} bytes, max {}",
                tm_name,
                tm_name.len(),
                MAX_TM_NAME_LEN
            )));
        }
        let max_branches = self.max_branches.unwrap_or(DEFAULT_MAX_BRANCHES);
        if max_branches == 0 || max_branches > 127 {
            return Err(TxError::Config(format!(
                "max_branches {} out of range 1..=127",
                max_branches
            )));
        }
        Ok(TmConfig {
            tm_name,
            max_branches,
            log: self.log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemTxLog;

    #[test]
    fn test_defaults() {
        let config = TmConfig::builder().tm_name("tm1").build().unwrap();
        assert_eq!(config.tm_name(), "tm1");
        assert_eq!(config.max_branches(), DEFAULT_MAX_BRANCHES);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_tm_name_required() {
        let err = TmConfig::builder().build().unwrap_err();
        assert!(matches!(err, TxError::Config(_)));

        let err = TmConfig::builder().tm_name("").build().unwrap_err();
        assert!(matches!(err, TxError::Config(_)));
    }

    #[test]
    fn test_tm_name_length_checked() {
        let long = "x".repeat(MAX_TM_NAME_LEN + 1);
        let err = TmConfig::builder().tm_name(long).build().unwrap_err();
        assert!(matches!(err, TxError::NameTooLong(_)));
    }

    #[test]
    fn test_max_branches_bounds() {
        let err = TmConfig::builder()
            .tm_name("tm")
            .max_branches(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, TxError::Config(_)));

        let err = TmConfig::builder()
            .tm_name("tm")
            .max_branches(128)
            .build()
            .unwrap_err();
        assert!(matches!(err, TxError::Config(_)));

        let config = TmConfig::builder()
            .tm_name("tm")
            .max_branches(127)
            .build()
            .unwrap();
        assert_eq!(config.max_branches(), 127);
    }

    #[test]
    fn test_custom_log_backend() {
        let config = TmConfig::builder()
            .tm_name("tm")
            .tx_log(std::sync::Arc::new(MemTxLog::new()))
            .build()
            .unwrap();
        assert!(config.log.is_some());
    }
}
