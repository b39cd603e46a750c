//! VM configuration and backend selection.

use std::str::FromStr;
use std::sync::Arc;

use crate::arch::Architecture;
use crate::backend::{self, FakeHypervisor, Hypervisor};
use crate::error::{Error, Result};

/// Environment variable selecting the default backend (`platform` or `fake`).
pub const BACKEND_ENV: &str = "HVCORE_BACKEND";

/// Default guest memory size (1 GiB).
pub const DEFAULT_MEMORY_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration for creating a VM. Immutable once the VM exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Guest memory size in bytes.
    pub memory_size: u64,
    /// Number of vCPUs the guest is expected to use.
    pub vcpu_count: u32,
    /// Guest architecture.
    pub architecture: Architecture,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            vcpu_count: 1,
            architecture: Architecture::current(),
        }
    }
}

/// Which backend implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// The native hypervisor of this platform.
    #[default]
    Platform,
    /// The deterministic in-memory backend.
    Fake,
}

impl BackendKind {
    /// Read [`BACKEND_ENV`], falling back to [`BackendKind::Platform`].
    ///
    /// Unrecognized values are ignored with a warning.
    pub fn from_env() -> Self {
        match std::env::var(BACKEND_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(%value, "ignoring unknown {}", BACKEND_ENV);
                BackendKind::Platform
            }),
            Err(_) => BackendKind::Platform,
        }
    }

    /// Instantiate the backend.
    pub fn instantiate(self) -> Result<Arc<dyn Hypervisor>> {
        match self {
            BackendKind::Platform => backend::platform().ok_or(Error::HypervisorNotSupported),
            BackendKind::Fake => Ok(Arc::new(FakeHypervisor::new())),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "platform" | "native" | "" => Ok(BackendKind::Platform),
            "fake" => Ok(BackendKind::Fake),
            _ => Err(Error::HypervisorNotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert_eq!(config.memory_size, 1 << 30);
        assert_eq!(config.vcpu_count, 1);
        assert_eq!(config.architecture, Architecture::current());
    }

    #[test]
    fn test_parse_backend_kind() {
        assert_eq!("fake".parse::<BackendKind>().unwrap(), BackendKind::Fake);
        assert_eq!(" Native ".parse::<BackendKind>().unwrap(), BackendKind::Platform);
        assert!("xen".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_fake_backend_instantiates() {
        let backend = BackendKind::Fake.instantiate().unwrap();
        assert_eq!(backend.name(), "fake");
        assert!(backend.is_supported());
    }
}
