//! Network-policy collaborator: the mechanism that actually blocks and
//! unblocks outbound access. The schedule engine only decides *when*; the
//! policy decides *how*, and both directions must be idempotent.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("network policy is not supported on this host")]
    Unsupported,
    #[error("proxy configuration failed: {0}")]
    Proxy(String),
}

pub trait NetworkPolicy: Send + Sync {
    fn block(&self) -> Result<(), PolicyError>;
    fn unblock(&self) -> Result<(), PolicyError>;
}

/// Blocks outbound access by pointing the system-wide proxy at an
/// unreachable address, and unblocks by disabling the proxy again.
pub struct SystemProxyPolicy {
    block_proxy: String,
}

impl SystemProxyPolicy {
    pub fn new(block_proxy: impl Into<String>) -> Self {
        Self {
            block_proxy: block_proxy.into(),
        }
    }
}

impl Default for SystemProxyPolicy {
    fn default() -> Self {
        Self::new("127.0.0.1:9999")
    }
}

impl NetworkPolicy for SystemProxyPolicy {
    #[cfg(windows)]
    fn block(&self) -> Result<(), PolicyError> {
        windows_proxy::enable(&self.block_proxy)
    }

    #[cfg(windows)]
    fn unblock(&self) -> Result<(), PolicyError> {
        windows_proxy::disable()
    }

    #[cfg(not(windows))]
    fn block(&self) -> Result<(), PolicyError> {
        let _ = &self.block_proxy;
        Err(PolicyError::Unsupported)
    }

    #[cfg(not(windows))]
    fn unblock(&self) -> Result<(), PolicyError> {
        Err(PolicyError::Unsupported)
    }
}

#[cfg(windows)]
mod windows_proxy {
    use super::PolicyError;
    use std::process::Command;

    const INTERNET_SETTINGS: &str =
        r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    fn reg_add(value: &str, kind: &str, data: &str) -> Result<(), PolicyError> {
        let status = Command::new("reg")
            .args([
                "add",
                INTERNET_SETTINGS,
                "/v",
                value,
                "/t",
                kind,
                "/d",
                data,
                "/f",
            ])
            .status()
            .map_err(|err| PolicyError::Proxy(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(PolicyError::Proxy(format!(
                "reg add {value} exited with {status}"
            )))
        }
    }

    pub fn enable(proxy: &str) -> Result<(), PolicyError> {
        reg_add("ProxyEnable", "REG_DWORD", "1")?;
        reg_add("ProxyServer", "REG_SZ", proxy)
    }

    pub fn disable() -> Result<(), PolicyError> {
        reg_add("ProxyEnable", "REG_DWORD", "0")
    }
}

/// Connectivity probe: attempts a TCP connection to a well-known endpoint
/// within the given deadline.
pub async fn probe(target: &str, deadline: Duration) -> bool {
    matches!(
        tokio::time::timeout(deadline, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}
