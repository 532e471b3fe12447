//! Ambient configuration — the per-server/per-session parameter bag each
//! worker is constructed from.
//!
//! Shaped like `FtpConnectionConfig` + `TransferQueueConfig`
//! (`sorng-ftp::ftp::types`): a flat, `serde`-derived struct with field
//! defaults, serialized as a key/value bag rather than a normative
//! on-disk format.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsPolicy {
    None,
    /// `AUTH TLS` after connecting in plaintext.
    Explicit,
    /// TLS handshake immediately upon TCP connect.
    Implicit,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

impl Default for DataChannelMode {
    fn default() -> Self {
        DataChannelMode::Passive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    Ascii,
    Binary,
}

impl Default for TransferMode {
    fn default() -> Self {
        TransferMode::Binary
    }
}

/// Default resolution for a target file that already exists locally (the
/// operation-wide "force action"). An item's own `force_action` — a
/// per-item override set by the user resolving an earlier prompt — takes
/// precedence over this operation-wide default when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwritePolicy {
    Overwrite,
    Skip,
    Autorename,
    Resume,
}

impl Default for OverwritePolicy {
    fn default() -> Self {
        OverwritePolicy::Overwrite
    }
}

/// What to do when a `SITE CHMOD` would silently drop an attribute bit
/// the configured and/or-mask can't represent (setuid/setgid/sticky on a
/// plain `rwx` mask) — spec.md §4.8.1's change-attributes policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnknownAttrsPolicy {
    /// Apply the mask anyway and lose the bit.
    Ignore,
    /// Leave the file's attributes untouched.
    Skip,
    /// Park the item in `user-input-needed` for the caller to decide.
    AskUser,
}

impl Default for UnknownAttrsPolicy {
    fn default() -> Self {
        UnknownAttrsPolicy::AskUser
    }
}

/// What to do with a dotfile/hidden entry the operation would otherwise
/// delete — spec.md §3's `DeleteLink`/`DeleteFile`/`DeleteExploreDir`
/// `is_hidden_*` fields exist precisely so this policy has something to
/// consult before the worker issues `DELE`/`RMD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HiddenItemPolicy {
    /// Delete hidden entries the same as any other.
    Delete,
    /// Leave hidden entries alone.
    Skip,
    /// Park the item in `user-input-needed` for the caller to decide.
    AskUser,
}

impl Default for HiddenItemPolicy {
    fn default() -> Self {
        HiddenItemPolicy::Skip
    }
}

fn default_port() -> u16 {
    21
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_data_timeout() -> u64 {
    20
}
fn default_keepalive_interval() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    5
}
fn default_max_concurrent_workers() -> usize {
    1
}
fn default_list_command() -> String {
    "LIST".to_string()
}
fn default_true() -> bool {
    true
}

/// Everything a single worker needs to connect, log in, and drive one FTP
/// server. Cloned per worker; shared fields (speed limit) live behind the
/// coordinator instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub account: Option<String>,

    #[serde(default)]
    pub tls_policy: TlsPolicy,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    #[serde(default)]
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub use_mode_z: bool,
    #[serde(default)]
    pub mode_z_level: Option<u32>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_sec: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_sec: u64,

    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    /// Aggregate speed cap across all workers of this operation, 0 = unlimited.
    #[serde(default)]
    pub max_bandwidth_bytes_per_sec: u64,

    #[serde(default = "default_list_command")]
    pub list_command: String,
    #[serde(default = "default_true")]
    pub prefer_mlsd: bool,
    #[serde(default)]
    pub initial_directory: Option<String>,
    /// Commands sent immediately after login, before any queued work.
    #[serde(default)]
    pub login_script: Vec<String>,
    #[serde(default)]
    pub active_bind_address: Option<String>,

    /// Proxy dialect to run before the usual `USER`/`PASS` login — see
    /// `src/proxy.rs`. `ProxyServerType::NotUsed` (the default) skips the
    /// login-script entirely and dials `host`/`port` directly.
    #[serde(default)]
    pub proxy_type: crate::proxy::ProxyServerType,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,

    /// How to resolve a target file that already exists locally, absent a
    /// per-item `force_action` override.
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,

    /// `and`-mask applied to a file's current permission bits before
    /// `or`-ing in `chattrs_or_mask`, for change-attributes operations.
    #[serde(default)]
    pub chattrs_and_mask: Option<u32>,
    #[serde(default)]
    pub chattrs_or_mask: Option<u32>,
    #[serde(default)]
    pub unknown_attrs_policy: UnknownAttrsPolicy,
    #[serde(default)]
    pub hidden_item_policy: HiddenItemPolicy,

    #[serde(default)]
    pub label: Option<String>,
}

impl OperationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_sec)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"host":"ftp.example.com","username":"anon","password":"x"}"#;
        let cfg: OperationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 21);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.list_command, "LIST");
        assert!(cfg.prefer_mlsd);
        assert_eq!(cfg.tls_policy, TlsPolicy::None);
    }
}
