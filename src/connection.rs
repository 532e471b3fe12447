//! Control connection establishment: TCP connect, optional immediate TLS
//! wrap for implicit FTPS. The `AUTH TLS` (explicit) upgrade happens later,
//! once logged-in context is available — see `worker.rs`.
//!
//! Shaped after `sorng-ftp::ftp::connection`.

use crate::config::TlsPolicy;
use crate::error::{EngineError, EngineResult};
use crate::protocol::{FtpCodec, FtpResponse};
use crate::tls;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Open the control connection and, for implicit TLS, perform the TLS
/// handshake before reading the server's welcome banner.
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    tls_policy: TlsPolicy,
    accept_invalid_certs: bool,
) -> EngineResult<(FtpCodec, FtpResponse)> {
    if host.is_empty() {
        return Err(EngineError::invalid_config("host must not be empty"));
    }

    let addr = format!("{}:{}", host, port);
    let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| EngineError::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| EngineError::connection_failed(format!("connect to {} failed: {}", addr, e)))?;
    tcp.set_nodelay(true).ok();

    let mut codec = if tls_policy == TlsPolicy::Implicit {
        let connector_stream = tls::wrap_data_stream(tcp, host, accept_invalid_certs).await?;
        FtpCodec::from_tls(connector_stream)
    } else {
        FtpCodec::from_tcp(tcp)
    };

    let welcome = codec.read_response().await?;
    if !welcome.is_success() {
        return Err(EngineError::from_reply(welcome.code, &welcome.text()));
    }
    Ok((codec, welcome))
}
