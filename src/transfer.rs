//! Data-connection transport.
//!
//! Grounded on `sorng-ftp::ftp::transfer` for the PASV/EPSV/
//! PORT/EPRT dance and TLS wrapping; extended with a MODE Z decorator
//! (`compress.rs`) and an explicit state machine with three distinguished
//! failure classes (no-data-timeout, connection-dropped, decompression-
//! error). Exactly one `DataConnection` is ever open per worker at a time
//! — enforced by the worker holding it as an owned local, never stashed
//! anywhere shared.

use crate::config::{DataChannelMode, TlsPolicy};
use crate::error::{EngineError, EngineResult};
use crate::protocol::FtpCodec;
use crate::tls;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// State of a single data connection's lifecycle, mirrored in worker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataConnState {
    Opening,
    Established,
    Transferring,
    Closed,
    Failed,
}

/// The three ways a data connection can go wrong mid-transfer that the
/// worker must distinguish to decide retry vs. abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelFailure {
    /// No bytes arrived within `data_timeout`; server may be stalled.
    NoDataTimeout,
    /// The TCP connection was reset or closed before `226` arrived.
    ConnectionDropped,
    /// MODE Z stream was not valid deflate.
    DecompressionError,
}

impl From<DataChannelFailure> for EngineError {
    fn from(f: DataChannelFailure) -> Self {
        match f {
            DataChannelFailure::NoDataTimeout => EngineError::no_data_timeout("no data received within timeout"),
            DataChannelFailure::ConnectionDropped => EngineError::data_channel("data connection dropped"),
            DataChannelFailure::DecompressionError => EngineError::decompression_failed("MODE Z stream corrupt"),
        }
    }
}

enum RawStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// An established data connection, plain or TLS, optionally MODE Z framed.
pub struct DataConnection {
    stream: RawStream,
    pub state: DataConnState,
    use_mode_z: bool,
}

impl DataConnection {
    /// Read up to `buf.len()` raw (un-decompressed) bytes, applying
    /// `data_timeout` as the no-data watchdog.
    pub async fn read(&mut self, buf: &mut [u8], data_timeout: Duration) -> Result<usize, DataChannelFailure> {
        self.state = DataConnState::Transferring;
        let result = match &mut self.stream {
            RawStream::Plain(s) => timeout(data_timeout, s.read(buf)).await,
            RawStream::Tls(s) => timeout(data_timeout, s.read(buf)).await,
        };
        match result {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(_)) => {
                self.state = DataConnState::Failed;
                Err(DataChannelFailure::ConnectionDropped)
            }
            Err(_) => {
                self.state = DataConnState::Failed;
                Err(DataChannelFailure::NoDataTimeout)
            }
        }
    }

    pub async fn write_all(&mut self, buf: &[u8], data_timeout: Duration) -> Result<(), DataChannelFailure> {
        self.state = DataConnState::Transferring;
        let result = match &mut self.stream {
            RawStream::Plain(s) => timeout(data_timeout, s.write_all(buf)).await,
            RawStream::Tls(s) => timeout(data_timeout, s.write_all(buf)).await,
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.state = DataConnState::Failed;
                Err(DataChannelFailure::ConnectionDropped)
            }
            Err(_) => {
                self.state = DataConnState::Failed;
                Err(DataChannelFailure::NoDataTimeout)
            }
        }
    }

    pub async fn shutdown(mut self) -> EngineResult<()> {
        let res = match &mut self.stream {
            RawStream::Plain(s) => s.shutdown().await,
            RawStream::Tls(s) => s.shutdown().await,
        };
        self.state = DataConnState::Closed;
        res.map_err(EngineError::from)
    }

    pub fn uses_mode_z(&self) -> bool {
        self.use_mode_z
    }
}

/// Open a data connection according to `mode`, wrapping in TLS if
/// `tls_policy` requires a protected data channel (`PROT P`).
pub async fn open_data_channel(
    control: &mut FtpCodec,
    mode: DataChannelMode,
    tls_policy: TlsPolicy,
    host: &str,
    accept_invalid_certs: bool,
    connect_timeout: Duration,
    active_bind: Option<&str>,
    use_mode_z: bool,
) -> EngineResult<DataConnection> {
    let tcp = match mode {
        DataChannelMode::Passive => open_pasv(control, host, connect_timeout).await?,
        DataChannelMode::ExtendedPassive => open_epsv(control, host, connect_timeout).await?,
        DataChannelMode::Active => open_port(control, active_bind, connect_timeout).await?,
        DataChannelMode::ExtendedActive => open_eprt(control, active_bind, connect_timeout).await?,
    };

    let stream = if tls_policy != TlsPolicy::None {
        let tls_stream = tls::wrap_data_stream(tcp, host, accept_invalid_certs).await?;
        RawStream::Tls(tls_stream)
    } else {
        RawStream::Plain(tcp)
    };

    Ok(DataConnection {
        stream,
        state: DataConnState::Established,
        use_mode_z,
    })
}

fn pasv_regex() -> Regex {
    Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").unwrap()
}

fn epsv_regex() -> Regex {
    Regex::new(r"\|\|\|(\d+)\|").unwrap()
}

async fn open_pasv(control: &mut FtpCodec, fallback_host: &str, connect_timeout: Duration) -> EngineResult<TcpStream> {
    let resp = control.expect("PASV", 2).await?;
    let caps = pasv_regex()
        .captures(&resp.text())
        .ok_or_else(|| EngineError::data_channel("could not parse PASV reply"))?;
    let octets: Vec<u8> = (1..=4)
        .map(|i| caps[i].parse::<u8>().unwrap_or(0))
        .collect();
    let p1: u16 = caps[5].parse().unwrap_or(0);
    let p2: u16 = caps[6].parse().unwrap_or(0);
    let port = p1 * 256 + p2;
    let ip = IpAddr::from([octets[0], octets[1], octets[2], octets[3]]);
    let addr = SocketAddr::new(ip, port);
    let _ = fallback_host;
    timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| EngineError::timeout("PASV data connect timed out"))?
        .map_err(|e| EngineError::data_channel(format!("PASV data connect failed: {}", e)))
}

async fn open_epsv(control: &mut FtpCodec, host: &str, connect_timeout: Duration) -> EngineResult<TcpStream> {
    let resp = control.expect("EPSV", 2).await?;
    let caps = epsv_regex()
        .captures(&resp.text())
        .ok_or_else(|| EngineError::data_channel("could not parse EPSV reply"))?;
    let port: u16 = caps[1].parse().unwrap_or(0);
    let addr = format!("{}:{}", host, port);
    timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| EngineError::timeout("EPSV data connect timed out"))?
        .map_err(|e| EngineError::data_channel(format!("EPSV data connect failed: {}", e)))
}

async fn open_port(control: &mut FtpCodec, bind: Option<&str>, accept_timeout: Duration) -> EngineResult<TcpStream> {
    let bind_addr = bind.unwrap_or("0.0.0.0:0");
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| EngineError::data_channel(format!("cannot bind PORT listener: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| EngineError::data_channel(e.to_string()))?;

    let ip = match local.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => return Err(EngineError::data_channel("PORT requires an IPv4 bind address")),
    };
    let port = local.port();
    let p1 = port / 256;
    let p2 = port % 256;
    let cmd = format!(
        "PORT {},{},{},{},{},{}",
        ip[0], ip[1], ip[2], ip[3], p1, p2
    );
    control.expect_ok(&cmd).await?;

    let (stream, _peer) = timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| EngineError::timeout("PORT accept timed out"))?
        .map_err(|e| EngineError::data_channel(format!("PORT accept failed: {}", e)))?;
    Ok(stream)
}

async fn open_eprt(control: &mut FtpCodec, bind: Option<&str>, accept_timeout: Duration) -> EngineResult<TcpStream> {
    let bind_addr = bind.unwrap_or("0.0.0.0:0");
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| EngineError::data_channel(format!("cannot bind EPRT listener: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| EngineError::data_channel(e.to_string()))?;

    let af = match local.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    let cmd = format!("EPRT |{}|{}|{}|", af, local.ip(), local.port());
    control.expect_ok(&cmd).await?;

    let (stream, _peer) = timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| EngineError::timeout("EPRT accept timed out"))?
        .map_err(|e| EngineError::data_channel(format!("EPRT accept failed: {}", e)))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parses_octets_and_port() {
        let text = "227 Entering Passive Mode (192,168,1,5,195,80).";
        let caps = pasv_regex().captures(text).unwrap();
        assert_eq!(&caps[1], "192");
        assert_eq!(&caps[6], "80");
        let p1: u16 = caps[5].parse().unwrap();
        let p2: u16 = caps[6].parse().unwrap();
        assert_eq!(p1 * 256 + p2, 195 * 256 + 80);
    }

    #[test]
    fn epsv_reply_parses_port_only() {
        let text = "229 Entering Extended Passive Mode (|||6446|)";
        let caps = epsv_regex().captures(text).unwrap();
        assert_eq!(&caps[1], "6446");
    }
}
