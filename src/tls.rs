//! TLS helpers for explicit (`AUTH TLS`) and implicit FTPS.
//!
//! Shaped after `sorng-ftp::ftp::tls`, retargeted from
//! `native_tls`/`tokio_native_tls` to the `rustls`/`tokio-rustls` stack this
//! crate's `Cargo.toml` declares (see `protocol.rs` doc comment).

use crate::error::{EngineError, EngineResult};
use crate::protocol::{FtpCodec, ReadHalf, WriteHalf};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Certificate verifier that accepts anything — used only when the caller
/// has explicitly opted into `accept_invalid_certs`.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a `TlsConnector` honoring the server's invalid-certificate policy.
pub fn build_tls_connector(accept_invalid_certs: bool) -> EngineResult<TlsConnector> {
    let config = if accept_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::trace!("native cert store load warning: {}", err);
        }
        for cert in native.certs {
            // Best-effort: a handful of malformed OS certs should not abort startup.
            let _ = roots.add(cert);
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Reunite a codec's plain halves back into a single `TcpStream`, erroring
/// if the codec has already been upgraded to TLS (can only happen once).
fn reunite_plain(codec: FtpCodec) -> EngineResult<TcpStream> {
    match (codec.reader, codec.writer) {
        (ReadHalf::Plain(r), WriteHalf::Plain(w)) => {
            let rd = r.into_inner();
            rd.reunite(w)
                .map_err(|e| EngineError::tls_failed(format!("cannot reunite control stream: {}", e)))
        }
        _ => Err(EngineError::tls_failed("control connection is already TLS")),
    }
}

/// Perform the `AUTH TLS` handshake on an already-connected, still-plain
/// control codec, returning it rewrapped as TLS.
pub async fn upgrade_to_tls(codec: FtpCodec, host: &str, accept_invalid_certs: bool) -> EngineResult<FtpCodec> {
    let tcp = reunite_plain(codec)?;
    let connector = build_tls_connector(accept_invalid_certs)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| EngineError::tls_failed(format!("invalid TLS server name: {}", host)))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| EngineError::tls_failed(e.to_string()))?;
    Ok(FtpCodec::from_tls(stream))
}

/// Wrap a freshly-opened data connection in TLS (for FTPS data channels,
/// after `PROT P`).
pub async fn wrap_data_stream(
    tcp: TcpStream,
    host: &str,
    accept_invalid_certs: bool,
) -> EngineResult<TlsStream<TcpStream>> {
    let connector = build_tls_connector(accept_invalid_certs)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| EngineError::tls_failed(format!("invalid TLS server name: {}", host)))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| EngineError::tls_failed(e.to_string()))
}
