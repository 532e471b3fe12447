//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Grounded on `sorng-ftp::ftp::protocol` — same split-half codec shape,
//! same multi-line-reply algorithm — retargeted from `tokio-native-tls` to
//! `tokio-rustls` to match this crate's declared TLS stack (`Cargo.toml`
//! already names `tokio-rustls` / `rustls` / `rustls-native-certs`, while
//! the original module used `native_tls` instead; see DESIGN.md).

use crate::error::{EngineError, EngineResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// One FTP reply, possibly multi-line.
#[derive(Debug, Clone)]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// First digit of the reply code (RFC 959 significance digit).
    pub fn significance(&self) -> u16 {
        self.code / 100
    }
}

/// Abstraction over plain TCP or TLS-wrapped read half.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// Abstraction over plain TCP or TLS-wrapped write half.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// The FTP command/response codec operating on split halves.
pub struct FtpCodec {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.reader, ReadHalf::Tls(_))
    }

    /// Send a raw FTP command (without trailing CRLF — added here).
    pub async fn send_command(&mut self, cmd: &str) -> EngineResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => w.write_all(line.as_bytes()).await?,
            WriteHalf::Tls(w) => w.write_all(line.as_bytes()).await?,
        }
        let redacted = redact_for_log(cmd);
        log::trace!(">>> {}", redacted);
        Ok(())
    }

    async fn read_line_raw(&mut self) -> EngineResult<String> {
        let mut buf = String::new();
        let n = match &mut self.reader {
            ReadHalf::Plain(r) => r.read_line(&mut buf).await?,
            ReadHalf::Tls(r) => r.read_line(&mut buf).await?,
        };
        if n == 0 {
            return Err(EngineError::disconnected("server closed the control connection"));
        }
        Ok(buf)
    }

    /// Read a complete FTP response (possibly multi-line).
    pub async fn read_response(&mut self) -> EngineResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first_trimmed = first.trim_end_matches(['\r', '\n']);

        if first_trimmed.len() < 3 {
            return Err(EngineError::protocol_error(format!(
                "response too short: '{}'",
                first_trimmed
            )));
        }

        let code = parse_code(first_trimmed)?;
        let mut lines = vec![first_trimmed.to_string()];

        let is_multi = first_trimmed.len() >= 4 && first_trimmed.as_bytes()[3] == b'-';
        if is_multi {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next_trimmed = next.trim_end_matches(['\r', '\n']);
                lines.push(next_trimmed.to_string());
                if next_trimmed.starts_with(&terminator) {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {} {}", resp.code, resp.lines.last().unwrap_or(&String::new()));
        Ok(resp)
    }

    pub async fn execute(&mut self, cmd: &str) -> EngineResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    pub async fn expect(&mut self, cmd: &str, expected_first_digit: u16) -> EngineResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if resp.significance() != expected_first_digit {
            return Err(EngineError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    pub async fn expect_ok(&mut self, cmd: &str) -> EngineResult<FtpResponse> {
        self.expect(cmd, 2).await
    }
}

/// Extract the quoted path from a `257 "/some/path" is current directory`
/// reply (RFC 959 §4.1.1), un-escaping the `""` -> `"` doubling a path
/// containing a literal quote would carry. Returns `None` if the reply
/// carries no quoted path at all.
pub fn parse_pwd_reply(text: &str) -> Option<String> {
    let first_quote = text.find('"')?;
    let rest = &text[first_quote + 1..];
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
                continue;
            }
            return Some(out);
        }
        out.push(c);
    }
    None
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> EngineResult<u16> {
    if line.len() < 3 {
        return Err(EngineError::protocol_error("response too short to contain a code"));
    }
    line[..3]
        .parse::<u16>()
        .map_err(|_| EngineError::protocol_error(format!("invalid reply code in: '{}'", line)))
}

/// Never let a USER/PASS/ACCT command leak a credential to the trace log.
fn redact_for_log(cmd: &str) -> String {
    let upper = cmd.to_ascii_uppercase();
    if upper.starts_with("PASS ") || upper.starts_with("ACCT ") {
        let head = cmd.split_whitespace().next().unwrap_or("");
        format!("{} ***", head)
    } else {
        cmd.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_reply_extracts_quoted_path() {
        assert_eq!(
            parse_pwd_reply(r#"257 "/pub/incoming" is current directory"#),
            Some("/pub/incoming".to_string())
        );
    }

    #[test]
    fn pwd_reply_unescapes_doubled_quotes() {
        assert_eq!(
            parse_pwd_reply(r#"257 "/pub/say ""hi""" is current directory"#),
            Some(r#"/pub/say "hi""#.to_string())
        );
    }

    #[test]
    fn pwd_reply_without_quotes_is_none() {
        assert_eq!(parse_pwd_reply("257 current directory unspecified"), None);
    }

    #[test]
    fn redact_masks_pass_and_acct_arguments() {
        assert_eq!(redact_for_log("PASS hunter2"), "PASS ***");
        assert_eq!(redact_for_log("ACCT billing"), "ACCT ***");
        assert_eq!(redact_for_log("USER anon"), "USER anon");
    }
}
