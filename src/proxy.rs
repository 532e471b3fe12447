//! FTP proxy login-script DSL.
//!
//! The bundled script templates are taken verbatim from the original
//! `GetProxyScriptText()` table (`examples/original_source/src/plugins/ftp/ftp2.cpp`)
//! — the `Connect to: $(Host):$(Port)` first line, `$(...)` variable
//! substitution, and the `3xx:`-guarded conditional lines all come from
//! that table rather than from first principles.

use crate::error::{EngineError, EngineResult};
use crate::protocol::FtpCodec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyServerType {
    NotUsed,
    Socks4,
    Socks4A,
    Socks5,
    Http1_1,
    FtpSiteHostColonPort,
    FtpSiteHostSpacePort,
    FtpSiteUserHostColonPort,
    FtpSiteUserHostSpacePort,
    FtpOpenHostPort,
    FtpTransparent,
    FtpUserUserHostColonPort,
    FtpUserUserHostSpacePort,
    FtpUserFireuserHost,
    FtpUserUserFireuserHost,
}

impl Default for ProxyServerType {
    fn default() -> Self {
        ProxyServerType::NotUsed
    }
}

fn script_text(t: ProxyServerType) -> &'static str {
    match t {
        ProxyServerType::NotUsed => {
            "Connect to: $(Host):$(Port)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::Socks4 | ProxyServerType::Socks4A | ProxyServerType::Socks5 | ProxyServerType::Http1_1 => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpSiteHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             SITE $(Host):$(Port)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpSiteHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             SITE $(Host) $(Port)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpSiteUserHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             SITE $(User)@$(Host):$(Port)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpSiteUserHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             SITE $(User)@$(Host) $(Port)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpOpenHostPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             OPEN $(Host):$(Port)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpTransparent => {
            "Connect to: $(Host):$(Port)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpUserUserHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             USER $(User)@$(Host):$(Port)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpUserUserHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             USER $(User)@$(Host) $(Port)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpUserFireuserHost => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(ProxyUser)@$(Host):$(Port)\r\n\
             3xx: PASS $(ProxyPassword)\r\n\
             USER $(User)\r\n\
             3xx: PASS $(Password)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
        ProxyServerType::FtpUserUserFireuserHost => {
            "Connect to: $(ProxyHost):$(ProxyPort)\r\n\
             USER $(User)@$(ProxyUser)@$(Host):$(Port)\r\n\
             3xx: PASS $(Password)@$(ProxyPassword)\r\n\
             3xx: ACCT $(Account)\r\n"
        }
    }
}

/// Substitution values available to a script. `account`/`proxy_user`/
/// `proxy_password` are optional — lines whose only variable is one of
/// these are dropped entirely when it is absent, matching the original
/// script interpreter's handling of unused credentials.
#[derive(Debug, Clone, Default)]
pub struct ProxyVars {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub account: Option<String>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
}

impl ProxyVars {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "Host" => Some(self.host.clone()),
            "Port" => Some(self.port.to_string()),
            "User" => Some(self.user.clone()),
            "Password" => Some(self.password.clone()),
            "Account" => self.account.clone(),
            "ProxyHost" => Some(self.proxy_host.clone()),
            "ProxyPort" => Some(self.proxy_port.to_string()),
            "ProxyUser" => self.proxy_user.clone(),
            "ProxyPassword" => self.proxy_password.clone(),
            _ => None,
        }
    }
}

/// One line of the compiled script, after variable substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStep {
    pub command: String,
    /// Only send this command if the previous reply's significance digit
    /// was 3 (`3xx:`-guarded lines, e.g. `PASS` only after an intermediate
    /// `USER` reply).
    pub requires_intermediate_reply: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyScript {
    pub connect_host: String,
    pub connect_port: u16,
    pub steps: Vec<ProxyStep>,
}

/// Substitute every `$(Name)` token in `line`. Returns `None` if the line
/// names exactly one optional variable and that variable is absent — such
/// a line is dropped rather than sent with an empty value (e.g. no `ACCT`
/// command at all when no account was configured).
fn substitute(line: &str, vars: &ProxyVars) -> Option<String> {
    let var_count = line.matches("$(").count();
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    let mut any_missing = false;

    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        match vars.lookup(name) {
            Some(v) => out.push_str(&v),
            None => any_missing = true,
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    if var_count == 1 && any_missing {
        None
    } else {
        Some(out)
    }
}

pub fn compile(server_type: ProxyServerType, vars: &ProxyVars) -> EngineResult<ProxyScript> {
    let text = script_text(server_type);
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());

    let first = lines
        .next()
        .ok_or_else(|| EngineError::proxy_error("empty proxy script"))?;
    let connect_spec = first
        .strip_prefix("Connect to: ")
        .ok_or_else(|| EngineError::proxy_error("proxy script must start with 'Connect to:'"))?;
    let connect_spec = substitute(connect_spec, vars)
        .ok_or_else(|| EngineError::proxy_error("proxy script connect line missing required variable"))?;
    let (host, port) = connect_spec
        .rsplit_once(':')
        .ok_or_else(|| EngineError::proxy_error("proxy script connect line missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| EngineError::proxy_error(format!("invalid port in proxy script: {}", port)))?;

    let mut steps = Vec::new();
    for line in lines {
        let (guarded, body) = match line.strip_prefix("3xx: ") {
            Some(b) => (true, b),
            None => (false, line),
        };
        if let Some(command) = substitute(body, vars) {
            steps.push(ProxyStep {
                command,
                requires_intermediate_reply: guarded,
            });
        }
    }

    Ok(ProxyScript {
        connect_host: host.to_string(),
        connect_port: port,
        steps,
    })
}

/// Execute a compiled script's steps over an already-connected control
/// codec (the `Connect to:` line has already been acted on by the caller
/// before this runs). Stops at the first unconditional command that fails;
/// a `3xx:`-guarded step is simply skipped if the prior reply wasn't 3xx.
pub async fn run(codec: &mut FtpCodec, script: &ProxyScript) -> EngineResult<()> {
    let mut last_significance = 0u16;
    for step in &script.steps {
        if step.requires_intermediate_reply && last_significance != 3 {
            continue;
        }
        let resp = codec.execute(&step.command).await?;
        last_significance = resp.significance();
        if last_significance >= 4 {
            return Err(EngineError::from_reply(resp.code, &resp.text()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> ProxyVars {
        ProxyVars {
            host: "ftp.example.com".into(),
            port: 21,
            user: "alice".into(),
            password: "secret".into(),
            account: None,
            proxy_host: "proxy.example.com".into(),
            proxy_port: 1080,
            proxy_user: None,
            proxy_password: None,
        }
    }

    #[test]
    fn direct_connection_compiles_connect_line() {
        let script = compile(ProxyServerType::NotUsed, &vars()).unwrap();
        assert_eq!(script.connect_host, "ftp.example.com");
        assert_eq!(script.connect_port, 21);
    }

    #[test]
    fn missing_account_drops_the_acct_line() {
        let script = compile(ProxyServerType::NotUsed, &vars()).unwrap();
        assert!(script.steps.iter().all(|s| !s.command.starts_with("ACCT")));
        assert!(script.steps.iter().any(|s| s.command == "USER alice"));
    }

    #[test]
    fn present_account_keeps_the_acct_line() {
        let mut v = vars();
        v.account = Some("acct1".into());
        let script = compile(ProxyServerType::NotUsed, &v).unwrap();
        assert!(script.steps.iter().any(|s| s.command == "ACCT acct1"));
    }

    #[test]
    fn socks5_connects_to_the_proxy_not_the_target() {
        let script = compile(ProxyServerType::Socks5, &vars()).unwrap();
        assert_eq!(script.connect_host, "proxy.example.com");
        assert_eq!(script.connect_port, 1080);
    }

    #[test]
    fn ftp_site_chains_proxy_login_then_site_then_target_login() {
        let mut v = vars();
        v.proxy_user = Some("fw_user".into());
        v.proxy_password = Some("fw_pass".into());
        let script = compile(ProxyServerType::FtpSiteHostColonPort, &v).unwrap();
        let commands: Vec<&str> = script.steps.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands[0], "USER fw_user");
        assert!(commands.contains(&"SITE ftp.example.com:21"));
        assert!(commands.contains(&"USER alice"));
    }

    #[tokio::test]
    async fn guarded_lines_are_skipped_without_an_intermediate_reply() {
        // PASS/ACCT are only sent after a 3xx reply; a script compiled
        // with guarded steps should not panic or misfire when the
        // "previous reply" bookkeeping starts at 0 (no reply yet).
        let script = compile(ProxyServerType::NotUsed, &vars()).unwrap();
        assert!(script.steps.iter().any(|s| s.requires_intermediate_reply));
    }
}
