//! CLI sessions over SSH, built on russh.
//!
//! The Junos CLI runs in a shell on a PTY channel and is scraped by
//! searching the tail of the output for the prompt. Files are pushed with
//! the SCP sink protocol (`scp -t`) on a separate exec channel of the same
//! connection.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client::{self, Handle, Msg};
use russh::keys::{load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use swcfg_common::{DeployConfig, DeployError, DeployResult, DeviceRecord};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{CliConnector, CliSession, COMMAND_READ_TIMEOUT, COMMIT_READ_TIMEOUT};

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Matches a Junos CLI prompt such as `deploy@sw-hall-a>` or
/// `deploy@sw-hall-a#`.
static PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+@\S+[>#%]\s*$").expect("Invalid regex pattern"));

/// Matches the context line Junos prints above the prompt, such as
/// `[edit]`, `{master:0}` or `{master:0}[edit]`.
static CONTEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\{[^}]+\})?(\[edit\])?\s*$").expect("Invalid regex pattern"));

/// Terminal width requested for the PTY; wide enough that Junos never wraps.
const TERMINAL_COLUMNS: u32 = 511;

/// Terminal height requested for the PTY.
const TERMINAL_ROWS: u32 = 24;

/// Host key policy for device connections: every key is accepted and its
/// fingerprint logged.
struct DeviceHost {
    address: IpAddr,
}

impl client::Handler for DeviceHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        tracing::debug!(
            address = %self.address,
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "Accepting host key"
        );
        Ok(true)
    }
}

/// Opens [`RusshSession`]s with public key authentication.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    user: String,
    key: PathBuf,
    port: u16,
    connect_timeout: Duration,
    session_log_dir: Option<PathBuf>,
}

impl RusshConnector {
    /// Creates a connector logging in as `user` with the private key `key`.
    pub fn new(user: impl Into<String>, key: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            key: key.into(),
            port: SSH_PORT,
            connect_timeout,
            session_log_dir: None,
        }
    }

    /// Appends every session transcript to `<dir>/<device id>.txt`.
    pub fn with_session_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_log_dir = Some(dir.into());
        self
    }

    /// Builds the connector from the `[deploy]` section.
    pub fn from_config(config: &DeployConfig) -> Self {
        let connector = Self::new(
            config.deploy.user.clone(),
            config.deploy.key.clone(),
            config.connect_timeout(),
        );
        match &config.session_log_dir {
            Some(dir) => connector.with_session_log_dir(dir.clone()),
            None => connector,
        }
    }

    async fn open_session_log(&self, record: &DeviceRecord) -> DeployResult<Option<File>> {
        let Some(dir) = &self.session_log_dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.txt", record.id)))
            .await?;
        Ok(Some(file))
    }

    /// Opens the transport and authenticates.
    async fn handshake(&self, address: IpAddr) -> DeployResult<Handle<DeviceHost>> {
        let key = load_secret_key(&self.key, None).map_err(|e| {
            DeployError::protocol(format!(
                "cannot load deploy key {}: {}",
                self.key.display(),
                e
            ))
        })?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            SocketAddr::new(address, self.port),
            DeviceHost { address },
        )
        .await
        .map_err(|e| ssh_error(address, e))?;

        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| ssh_error(address, e))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                self.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await
            .map_err(|e| ssh_error(address, e))?;
        if !auth.success() {
            return Err(DeployError::protocol(format!(
                "public key authentication as '{}' rejected by {}",
                self.user, address
            )));
        }
        Ok(handle)
    }
}

fn ssh_error(address: IpAddr, e: russh::Error) -> DeployError {
    DeployError::connection(address.to_string(), e.to_string())
}

#[async_trait]
impl CliConnector for RusshConnector {
    async fn connect(
        &self,
        address: IpAddr,
        record: &DeviceRecord,
    ) -> DeployResult<Box<dyn CliSession>> {
        let handle = tokio::time::timeout(self.connect_timeout, self.handshake(address))
            .await
            .map_err(|_| {
                DeployError::connection(
                    address.to_string(),
                    format!("no answer within {}s", self.connect_timeout.as_secs()),
                )
            })??;

        let shell = handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error(address, e))?;
        shell
            .request_pty(false, "vt100", TERMINAL_COLUMNS, TERMINAL_ROWS, 0, 0, &[])
            .await
            .map_err(|e| ssh_error(address, e))?;
        shell
            .request_shell(true)
            .await
            .map_err(|e| ssh_error(address, e))?;

        let mut session = RusshSession {
            handle,
            shell,
            address,
            buffer: String::new(),
            log: self.open_session_log(record).await?,
            in_config_mode: false,
        };

        session.read_until_prompt(COMMAND_READ_TIMEOUT).await?;
        session
            .send_command("set cli screen-length 0", COMMAND_READ_TIMEOUT)
            .await?;
        Ok(Box::new(session))
    }
}

/// One authenticated connection with an interactive CLI channel.
pub struct RusshSession {
    handle: Handle<DeviceHost>,
    shell: Channel<Msg>,
    address: IpAddr,
    buffer: String,
    log: Option<File>,
    in_config_mode: bool,
}

impl RusshSession {
    /// Reads until the last line of output is a CLI prompt.
    async fn read_until_prompt(&mut self, limit: Duration) -> DeployResult<String> {
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            let tail = self.buffer.rsplit('\n').next().unwrap_or("");
            if PROMPT_RE.is_match(tail) {
                return Ok(std::mem::take(&mut self.buffer));
            }

            let message = tokio::time::timeout_at(deadline, self.shell.wait())
                .await
                .map_err(|_| {
                    DeployError::connection(
                        self.address.to_string(),
                        format!("no prompt within {}s", limit.as_secs()),
                    )
                })?;

            match message {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let text = String::from_utf8_lossy(&data).replace('\r', "");
                    if let Some(log) = self.log.as_mut() {
                        log.write_all(text.as_bytes()).await?;
                    }
                    self.buffer.push_str(&text);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(DeployError::connection(
                        self.address.to_string(),
                        "session closed by remote",
                    ));
                }
                Some(_) => {}
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> DeployResult<()> {
        let data = format!("{}\n", line);
        self.shell
            .data(data.as_bytes())
            .await
            .map_err(|e| ssh_error(self.address, e))
    }

    /// Waits for the one byte acknowledgement of the SCP sink.
    async fn scp_ack(&self, channel: &mut Channel<Msg>, remote: &str) -> DeployResult<()> {
        let scp_failed = |message: String| DeployError::command(format!("scp -t {}", remote), message);

        loop {
            let message = tokio::time::timeout(COMMAND_READ_TIMEOUT, channel.wait())
                .await
                .map_err(|_| scp_failed("no acknowledgement".to_string()))?;
            match message {
                Some(ChannelMsg::Data { data }) => {
                    return match data.first() {
                        Some(0) => Ok(()),
                        Some(_) => Err(scp_failed(
                            String::from_utf8_lossy(&data[1..]).trim().to_string(),
                        )),
                        None => continue,
                    };
                }
                Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
                    return Err(scp_failed(format!("exit code {}", exit_status)));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(scp_failed("channel closed".to_string()));
                }
                Some(_) => {}
            }
        }
    }
}

/// Removes the echoed command, the trailing prompt and the context line
/// above it from `raw`.
fn strip_echo_and_prompt(command: &str, raw: &str) -> String {
    let mut lines: Vec<&str> = raw.split('\n').collect();
    if lines.last().is_some_and(|line| PROMPT_RE.is_match(line)) {
        lines.pop();
    }
    while lines.last().is_some_and(|line| CONTEXT_RE.is_match(line)) {
        lines.pop();
    }
    if let Some(position) = lines.iter().position(|line| line.trim_end().ends_with(command)) {
        lines.drain(..=position);
    }
    lines.join("\n")
}

#[async_trait]
impl CliSession for RusshSession {
    async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<()> {
        let content = tokio::fs::read(local).await?;
        let name = Path::new(remote)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| DeployError::protocol(format!("invalid upload path '{}'", remote)))?;

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error(self.address, e))?;
        channel
            .exec(true, format!("scp -t {}", remote))
            .await
            .map_err(|e| ssh_error(self.address, e))?;
        self.scp_ack(&mut channel, remote).await?;

        let header = format!("C0644 {} {}\n", content.len(), name);
        channel
            .data(header.as_bytes())
            .await
            .map_err(|e| ssh_error(self.address, e))?;
        self.scp_ack(&mut channel, remote).await?;

        tokio::time::timeout(COMMIT_READ_TIMEOUT, channel.data(&content[..]))
            .await
            .map_err(|_| DeployError::command(format!("scp -t {}", remote), "transfer timed out"))?
            .map_err(|e| ssh_error(self.address, e))?;
        channel
            .data(&b"\0"[..])
            .await
            .map_err(|e| ssh_error(self.address, e))?;
        self.scp_ack(&mut channel, remote).await?;

        channel.eof().await.map_err(|e| ssh_error(self.address, e))?;
        tracing::debug!(address = %self.address, remote, bytes = content.len(), "Upload complete");
        Ok(())
    }

    async fn config_mode(&mut self) -> DeployResult<()> {
        if self.in_config_mode {
            return Ok(());
        }
        let output = self.send_command("configure", COMMAND_READ_TIMEOUT).await?;
        if output.contains("error:") {
            return Err(DeployError::command("configure", output.trim()));
        }
        self.in_config_mode = true;
        Ok(())
    }

    async fn send_command(
        &mut self,
        command: &str,
        read_timeout: Duration,
    ) -> DeployResult<String> {
        tracing::debug!(address = %self.address, command, "Sending command");
        self.write_line(command).await?;
        let raw = self.read_until_prompt(read_timeout).await?;
        Ok(strip_echo_and_prompt(command, &raw))
    }

    async fn disconnect(&mut self) -> DeployResult<()> {
        if self.in_config_mode {
            self.write_line("exit configuration-mode").await?;
            self.in_config_mode = false;
        }
        // The remote may already have closed the channel.
        let _ = self.write_line("exit").await;
        let _ = self.shell.eof().await;

        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ssh_error(self.address, e))?;
        if let Some(log) = self.log.as_mut() {
            log.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_regex() {
        assert!(PROMPT_RE.is_match("deploy@sw-hall-a>"));
        assert!(PROMPT_RE.is_match("deploy@sw-hall-a# "));
        assert!(PROMPT_RE.is_match("root@sw-hall-a:RE:0%"));
        assert!(!PROMPT_RE.is_match("commit complete"));
        assert!(!PROMPT_RE.is_match("[edit system]"));
    }

    #[test]
    fn test_context_regex() {
        assert!(CONTEXT_RE.is_match("[edit]"));
        assert!(CONTEXT_RE.is_match("{master:0}"));
        assert!(CONTEXT_RE.is_match("{master:0}[edit]"));
        assert!(!CONTEXT_RE.is_match("[edit system login]"));
        assert!(!CONTEXT_RE.is_match("+  message \"b\";"));
    }

    #[test]
    fn test_strip_echo_and_prompt() {
        let raw = "show | compare \n[edit system]\n-  host-name a;\n+  host-name b;\n\n{master:0}[edit]\ndeploy@sw-hall-a# ";
        let output = strip_echo_and_prompt("show | compare", raw);
        assert_eq!(output, "[edit system]\n-  host-name a;\n+  host-name b;");
    }

    #[test]
    fn test_strip_plain_edit_context() {
        let raw = "show | compare \n[edit system login]\n-  message \"a\";\n+  message \"b\";\n\n[edit]\ndeploy@sw-hall-a# ";
        let output = strip_echo_and_prompt("show | compare", raw);
        assert_eq!(
            output,
            "[edit system login]\n-  message \"a\";\n+  message \"b\";"
        );
        assert!(crate::ssh::is_banner_only(&output));
    }

    #[test]
    fn test_strip_with_prompt_echo() {
        let raw = "deploy@sw-hall-a# commit\ncommit complete\ndeploy@sw-hall-a# ";
        assert_eq!(strip_echo_and_prompt("commit", raw), "commit complete");
    }

    #[test]
    fn test_from_config_session_log() {
        let mut config = DeployConfig::default();
        config.session_log_dir = Some(PathBuf::from("/var/log/swcfg"));
        let connector = RusshConnector::from_config(&config);
        assert_eq!(connector.session_log_dir, Some(PathBuf::from("/var/log/swcfg")));
        assert_eq!(connector.user, "swcfg");
        assert_eq!(connector.port, SSH_PORT);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_transient() {
        let connector = RusshConnector::new(
            "deploy",
            "/nonexistent/swcfg/key",
            Duration::from_secs(1),
        );
        let err = connector
            .handshake("127.0.0.1".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeployError::Protocol { .. }));
        assert!(!err.is_transient());
    }
}
