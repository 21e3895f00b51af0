//! SSH transport to the RDS management CLI.
//!
//! One session, one command channel per command. The transport is blocking
//! (libssh2); the client layer serializes access behind an async mutex so a
//! single session is shared across the controller.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, info, warn};

use crate::error::{RdsError, Result, is_permanent_failure};

/// Connection settings for the RDS management interface.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: PathBuf,
    /// Expected host public key, raw bytes as read from the key file.
    /// When set, the session's host key must match it exactly.
    pub host_key: Option<Vec<u8>>,
    /// Explicit opt-out of host key verification. The driver bootstrap
    /// refuses controller mode unless either a host key or this flag is set.
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl TransportConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A single SSH session to the RDS.
pub struct SshTransport {
    config: TransportConfig,
    session: Option<Session>,
}

impl SshTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open a session: TCP connect, handshake, host key check, pubkey auth.
    pub fn connect(&mut self) -> Result<()> {
        let endpoint = self.config.endpoint();
        debug!(endpoint = %endpoint, "Connecting to RDS");

        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RdsError::InvalidArgument(format!("bad RDS endpoint '{}'", endpoint)))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_read_timeout(Some(self.config.command_timeout))?;
        stream.set_write_timeout(Some(self.config.command_timeout))?;

        let mut session = Session::new()?;
        session.set_timeout(self.config.command_timeout.as_millis() as u32);
        session.set_tcp_stream(stream);
        session.handshake()?;

        self.verify_host_key(&session)?;

        session.userauth_pubkey_file(
            &self.config.user,
            None,
            &self.config.private_key_path,
            None,
        )?;
        if !session.authenticated() {
            return Err(RdsError::CommandFailed("authentication failed".to_string()));
        }

        info!(endpoint = %endpoint, user = %self.config.user, "RDS session established");
        self.session = Some(session);
        Ok(())
    }

    /// Exact host key comparison. A mismatch is a security event, never a
    /// retry candidate.
    fn verify_host_key(&self, session: &Session) -> Result<()> {
        let Some(expected) = self.config.host_key.as_deref() else {
            if self.config.insecure_skip_verify {
                warn!(
                    endpoint = %self.config.endpoint(),
                    "Host key verification disabled; session is vulnerable to MITM"
                );
                return Ok(());
            }
            return Err(RdsError::InvalidArgument(
                "no RDS host key configured and insecure mode not enabled".to_string(),
            ));
        };

        let (actual, _key_type) = session
            .host_key()
            .ok_or_else(|| RdsError::HostKeyMismatch(self.config.endpoint()))?;

        if actual != expected {
            warn!(
                endpoint = %self.config.endpoint(),
                "RDS host key mismatch; refusing session"
            );
            return Err(RdsError::HostKeyMismatch(self.config.endpoint()));
        }
        Ok(())
    }

    /// Run one CLI line, returning combined stdout+stderr.
    pub fn run_command(&mut self, cmd: &str) -> Result<String> {
        let session = self.session.as_mut().ok_or(RdsError::NotConnected)?;

        debug!(cmd = %cmd, "RDS command");
        let mut channel = session.channel_session()?;
        channel.exec(cmd)?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;

        if !stderr.is_empty() {
            output.push_str(&stderr);
        }

        let status = channel.exit_status()?;
        if status != 0 {
            return Err(RdsError::CommandFailed(format!(
                "exit status {}: {}",
                status,
                output.trim()
            )));
        }

        // RouterOS reports most errors on stdout with a zero exit status.
        let lower = output.to_lowercase();
        if lower.contains("failure:") || lower.contains("syntax error") || lower.contains("bad command name")
        {
            return Err(RdsError::CommandFailed(output.trim().to_string()));
        }

        Ok(output)
    }

    /// Run with exponential backoff (1s, 2s, 4s, ...), reconnecting between
    /// attempts. Command-level rejections are surfaced immediately.
    pub fn run_command_with_retry(&mut self, cmd: &str, max_retries: u32) -> Result<String> {
        let mut backoff = Duration::from_secs(1);
        let mut last_err = RdsError::NotConnected;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                warn!(
                    cmd = %cmd,
                    attempt = attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %last_err,
                    "Retrying RDS command"
                );
                metrics::counter!("rds_command_retries_total").increment(1);
                std::thread::sleep(backoff);
                backoff *= 2;

                // A fresh session costs little and clears broken channels.
                self.close();
                if let Err(e) = self.connect() {
                    last_err = e;
                    continue;
                }
            } else if self.session.is_none() {
                self.connect()?;
            }

            match self.run_command(cmd) {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() => last_err = e,
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    /// Whether a working channel can be opened right now. Probes rather than
    /// trusting stale session state.
    pub fn is_connected(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.channel_session() {
            Ok(mut channel) => {
                let _ = channel.close();
                true
            }
            Err(_) => false,
        }
    }

    /// Tear down the session. Idempotent.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
            debug!(endpoint = %self.config.endpoint(), "RDS session closed");
        }
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Classify raw command output into the typed error space. Used by the
/// client layer after a command nominally succeeds but the reply carries an
/// error marker.
pub fn classify_output_error(context: &str, output: &str) -> RdsError {
    let lower = output.to_lowercase();
    if lower.contains("not enough space") {
        RdsError::OutOfSpace(output.trim().to_string())
    } else if lower.contains("invalid parameter") || lower.contains("syntax error") {
        RdsError::InvalidArgument(format!("{}: {}", context, output.trim()))
    } else if is_permanent_failure(output) {
        RdsError::CommandFailed(output.trim().to_string())
    } else {
        RdsError::CommandFailed(format!("{}: {}", context, output.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host_key: Option<Vec<u8>>, insecure: bool) -> TransportConfig {
        TransportConfig {
            address: "192.0.2.10".to_string(),
            port: 22,
            user: "csi".to_string(),
            private_key_path: PathBuf::from("/etc/rds-csi/id_ed25519"),
            host_key,
            insecure_skip_verify: insecure,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_endpoint_format() {
        assert_eq!(config(None, true).endpoint(), "192.0.2.10:22");
    }

    #[test]
    fn test_run_command_requires_session() {
        let mut transport = SshTransport::new(config(None, true));
        assert!(matches!(
            transport.run_command("/disk print detail"),
            Err(RdsError::NotConnected)
        ));
    }

    #[test]
    fn test_is_connected_without_session() {
        let mut transport = SshTransport::new(config(None, true));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut transport = SshTransport::new(config(None, true));
        transport.close();
        transport.close();
    }

    #[test]
    fn test_classify_output_error() {
        assert!(matches!(
            classify_output_error("create", "failure: not enough space"),
            RdsError::OutOfSpace(_)
        ));
        assert!(matches!(
            classify_output_error("create", "input does not match: invalid parameter"),
            RdsError::InvalidArgument(_)
        ));
        assert!(matches!(
            classify_output_error("remove", "no such item"),
            RdsError::CommandFailed(_)
        ));
    }
}
