use std::collections::BTreeSet;
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::{BootstrapError, Result};

static JOIN_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"kubeadm join\s+(\S+)\s+--token\s+(\S+)\s+--discovery-token-ca-cert-hash\s+(sha256:[0-9a-fA-F]+)",
    )
    .unwrap()
});

/// Join credential issued by the control-plane host. Lives for one run.
pub struct JoinToken {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    pub issuer: String,
    /// Zero means no expiry.
    pub ttl: Duration,
    issued_at: Instant,
    consumed_by: Mutex<BTreeSet<String>>,
}

impl JoinToken {
    /// Parse the output of `kubeadm token create --print-join-command`.
    pub fn parse(output: &str, issuer: &str, ttl: Duration) -> Result<Self> {
        let caps = JOIN_COMMAND_RE.captures(output).ok_or_else(|| {
            BootstrapError::JoinToken(format!(
                "unexpected join command output: {}",
                output.lines().last().unwrap_or("")
            ))
        })?;
        Ok(Self {
            endpoint: caps[1].to_string(),
            token: caps[2].to_string(),
            ca_cert_hash: caps[3].to_string(),
            issuer: issuer.to_string(),
            ttl,
            issued_at: Instant::now(),
            consumed_by: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn join_command(&self, node_name: &str) -> String {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {} --node-name {}",
            self.endpoint,
            self.token,
            self.ca_cert_hash,
            super::step::shell_quote(node_name)
        )
    }

    pub fn is_expired(&self) -> bool {
        !self.ttl.is_zero() && self.issued_at.elapsed() >= self.ttl
    }

    pub fn mark_consumed(&self, worker: &str) {
        let mut consumed = self.consumed_by.lock().unwrap_or_else(|e| e.into_inner());
        consumed.insert(worker.to_string());
    }

    pub fn consumed_by(&self) -> Vec<String> {
        let consumed = self.consumed_by.lock().unwrap_or_else(|e| e.into_inner());
        consumed.iter().cloned().collect()
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinToken")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "kubeadm join 10.0.0.1:6443 --token abcdef.0123456789abcdef \
        --discovery-token-ca-cert-hash sha256:1f2e3d4c5b6a \n";

    #[test]
    fn parse_print_join_command() {
        let token = JoinToken::parse(OUTPUT, "10.0.0.1", Duration::from_secs(7200)).unwrap();
        assert_eq!(token.endpoint, "10.0.0.1:6443");
        assert_eq!(token.token, "abcdef.0123456789abcdef");
        assert_eq!(token.ca_cert_hash, "sha256:1f2e3d4c5b6a");
        assert_eq!(
            token.join_command("worker-a"),
            "kubeadm join 10.0.0.1:6443 --token abcdef.0123456789abcdef \
             --discovery-token-ca-cert-hash sha256:1f2e3d4c5b6a --node-name worker-a"
        );
    }

    #[test]
    fn garbage_output_is_rejected() {
        assert!(matches!(
            JoinToken::parse("error: not a control plane", "10.0.0.1", Duration::ZERO),
            Err(BootstrapError::JoinToken(_))
        ));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let token = JoinToken::parse(OUTPUT, "10.0.0.1", Duration::ZERO).unwrap();
        assert!(!token.is_expired());
        let token = JoinToken::parse(OUTPUT, "10.0.0.1", Duration::from_nanos(1)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(token.is_expired());
    }

    #[test]
    fn debug_redacts_secret() {
        let token = JoinToken::parse(OUTPUT, "10.0.0.1", Duration::ZERO).unwrap();
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("0123456789abcdef"));
        token.mark_consumed("10.0.0.2");
        token.mark_consumed("10.0.0.2");
        assert_eq!(token.consumed_by(), vec!["10.0.0.2".to_string()]);
    }
}
