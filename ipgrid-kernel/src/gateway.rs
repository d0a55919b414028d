//! Remote command gateway.
//!
//! Everything that needs to run a command on a provisioned host goes
//! through the `CommandGateway` trait: throughput tests and agent
//! readiness probes alike. `SshGateway` drives the system `ssh` client
//! with a shared control socket so repeated calls to the same host reuse
//! one TCP/auth session. A stale control socket makes ssh exit with 255;
//! the gateway retries the call once so a dead cached channel is never
//! fatal.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("command timed out after {0}s")]
    Timeout(u64),
    #[error("failed to launch ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Sortie capturée d'une commande distante.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Exécute `command` sur `host` et capture stdout/stderr/code retour.
    /// Une erreur ne couvre que l'impossibilité d'exécuter : une commande
    /// distante qui échoue est un `CommandOutput` avec code non nul.
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, GatewayError>;
}

/// Gateway SSH via le client système.
pub struct SshGateway {
    user: String,
    key_path: Option<String>,
    connect_timeout_secs: u64,
    command_timeout_secs: u64,
}

impl SshGateway {
    pub fn new(
        user: String,
        key_path: Option<String>,
        connect_timeout_secs: u64,
        command_timeout_secs: u64,
    ) -> Self {
        Self { user, key_path, connect_timeout_secs, command_timeout_secs }
    }

    fn build_command(&self, host: &str, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        // Multiplexage : une session TCP/auth par hôte, réutilisée entre
        // appels tant que le socket de contrôle vit
        cmd.arg("-o").arg("ControlMaster=auto");
        cmd.arg("-o").arg("ControlPath=/tmp/ipgrid-ssh-%r@%h:%p");
        cmd.arg("-o").arg("ControlPersist=60");
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, host));
        cmd.arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    async fn run_once(&self, host: &str, command: &str) -> Result<CommandOutput, GatewayError> {
        let output = tokio::time::timeout(
            Duration::from_secs(self.command_timeout_secs),
            self.build_command(host, command).output(),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.command_timeout_secs))??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl CommandGateway for SshGateway {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, GatewayError> {
        debug!("[gateway] {}@{}: {}", self.user, host, command);
        let first = self.run_once(host, command).await?;
        // 255 = échec de transport ssh (dont socket de contrôle périmé),
        // jamais un code de la commande distante : on rétablit le canal
        // une fois avant d'abandonner
        if first.exit_code == 255 {
            warn!(
                "[gateway] channel to {} failed, retrying once: {}",
                host,
                first.stderr.trim()
            );
            return self.run_once(host, command).await;
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_command_shape() {
        let gateway = SshGateway::new("root".to_string(), Some("/etc/ipgrid/key".to_string()), 5, 30);
        let cmd = gateway.build_command("10.0.0.2", "iperf3 -c 10.0.0.3 -J");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"root@10.0.0.2".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("iperf3 -c 10.0.0.3 -J"));
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput { stdout: String::new(), stderr: String::new(), exit_code: 0 };
        let ko = CommandOutput { stdout: String::new(), stderr: String::new(), exit_code: 1 };
        assert!(ok.success());
        assert!(!ko.success());
    }
}
