/**
 * MONITORING - Enregistrement des cibles et vérification des agents
 *
 * RÔLE :
 * Deux collaborations distinctes autour du monitoring des hôtes suivis :
 *
 * 1. Registrar : ajoute une adresse au fichier de cibles Prometheus
 *    (file_sd YAML) puis signale le reload. L'ajout est idempotent, la
 *    liste reste triée et dédupliquée, et un échec du reload est signalé
 *    sans bloquer l'ajout.
 *
 * 2. AgentChecker : sonde l'état des agents d'un hôte via le gateway SSH
 *    (services node_exporter et iperf3-server, ports en écoute, endpoint
 *    metrics) et combine le tout en un booléen de readiness.
 */

use crate::gateway::CommandGateway;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("targets file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("targets file format error: {0}")]
    Format(#[from] serde_yaml::Error),
}

/// Groupe de cibles au format file_sd de Prometheus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Issue d'un enregistrement de cible.
#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub target: String,
    /// false si la cible était déjà enregistrée (aucune écriture).
    pub added: bool,
    /// false si le signal de reload a échoué (non bloquant).
    pub reloaded: bool,
}

pub struct MonitoringRegistrar {
    targets_path: PathBuf,
    metrics_port: u16,
    reload_url: Option<String>,
    http: reqwest::Client,
}

impl MonitoringRegistrar {
    pub fn new(targets_path: PathBuf, metrics_port: u16, reload_url: Option<String>) -> Self {
        Self { targets_path, metrics_port, reload_url, http: reqwest::Client::new() }
    }

    /// Ajoute `address` à la liste des cibles scrappées. Idempotent : une
    /// cible déjà présente ne provoque ni écriture ni erreur.
    pub async fn register(&self, address: &str) -> Result<AddOutcome, MonitoringError> {
        let target = format!("{}:{}", address, self.metrics_port);
        let mut groups = self.load()?;

        if groups.is_empty() {
            groups.push(TargetGroup { targets: Vec::new(), labels: BTreeMap::new() });
        }
        let group = &mut groups[0];
        let added = if group.targets.contains(&target) {
            false
        } else {
            group.targets.push(target.clone());
            group.targets.sort();
            group.targets.dedup();
            let rendered = serde_yaml::to_string(&groups)?;
            std::fs::write(&self.targets_path, rendered)?;
            info!("[monitoring] target {} registered", target);
            true
        };

        let reloaded = self.signal_reload().await;
        Ok(AddOutcome { target, added, reloaded })
    }

    fn load(&self) -> Result<Vec<TargetGroup>, MonitoringError> {
        if !self.targets_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.targets_path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Signal de reload Prometheus. Un échec est logué, jamais propagé.
    async fn signal_reload(&self) -> bool {
        let Some(url) = &self.reload_url else {
            return false;
        };
        match self.http.post(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("[monitoring] reload refused: HTTP {}", resp.status());
                false
            }
            Err(e) => {
                warn!("[monitoring] reload signal failed: {}", e);
                false
            }
        }
    }
}

/// État des agents de mesure sur un hôte.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReadiness {
    pub address: String,
    pub node_exporter_active: bool,
    pub iperf3_server_active: bool,
    pub ports_listening: bool,
    pub metrics_reachable: bool,
    /// Conjonction des quatre sondes.
    pub ready: bool,
}

pub struct AgentChecker {
    gateway: Arc<dyn CommandGateway>,
}

impl AgentChecker {
    pub fn new(gateway: Arc<dyn CommandGateway>) -> Self {
        Self { gateway }
    }

    /// Sonde les quatre indicateurs sur l'hôte et les combine. Une sonde
    /// injoignable compte comme négative, jamais comme une erreur.
    pub async fn check(&self, address: &str) -> AgentReadiness {
        let node_exporter_active = self.probe(address, "systemctl is-active node_exporter").await;
        let iperf3_server_active = self.probe(address, "systemctl is-active iperf3-server").await;
        // 9100 = node_exporter, 5201 = iperf3
        let ports_listening = self
            .probe(address, "ss -ltn | grep -q ':9100 ' && ss -ltn | grep -q ':5201 '")
            .await;
        let metrics_reachable = self
            .probe(address, "curl -sf -m 5 http://127.0.0.1:9100/metrics > /dev/null")
            .await;

        let ready =
            node_exporter_active && iperf3_server_active && ports_listening && metrics_reachable;
        AgentReadiness {
            address: address.to_string(),
            node_exporter_active,
            iperf3_server_active,
            ports_listening,
            metrics_reachable,
            ready,
        }
    }

    async fn probe(&self, address: &str, command: &str) -> bool {
        match self.gateway.execute(address, command).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!("[monitoring] probe on {} unreachable: {}", address, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CommandOutput, GatewayError};
    use async_trait::async_trait;

    fn registrar(dir: &tempfile::TempDir) -> MonitoringRegistrar {
        MonitoringRegistrar::new(dir.path().join("targets.yml"), 9100, None)
    }

    #[tokio::test]
    async fn test_register_creates_and_sorts_targets() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(&dir);

        registrar.register("10.0.0.5").await.unwrap();
        let outcome = registrar.register("10.0.0.2").await.unwrap();
        assert!(outcome.added);

        let raw = std::fs::read_to_string(dir.path().join("targets.yml")).unwrap();
        let groups: Vec<TargetGroup> = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets, vec!["10.0.0.2:9100", "10.0.0.5:9100"]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = registrar(&dir);

        assert!(registrar.register("10.0.0.2").await.unwrap().added);
        let again = registrar.register("10.0.0.2").await.unwrap();
        assert!(!again.added);

        let raw = std::fs::read_to_string(dir.path().join("targets.yml")).unwrap();
        let groups: Vec<TargetGroup> = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(groups[0].targets.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_block_add() {
        let dir = tempfile::tempdir().unwrap();
        // port 9 : connexion refusée immédiatement
        let registrar = MonitoringRegistrar::new(
            dir.path().join("targets.yml"),
            9100,
            Some("http://127.0.0.1:9/-/reload".to_string()),
        );
        let outcome = registrar.register("10.0.0.2").await.unwrap();
        assert!(outcome.added);
        assert!(!outcome.reloaded);
    }

    /// Gateway qui fait réussir toutes les sondes sauf celles listées.
    struct SelectiveGateway {
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl CommandGateway for SelectiveGateway {
        async fn execute(
            &self,
            _host: &str,
            command: &str,
        ) -> Result<CommandOutput, GatewayError> {
            let fails = self.failing.iter().any(|f| command.contains(f));
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: if fails { 3 } else { 0 },
            })
        }
    }

    #[tokio::test]
    async fn test_agent_ready_when_all_probes_pass() {
        let checker = AgentChecker::new(Arc::new(SelectiveGateway { failing: vec![] }));
        let readiness = checker.check("10.0.0.2").await;
        assert!(readiness.ready);
        assert!(readiness.node_exporter_active);
        assert!(readiness.metrics_reachable);
    }

    #[tokio::test]
    async fn test_agent_not_ready_when_one_probe_fails() {
        let checker = AgentChecker::new(Arc::new(SelectiveGateway {
            failing: vec!["iperf3-server"],
        }));
        let readiness = checker.check("10.0.0.2").await;
        assert!(!readiness.ready);
        assert!(!readiness.iperf3_server_active);
        assert!(readiness.node_exporter_active);
    }

    #[tokio::test]
    async fn test_agent_unreachable_counts_as_not_ready() {
        struct DeadGateway;
        #[async_trait]
        impl CommandGateway for DeadGateway {
            async fn execute(
                &self,
                _host: &str,
                _command: &str,
            ) -> Result<CommandOutput, GatewayError> {
                Err(GatewayError::Timeout(5))
            }
        }
        let checker = AgentChecker::new(Arc::new(DeadGateway));
        let readiness = checker.check("10.0.0.2").await;
        assert!(!readiness.ready);
        assert!(!readiness.ports_listening);
    }
}
