use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    /// Adresse d'écoute HTTP.
    pub listen: String,
    /// Fichier JSON de l'inventaire.
    pub storage_path: String,
    /// Clé d'API. Absente = API ouverte (un warning est émis au boot).
    pub api_key: Option<String>,
    pub scan: ScanConf,
    pub ssh: SshConf,
    pub monitoring: MonitoringConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScanConf {
    /// Timeout nmap en secondes.
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SshConf {
    pub user: String,
    pub key_path: Option<String>,
    pub connect_timeout_secs: u64,
    /// Timeout global d'une commande distante (doit dépasser la durée
    /// max d'un test iperf3).
    pub command_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConf {
    pub targets_path: String,
    pub metrics_port: u16,
    /// URL du reload Prometheus, ex "http://localhost:9090/-/reload".
    pub reload_url: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8420".into(),
            storage_path: "ipgrid-data.json".into(),
            api_key: None,
            scan: ScanConf { timeout_secs: 60 },
            ssh: SshConf {
                user: "root".into(),
                key_path: None,
                connect_timeout_secs: 5,
                command_timeout_secs: 300,
            },
            monitoring: MonitoringConf {
                targets_path: "targets.yml".into(),
                metrics_port: 9100,
                reload_url: None,
            },
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("IPGRID_CONFIG").unwrap_or_else(|_| "ipgrid.yaml".into());
    let mut config = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            KernelConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("[config] {} invalide: {}", path, e);
                KernelConfig::default()
            })
        }
    } else {
        warn!("[config] pas de {}, usage config par défaut", path);
        KernelConfig::default()
    };

    // Les secrets passent par l'environnement, jamais par le YAML commité
    if let Ok(key) = std::env::var("IPGRID_API_KEY") {
        if !key.trim().is_empty() {
            config.api_key = Some(key);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8420");
        assert!(config.api_key.is_none());
        assert_eq!(config.monitoring.metrics_port, 9100);
    }

    #[test]
    fn test_partial_yaml_rejected_falls_back_cleanly() {
        // un YAML qui n'est pas un mapping KernelConfig est une erreur
        let parsed: Result<KernelConfig, _> = serde_yaml::from_str("- 1\n- 2\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_full_yaml_roundtrip() {
        let rendered = serde_yaml::to_string(&KernelConfig::default()).unwrap();
        let parsed: KernelConfig = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed.storage_path, "ipgrid-data.json");
        assert_eq!(parsed.ssh.command_timeout_secs, 300);
    }
}
