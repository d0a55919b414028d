use crate::store::HostStore;
use crate::traffic::TestOrchestrator;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: u32,
    pub scans_recorded: u32,
    pub tests_running: u32,
    pub tests_completed: u32,
    pub tests_failed: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(
        &self,
        store: &Arc<dyn HostStore>,
        orchestrator: &TestOrchestrator,
    ) -> KernelHealth {
        let (running, completed, failed) = orchestrator.counts();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: store.host_count() as u32,
            scans_recorded: store.scan_count() as u32,
            tests_running: running as u32,
            tests_completed: completed as u32,
            tests_failed: failed as u32,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    // Approximation simple via /proc, suffisante pour un endpoint de santé
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0;
                        }
                    }
                }
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CommandGateway, CommandOutput, GatewayError};
    use crate::store::FileStore;
    use async_trait::async_trait;

    struct NoGateway;

    #[async_trait]
    impl CommandGateway for NoGateway {
        async fn execute(
            &self,
            _host: &str,
            _command: &str,
        ) -> Result<CommandOutput, GatewayError> {
            Err(GatewayError::Timeout(1))
        }
    }

    #[test]
    fn test_health_snapshot_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn HostStore> =
            Arc::new(FileStore::new(dir.path().join("hosts.json")).unwrap());
        let orchestrator = TestOrchestrator::new(Arc::new(NoGateway));

        let health = HealthTracker::new().get_health(&store, &orchestrator);
        assert_eq!(health.hosts_tracked, 0);
        assert_eq!(health.scans_recorded, 0);
        assert_eq!(health.tests_running, 0);
    }
}
