/**
 * TEST ORCHESTRATOR - Tests de débit iperf3 entre hôtes provisionnés
 *
 * RÔLE :
 * Lance un iperf3 client sur l'hôte source via le gateway SSH et suit
 * chaque test par un handle opaque (uuid). L'appel de démarrage rend la
 * main immédiatement : l'exécution distante vit dans une tâche de fond
 * qui ne touche que son propre enregistrement.
 *
 * MACHINE À ÉTATS :
 * running -> completed | failed, exactement une transition. Un nouvel
 * essai est un nouveau handle, jamais une mutation de l'ancien.
 *
 * RÉSULTATS :
 * - stderr non vide => failed, texte conservé tel quel
 * - sortie JSON iperf3 analysable => payload tcp/udp
 * - sortie inanalysable => payload brut conservé sous marqueur unparsed,
 *   le test reste completed (un résultat existe, exploitable ou non)
 *
 * Le registre des tests est en mémoire seule et n'expire jamais une
 * entrée (croissance non bornée assumée, voir DESIGN.md).
 */

use crate::gateway::CommandGateway;
use crate::models::{check_address, RequestError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("no traffic test with handle {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Running,
    Completed,
    Failed,
}

/// Résultat d'un test, étiqueté par protocole. `Unparsed` conserve la
/// sortie brute quand le JSON iperf3 n'a pas pu être décodé.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestPayload {
    Tcp { data: serde_json::Value },
    Udp { data: serde_json::Value },
    Unparsed { raw: String },
}

/// Paramètres d'un test de débit.
#[derive(Debug, Clone, Deserialize)]
pub struct TestParams {
    pub source: String,
    pub target: String,
    pub protocol: Protocol,
    /// Durée du test en secondes (flag -t).
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    /// Plafond de bande passante iperf3 (ex "100M"), flag -b.
    #[serde(default)]
    pub bandwidth: Option<String>,
    /// Flux parallèles, flag -P quand > 1.
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    /// Sens inversé (le serveur émet), flag -R.
    #[serde(default)]
    pub reverse: bool,
}

fn default_duration() -> u32 {
    10
}

fn default_parallel() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficTest {
    pub id: String,
    pub status: TestStatus,
    pub source: String,
    pub target: String,
    pub protocol: Protocol,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Posé au moment où l'issue est connue, jamais à la soumission.
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub payload: Option<TestPayload>,
    pub error: Option<String>,
}

/// Synthèse normalisée d'un test terminé, dérivée du payload protocole.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub mbps: f64,
    pub bits_per_second: f64,
    pub bytes: f64,
    pub jitter_ms: f64,
    pub lost_percent: f64,
    pub retransmits: u64,
}

/// Vue renvoyée au poll d'un handle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TestView {
    Running,
    Failed {
        error: String,
    },
    Completed {
        summary: TestSummary,
    },
    /// Terminé mais inexploitable : la donnée brute reste visible.
    ParseError {
        raw: String,
    },
}

/// Buckets de la vue d'ensemble : tous les running, les 10 derniers
/// completed/failed par ordre d'insertion, et les totaux par bucket.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTests {
    pub running: Vec<TrafficTest>,
    pub recent_completed: Vec<TrafficTest>,
    pub recent_failed: Vec<TrafficTest>,
    pub running_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
}

const RECENT_LIMIT: usize = 10;

/// Registre des tests : map handle -> enregistrement, plus l'ordre
/// d'insertion. Seule structure mutable partagée de l'orchestrateur.
#[derive(Default)]
struct Registry {
    order: Vec<String>,
    tests: HashMap<String, TrafficTest>,
}

pub struct TestOrchestrator {
    gateway: Arc<dyn CommandGateway>,
    registry: Arc<Mutex<Registry>>,
}

impl TestOrchestrator {
    pub fn new(gateway: Arc<dyn CommandGateway>) -> Self {
        Self { gateway, registry: Arc::new(Mutex::new(Registry::default())) }
    }

    /// Démarre un test et rend la main immédiatement avec son handle.
    pub fn start(&self, params: &TestParams) -> Result<String, TrafficError> {
        check_address(&params.source)?;
        check_address(&params.target)?;

        let id = Uuid::new_v4().to_string();
        let test = TrafficTest {
            id: id.clone(),
            status: TestStatus::Running,
            source: params.source.clone(),
            target: params.target.clone(),
            protocol: params.protocol,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            payload: None,
            error: None,
        };
        {
            let mut registry = self.registry.lock();
            registry.order.push(id.clone());
            registry.tests.insert(id.clone(), test);
        }
        info!(
            "[traffic] test {} started: {} -> {} ({})",
            id, params.source, params.target, params.protocol
        );

        let gateway = self.gateway.clone();
        let registry = self.registry.clone();
        let params = params.clone();
        let handle = id.clone();
        tokio::spawn(async move {
            run_test(gateway, registry, handle, params).await;
        });

        Ok(id)
    }

    pub fn status(&self, id: &str) -> Result<TrafficTest, TrafficError> {
        self.registry
            .lock()
            .tests
            .get(id)
            .cloned()
            .ok_or_else(|| TrafficError::NotFound(id.to_string()))
    }

    /// Vue synthétique d'un test : indicateur en cours, erreur, ou chiffres
    /// normalisés dérivés du payload selon le protocole.
    pub fn summarize(&self, id: &str) -> Result<TestView, TrafficError> {
        let test = self.status(id)?;
        Ok(match test.status {
            TestStatus::Running => TestView::Running,
            TestStatus::Failed => TestView::Failed {
                error: test.error.unwrap_or_default(),
            },
            TestStatus::Completed => match &test.payload {
                Some(TestPayload::Udp { data }) => match summarize_udp(data) {
                    Some(summary) => TestView::Completed { summary },
                    None => TestView::ParseError { raw: data.to_string() },
                },
                Some(TestPayload::Tcp { data }) => match summarize_tcp(data) {
                    Some(summary) => TestView::Completed { summary },
                    None => TestView::ParseError { raw: data.to_string() },
                },
                Some(TestPayload::Unparsed { raw }) => TestView::ParseError { raw: raw.clone() },
                None => TestView::ParseError { raw: String::new() },
            },
        })
    }

    pub fn list_active(&self) -> ActiveTests {
        let registry = self.registry.lock();
        let mut running = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for id in &registry.order {
            if let Some(test) = registry.tests.get(id) {
                match test.status {
                    TestStatus::Running => running.push(test.clone()),
                    TestStatus::Completed => completed.push(test.clone()),
                    TestStatus::Failed => failed.push(test.clone()),
                }
            }
        }
        let completed_count = completed.len();
        let failed_count = failed.len();
        ActiveTests {
            running_count: running.len(),
            recent_completed: tail(completed),
            recent_failed: tail(failed),
            running,
            completed_count,
            failed_count,
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let registry = self.registry.lock();
        let mut counts = (0, 0, 0);
        for test in registry.tests.values() {
            match test.status {
                TestStatus::Running => counts.0 += 1,
                TestStatus::Completed => counts.1 += 1,
                TestStatus::Failed => counts.2 += 1,
            }
        }
        counts
    }
}

fn tail(mut bucket: Vec<TrafficTest>) -> Vec<TrafficTest> {
    if bucket.len() > RECENT_LIMIT {
        bucket.drain(..bucket.len() - RECENT_LIMIT);
    }
    bucket
}

/// Synthétise la ligne de commande iperf3 côté client.
pub fn iperf3_command(params: &TestParams) -> String {
    let mut args: Vec<String> = vec![
        "iperf3".to_string(),
        "-c".to_string(),
        params.target.clone(),
        "-J".to_string(),
        "-t".to_string(),
        params.duration_secs.to_string(),
    ];
    if params.protocol == Protocol::Udp {
        args.push("-u".to_string());
    }
    if let Some(bandwidth) = &params.bandwidth {
        args.push("-b".to_string());
        args.push(bandwidth.clone());
    }
    if params.parallel > 1 {
        args.push("-P".to_string());
        args.push(params.parallel.to_string());
    }
    if params.reverse {
        args.push("-R".to_string());
    }
    shell_words::join(&args)
}

/// Tâche de fond d'un test : exécute la commande distante puis pose
/// l'issue sur le seul enregistrement qu'elle possède.
async fn run_test(
    gateway: Arc<dyn CommandGateway>,
    registry: Arc<Mutex<Registry>>,
    id: String,
    params: TestParams,
) {
    let command = iperf3_command(&params);
    let outcome = match gateway.execute(&params.source, &command).await {
        Err(e) => Outcome::Failed(e.to_string()),
        Ok(output) if !output.stderr.trim().is_empty() => {
            // stderr conservé tel quel
            Outcome::Failed(output.stderr)
        }
        Ok(output) => match serde_json::from_str::<serde_json::Value>(&output.stdout) {
            Ok(data) => Outcome::Completed(match params.protocol {
                Protocol::Tcp => TestPayload::Tcp { data },
                Protocol::Udp => TestPayload::Udp { data },
            }),
            Err(_) => Outcome::Completed(TestPayload::Unparsed { raw: output.stdout }),
        },
    };

    let ended_at = OffsetDateTime::now_utc();
    let mut registry = registry.lock();
    if let Some(test) = registry.tests.get_mut(&id) {
        test.ended_at = Some(ended_at);
        match outcome {
            Outcome::Failed(error) => {
                warn!("[traffic] test {} failed: {}", id, error.trim());
                test.status = TestStatus::Failed;
                test.error = Some(error);
            }
            Outcome::Completed(payload) => {
                info!("[traffic] test {} completed", id);
                test.status = TestStatus::Completed;
                test.payload = Some(payload);
            }
        }
    }
}

enum Outcome {
    Completed(TestPayload),
    Failed(String),
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// UDP : débit, gigue et perte lus dans `end.sum`.
fn summarize_udp(data: &serde_json::Value) -> Option<TestSummary> {
    let sum = data.get("end")?.get("sum")?;
    let bits_per_second = sum.get("bits_per_second")?.as_f64()?;
    Some(TestSummary {
        mbps: round2(bits_per_second / 1_000_000.0),
        bits_per_second,
        bytes: sum.get("bytes").and_then(|v| v.as_f64()).unwrap_or(0.0),
        jitter_ms: sum.get("jitter_ms").and_then(|v| v.as_f64()).unwrap_or(0.0),
        lost_percent: sum.get("lost_percent").and_then(|v| v.as_f64()).unwrap_or(0.0),
        retransmits: 0,
    })
}

/// TCP : débit côté réception (`end.sum_received`), retransmissions côté
/// émission. Gigue et perte n'existent pas sur ce transport : zéro.
fn summarize_tcp(data: &serde_json::Value) -> Option<TestSummary> {
    let received = data.get("end")?.get("sum_received")?;
    let bits_per_second = received.get("bits_per_second")?.as_f64()?;
    Some(TestSummary {
        mbps: round2(bits_per_second / 1_000_000.0),
        bits_per_second,
        bytes: received.get("bytes").and_then(|v| v.as_f64()).unwrap_or(0.0),
        jitter_ms: 0.0,
        lost_percent: 0.0,
        retransmits: data
            .get("end")
            .and_then(|e| e.get("sum_sent"))
            .and_then(|s| s.get("retransmits"))
            .and_then(|r| r.as_u64())
            .unwrap_or(0),
    })
}
