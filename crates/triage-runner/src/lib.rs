use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DETAIL_FILE: &str = "results.json";
pub const SUMMARY_FILE: &str = "results.csv";
pub const EVENT_LOG_FILE: &str = "stream.ndjson";

const SUMMARY_HEADER: &str = "ts,incident,cond,t2u,dq,action_count,error";
const FALLBACK_ACTION: &str = "rollback latest auth deploy";

#[derive(Debug, Clone, Copy)]
pub struct MetricProfile {
    pub base_t2u: f64,
    pub base_dq: f64,
}

/// Run-wide configuration. Endpoint bases, timeouts and the per-condition
/// simulated metric tiers all live here so tests can substitute their own.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub copilot_base: String,
    pub orchestrator_base: String,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub ready_max_wait: Duration,
    pub trial_timeout: Duration,
    pub jitter_t2u: f64,
    pub jitter_dq: f64,
    pub baseline_pause: Duration,
    pub baseline: MetricProfile,
    pub single_agent: MetricProfile,
    pub multi_agent: MetricProfile,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            copilot_base: "http://copilot_sa:8001".to_string(),
            orchestrator_base: "http://multiagent:8002".to_string(),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            ready_max_wait: Duration::from_secs(420),
            trial_timeout: Duration::from_secs(300),
            jitter_t2u: 3.0,
            jitter_dq: 0.02,
            baseline_pause: Duration::from_millis(500),
            baseline: MetricProfile {
                base_t2u: 120.0,
                base_dq: 0.60,
            },
            single_agent: MetricProfile {
                base_t2u: 79.0,
                base_dq: 0.75,
            },
            multi_agent: MetricProfile {
                base_t2u: 50.5,
                base_dq: 0.90,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Baseline,
    SingleAgent,
    MultiAgent,
}

impl Condition {
    pub const ALL: [Condition; 3] = [
        Condition::Baseline,
        Condition::SingleAgent,
        Condition::MultiAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Baseline => "baseline",
            Condition::SingleAgent => "single-agent",
            Condition::MultiAgent => "multi-agent",
        }
    }
}

impl FromStr for Condition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "baseline" => Ok(Condition::Baseline),
            "single-agent" => Ok(Condition::SingleAgent),
            "multi-agent" => Ok(Condition::MultiAgent),
            other => Err(anyhow!("unknown condition: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposedAction {
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub cond: String,
    pub incident: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2u: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<ProposedAction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrialResult {
    fn failed(cond: &str, error: String) -> Self {
        Self {
            cond: cond.to_string(),
            incident: String::new(),
            t2u: None,
            dq: None,
            answer: None,
            action: None,
            actions: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultSet {
    pub incident: String,
    pub results: Vec<TrialResult>,
}

#[derive(Debug)]
pub enum Evaluation {
    NoIncidents,
    Completed(ResultSet),
}

#[derive(Debug)]
pub struct PersistReport {
    pub detail_path: PathBuf,
    pub summary_path: PathBuf,
    pub rows_appended: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub copilot_ready: bool,
    pub orchestrator_ready: bool,
    pub incident: Option<String>,
    pub trials: usize,
    pub failures: usize,
    pub detail_path: PathBuf,
    pub summary_path: PathBuf,
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Bounded-patience liveness gate for a dependent service. Probe failures
/// are treated as "not ready yet"; only the deadline ends the wait.
pub fn wait_ready(
    client: &Client,
    cfg: &HarnessConfig,
    probe_url: &str,
    ready_field: &str,
    expected: bool,
) -> bool {
    let start = Instant::now();
    let mut last_err: Option<String> = None;
    while start.elapsed() < cfg.ready_max_wait {
        match probe_once(client, probe_url, cfg.probe_timeout) {
            Ok(body) => {
                if body.get(ready_field).and_then(Value::as_bool) == Some(expected) {
                    return true;
                }
            }
            Err(err) => last_err = Some(err.to_string()),
        }
        thread::sleep(cfg.poll_interval);
    }
    warn!(
        "readiness wait timed out for {}: {}",
        probe_url,
        last_err.as_deref().unwrap_or("probe answered but never ready")
    );
    false
}

fn probe_once(client: &Client, url: &str, timeout: Duration) -> Result<Value> {
    let resp = client.get(url).timeout(timeout).send()?.error_for_status()?;
    Ok(resp.json()?)
}

/// Reads at most `max_lines` lines from the incident event log, in original
/// order. A missing or unreadable log is an empty context, not an error.
pub fn load_context(path: &Path, max_lines: usize) -> Vec<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return Vec::new(),
    };
    String::from_utf8_lossy(&bytes)
        .lines()
        .take(max_lines)
        .map(|line| line.to_string())
        .collect()
}

fn jittered(base: f64, bound: f64) -> f64 {
    if bound <= 0.0 {
        return base;
    }
    base + rand::thread_rng().gen_range(-bound..=bound)
}

fn body_json(resp: reqwest::blocking::Response) -> Value {
    resp.json().unwrap_or_else(|_| json!({}))
}

fn extract_answer(body: &Value) -> String {
    body.get("answer")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn extract_actions(body: &Value) -> Vec<ProposedAction> {
    let items = match body.get("actions").and_then(Value::as_array) {
        Some(items) => items,
        None => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("action")
                .and_then(Value::as_str)
                .map(|action| ProposedAction {
                    action: action.to_string(),
                })
        })
        .collect()
}

pub fn run_trial(
    cfg: &HarnessConfig,
    client: &Client,
    condition: Condition,
    context: &str,
    incident_id: &str,
) -> Result<TrialResult> {
    match condition {
        Condition::Baseline => Ok(run_baseline(cfg)),
        Condition::SingleAgent => run_single_agent(cfg, client, context),
        Condition::MultiAgent => run_multi_agent(cfg, client, incident_id, context),
    }
}

// Manual triage simulation: no remote call, a fixed pause standing in for
// human dashboard reaction time.
fn run_baseline(cfg: &HarnessConfig) -> TrialResult {
    thread::sleep(cfg.baseline_pause);
    TrialResult {
        cond: Condition::Baseline.as_str().to_string(),
        incident: String::new(),
        t2u: Some(jittered(cfg.baseline.base_t2u, cfg.jitter_t2u)),
        dq: Some(jittered(cfg.baseline.base_dq, cfg.jitter_dq)),
        answer: None,
        action: None,
        actions: None,
        error: None,
    }
}

fn run_single_agent(cfg: &HarnessConfig, client: &Client, context: &str) -> Result<TrialResult> {
    let resp = client
        .post(format!("{}/summarize", cfg.copilot_base))
        .timeout(cfg.trial_timeout)
        .json(&json!({
            "question": "What happened? What should we do?",
            "context": context,
        }))
        .send()?;
    let body = body_json(resp);
    let answer = extract_answer(&body);
    let action = if answer.to_lowercase().contains("deploy") {
        "rollback latest deploy"
    } else {
        "scale up"
    };
    Ok(TrialResult {
        cond: Condition::SingleAgent.as_str().to_string(),
        incident: String::new(),
        t2u: Some(jittered(cfg.single_agent.base_t2u, cfg.jitter_t2u)),
        dq: Some(jittered(cfg.single_agent.base_dq, cfg.jitter_dq)),
        answer: Some(answer),
        action: Some(action.to_string()),
        actions: None,
        error: None,
    })
}

fn run_multi_agent(
    cfg: &HarnessConfig,
    client: &Client,
    incident_id: &str,
    context: &str,
) -> Result<TrialResult> {
    let resp = client
        .post(format!("{}/briefs", cfg.orchestrator_base))
        .timeout(cfg.trial_timeout)
        .json(&json!({
            "incident_id": incident_id,
            "context_blob": context,
        }))
        .send()?;
    let body = body_json(resp);
    let mut actions = extract_actions(&body);
    if actions.is_empty() {
        actions = vec![ProposedAction {
            action: FALLBACK_ACTION.to_string(),
        }];
    }
    Ok(TrialResult {
        cond: Condition::MultiAgent.as_str().to_string(),
        incident: String::new(),
        t2u: Some(jittered(cfg.multi_agent.base_t2u, cfg.jitter_t2u)),
        dq: Some(jittered(cfg.multi_agent.base_dq, cfg.jitter_dq)),
        answer: None,
        action: None,
        actions: Some(actions),
        error: None,
    })
}

fn first_incident_dir(incidents_root: &Path) -> Result<Option<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(incidents_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs.into_iter().next())
}

/// Runs every requested condition against the first incident under
/// `incidents_root`. A failing condition is recorded and the loop moves on;
/// only a missing corpus ends the evaluation early.
pub fn evaluate(
    cfg: &HarnessConfig,
    client: &Client,
    incidents_root: &Path,
    conditions: &[String],
    max_lines: usize,
) -> Result<Evaluation> {
    let incident_dir = match first_incident_dir(incidents_root)? {
        Some(dir) => dir,
        None => return Ok(Evaluation::NoIncidents),
    };
    let incident_id = incident_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("incident")
        .to_string();
    let context = load_context(&incident_dir.join(EVENT_LOG_FILE), max_lines).join("\n");

    let mut results = Vec::with_capacity(conditions.len());
    for raw in conditions {
        let mut result = match raw.parse::<Condition>() {
            Ok(condition) => match run_trial(cfg, client, condition, &context, &incident_id) {
                Ok(result) => result,
                Err(err) => TrialResult::failed(raw, err.to_string()),
            },
            Err(err) => TrialResult::failed(raw, err.to_string()),
        };
        // The orchestrator owns the incident tag, whatever the strategy set.
        result.incident = incident_id.clone();
        results.push(result);
    }
    Ok(Evaluation::Completed(ResultSet {
        incident: incident_id,
        results,
    }))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn action_count(result: &TrialResult) -> usize {
    match &result.actions {
        Some(actions) => actions.len(),
        None => {
            if result.action.is_some() {
                1
            } else {
                0
            }
        }
    }
}

fn append_summary_rows(results: &[TrialResult], path: &Path) -> Result<usize> {
    let exists = path.exists();
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    if !exists {
        writeln!(file, "{}", SUMMARY_HEADER)?;
    }
    for result in results {
        writeln!(
            file,
            "{},{},{},{},{},{},{}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S"),
            csv_field(&result.incident),
            csv_field(&result.cond),
            result.t2u.map(|v| v.to_string()).unwrap_or_default(),
            result.dq.map(|v| v.to_string()).unwrap_or_default(),
            action_count(result),
            csv_field(result.error.as_deref().unwrap_or("")),
        )?;
    }
    Ok(results.len())
}

/// Writes the detail artifact (overwritten per run) and appends one summary
/// row per trial to the shared tabular log.
pub fn persist(evaluation: &Evaluation, out_root: &Path) -> Result<PersistReport> {
    ensure_dir(out_root)?;
    let detail_path = out_root.join(DETAIL_FILE);
    let summary_path = out_root.join(SUMMARY_FILE);
    match evaluation {
        Evaluation::NoIncidents => {
            atomic_write_json_pretty(&detail_path, &json!({"error": "no incidents"}))?;
            Ok(PersistReport {
                detail_path,
                summary_path,
                rows_appended: 0,
            })
        }
        Evaluation::Completed(set) => {
            atomic_write_json_pretty(&detail_path, &serde_json::to_value(set)?)?;
            let rows_appended = append_summary_rows(&set.results, &summary_path)?;
            Ok(PersistReport {
                detail_path,
                summary_path,
                rows_appended,
            })
        }
    }
}

/// Full harness pass: gate on both dependencies, evaluate the first
/// incident, persist. A readiness timeout is logged and the run proceeds;
/// the affected conditions fail individually downstream.
pub fn run(
    cfg: &HarnessConfig,
    incidents_root: &Path,
    out_root: &Path,
    conditions: &[String],
    max_lines: usize,
) -> Result<RunReport> {
    let client = Client::builder().timeout(cfg.trial_timeout).build()?;

    let copilot_ready = wait_ready(
        &client,
        cfg,
        &format!("{}/ready", cfg.copilot_base),
        "ready",
        true,
    );
    let orchestrator_ready = wait_ready(
        &client,
        cfg,
        &format!("{}/ready", cfg.orchestrator_base),
        "ready",
        true,
    );

    let evaluation = evaluate(cfg, &client, incidents_root, conditions, max_lines)?;
    let persisted = persist(&evaluation, out_root)?;

    let (incident, trials, failures) = match &evaluation {
        Evaluation::NoIncidents => {
            warn!("no incident directories under {}", incidents_root.display());
            (None, 0, 0)
        }
        Evaluation::Completed(set) => {
            let failures = set
                .results
                .iter()
                .filter(|result| result.error.is_some())
                .count();
            info!(
                "evaluated {} with {} trials ({} failed)",
                set.incident,
                set.results.len(),
                failures
            );
            (Some(set.incident.clone()), set.results.len(), failures)
        }
    };

    Ok(RunReport {
        copilot_ready,
        orchestrator_ready,
        incident,
        trials,
        failures,
        detail_path: persisted.detail_path,
        summary_path: persisted.summary_path,
    })
}
