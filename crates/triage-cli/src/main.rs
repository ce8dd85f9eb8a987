use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use triage_runner::{Condition, HarnessConfig, RunReport};

#[derive(Parser)]
#[command(
    name = "triage-bench",
    version = "0.1.0",
    about = "Incident-response strategy benchmark harness"
)]
struct Cli {
    /// Incident corpus root, one subdirectory per incident
    #[arg(long)]
    incidents: PathBuf,
    /// Output directory for results.json and results.csv
    #[arg(long)]
    out: PathBuf,
    /// Conditions to run, in order
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = Condition::ALL.map(|c| c.as_str().to_string())
    )]
    conds: Vec<String>,
    /// Maximum event-log lines fed to each strategy
    #[arg(long, default_value_t = 200)]
    max_lines: usize,
    /// Override the single-agent service base URL
    #[arg(long)]
    copilot_url: Option<String>,
    /// Override the multi-agent service base URL
    #[arg(long)]
    orchestrator_url: Option<String>,
    /// How long to wait for dependent services before proceeding anyway
    #[arg(long, default_value_t = 420)]
    ready_wait_secs: u64,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut cfg = HarnessConfig::default();
    if let Some(url) = cli.copilot_url {
        cfg.copilot_base = url;
    }
    if let Some(url) = cli.orchestrator_url {
        cfg.orchestrator_base = url;
    }
    cfg.ready_max_wait = Duration::from_secs(cli.ready_wait_secs);

    match triage_runner::run(&cfg, &cli.incidents, &cli.out, &cli.conds, cli.max_lines) {
        Ok(report) => {
            if cli.json {
                emit_json(&report_to_json(&report));
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Err(err) => {
            if cli.json {
                emit_json(&json_error("run_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn report_to_json(report: &RunReport) -> Value {
    json!({
        "ok": true,
        "copilot_ready": report.copilot_ready,
        "orchestrator_ready": report.orchestrator_ready,
        "incident": report.incident,
        "trials": report.trials,
        "failures": report.failures,
        "results_json": report.detail_path.display().to_string(),
        "results_csv": report.summary_path.display().to_string()
    })
}

fn print_report(report: &RunReport) {
    println!("copilot_ready: {}", report.copilot_ready);
    println!("orchestrator_ready: {}", report.orchestrator_ready);
    match &report.incident {
        Some(incident) => println!("incident: {}", incident),
        None => println!("incident: none"),
    }
    println!("trials: {}", report.trials);
    println!("failures: {}", report.failures);
    println!("results_json: {}", report.detail_path.display());
    if report.summary_path.exists() {
        println!("results_csv: {}", report.summary_path.display());
    }
}
