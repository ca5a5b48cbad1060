//! # Relatório de Qualificação (HTML)
//!
//! Passo puro de templating: lê `events.jsonl` + `results_summary.json`
//! do diretório do run e renderiza `qualification_report.html` com o
//! template embutido. Nenhum dado novo é computado além de agregações
//! de apresentação (contagem de tentativas, p50/p95 de duração).

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use minijinja::{context, Environment};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::analytics::io::read_events_jsonl;
use crate::logger::LOG_SCHEMA_VERSION;

const TEMPLATE: &str = include_str!("../../templates/report.html");

#[derive(Debug, Serialize)]
struct SnRow {
    sn: String,
    fw: String,
    passed: bool,
    failure_count: usize,
}

#[derive(Debug, Serialize)]
struct FailRow {
    sn: String,
    step_id: String,
    cmd: String,
    error_code: String,
    attempts: u32,
    message: String,
}

#[derive(Debug, Serialize)]
struct DurationRow {
    test_step: String,
    count: usize,
    p50: u64,
    p95: u64,
}

/// Quantil por nearest-rank (determinístico, sem interpolação).
fn quantile(values: &[u64], q: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut xs = values.to_vec();
    xs.sort_unstable();
    let idx = ((xs.len() - 1) as f64 * q).round() as usize;
    xs[idx.min(xs.len() - 1)]
}

fn load_summary(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// Renderiza o relatório e retorna o caminho do HTML gerado.
pub fn generate_report(run_dir: &Path) -> Result<PathBuf> {
    let events = read_events_jsonl(&run_dir.join("events.jsonl"))?;
    let summary = load_summary(&run_dir.join("results_summary.json"));
    let out_path = run_dir.join("qualification_report.html");

    let fallback_run_id = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let run_id = summary["run_id"]
        .as_str()
        .unwrap_or(&fallback_run_id)
        .to_string();
    let batch_id = summary["batch_id"].as_str().unwrap_or("UNKNOWN").to_string();
    let station_id = summary["station_id"].as_str().unwrap_or("UNKNOWN").to_string();
    let stage = summary["stage"].as_str().unwrap_or("UNKNOWN").to_string();
    let overall_passed = summary["overall_passed"].as_bool().unwrap_or(false);

    let per_sn = summary["per_sn"].as_object().cloned().unwrap_or_default();

    // Tentativas agregadas por (sn, step), direto dos eventos.
    let mut attempt_count: BTreeMap<(String, String), u32> = BTreeMap::new();
    for ev in &events {
        let key = (ev.sn.clone(), ev.test_step.clone());
        let entry = attempt_count.entry(key).or_insert(0);
        *entry = (*entry).max(ev.attempt);
    }

    let mut fw_versions: BTreeSet<String> = BTreeSet::new();
    let mut sn_rows = Vec::new();
    let mut fail_rows = Vec::new();

    for (sn, info) in &per_sn {
        let fw = info["fw_version"].as_str().unwrap_or("unknown").to_string();
        fw_versions.insert(fw.clone());
        let passed = info["passed"].as_bool().unwrap_or(false);
        let failures = info["failures"].as_array().cloned().unwrap_or_default();

        sn_rows.push(SnRow {
            sn: sn.clone(),
            fw,
            passed,
            failure_count: failures.len(),
        });

        for f in &failures {
            let step_id = f["step_id"].as_str().unwrap_or("").to_string();
            let attempts = attempt_count
                .get(&(sn.clone(), step_id.clone()))
                .copied()
                .unwrap_or(1);
            fail_rows.push(FailRow {
                sn: sn.clone(),
                step_id,
                cmd: f["cmd"].as_str().unwrap_or("").to_string(),
                error_code: f["error_code"].as_str().unwrap_or("").to_string(),
                attempts,
                message: f["message"].as_str().unwrap_or("").to_string(),
            });
        }
    }
    fail_rows.sort_by(|a, b| {
        (&a.sn, &a.step_id, &a.error_code).cmp(&(&b.sn, &b.step_id, &b.error_code))
    });

    // Estatística de duração por step, sobre TODAS as tentativas.
    let mut durations: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for ev in &events {
        durations
            .entry(ev.test_step.as_str())
            .or_default()
            .push(ev.duration_ms);
    }
    let duration_rows: Vec<DurationRow> = durations
        .iter()
        .map(|(step, xs)| DurationRow {
            test_step: step.to_string(),
            count: xs.len(),
            p50: quantile(xs, 0.50),
            p95: quantile(xs, 0.95),
        })
        .collect();

    let mut env = Environment::new();
    env.add_template("report.html", TEMPLATE)?;
    let tmpl = env.get_template("report.html")?;
    let html = tmpl.render(context! {
        run_id,
        batch_id,
        station_id,
        stage,
        sn_count => sn_rows.len(),
        fw_versions,
        overall_passed,
        generated_at => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        log_schema_version => LOG_SCHEMA_VERSION,
        sn_rows,
        fail_rows,
        duration_rows,
        has_coverage => run_dir.join("coverage_matrix.csv").exists(),
    })?;

    std::fs::write(&out_path, html)?;
    Ok(out_path)
}
