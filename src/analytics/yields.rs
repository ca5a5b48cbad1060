//! # Métricas de Yield (FPY, FTY, flakiness, taxas por step)
//!
//! ## Definições (precisam bater com a noção de tentativa do runner):
//!
//! - Eventos agrupam por `sn` e depois por `(sn, test_step)`. Dentro do
//!   grupo, a tentativa FINAL é a de maior `attempt`; `any_fail` indica
//!   pelo menos um evento reprovado no grupo.
//! - **FPY**: o SN passa sse, para TODO step do log, o evento final tem
//!   `attempt == 1 && passed && !any_fail`. A tripla é deliberadamente
//!   redundante (passar na tentativa 1 implica !any_fail) e fica assim
//!   como teste defensivo contra log corrompido.
//! - **FTY**: o SN passa sse o evento final de todo step passou. Um
//!   `(sn, step)` ausente do log conta como falha do SN.
//! - **Flaky**: instância `(sn, step)` com `any_fail && final.passed`.
//!   A taxa é sobre o total de instâncias observadas.
//! - **Taxas por step**: `fail_rate_units` = unidades que falharam o
//!   step pelo menos uma vez / total de unidades; `fail_rate_attempts`
//!   = eventos reprovados / eventos totais do step.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use crate::analytics::io::EventRow;

#[derive(Debug, Clone, Serialize)]
pub struct YieldSummary {
    pub total_units: usize,
    pub fpy: f64,
    pub fty: f64,
    pub overall_pass_first_pass: usize,
    pub overall_pass_final: usize,
    pub flaky_rate: f64,
    pub step_fail_rate_units: BTreeMap<String, f64>,
    pub step_fail_rate_attempts: BTreeMap<String, f64>,
}

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

/// Computa as métricas de manufatura a partir do log cru.
pub fn compute_yields(events: &[EventRow]) -> YieldSummary {
    // Agrupamento determinístico por SN (ignorando SN vazio).
    let mut by_sn: BTreeMap<&str, Vec<&EventRow>> = BTreeMap::new();
    for ev in events {
        if ev.sn.is_empty() {
            continue;
        }
        by_sn.entry(&ev.sn).or_default().push(ev);
    }

    // Evento final e any_fail por (sn, step).
    let mut final_ev: BTreeMap<(&str, &str), &EventRow> = BTreeMap::new();
    let mut any_fail: BTreeMap<(&str, &str), bool> = BTreeMap::new();
    let mut all_steps: BTreeSet<&str> = BTreeSet::new();

    for (sn, evs) in &by_sn {
        for ev in evs {
            if ev.test_step.is_empty() {
                continue;
            }
            all_steps.insert(&ev.test_step);
            let key = (*sn, ev.test_step.as_str());
            if !ev.passed {
                any_fail.insert(key, true);
            }
            match final_ev.get(&key) {
                Some(cur) if ev.attempt < cur.attempt => {}
                _ => {
                    final_ev.insert(key, ev);
                }
            }
        }
    }

    let mut pass_first_pass = 0usize;
    let mut pass_final = 0usize;
    let mut flaky_instances = 0usize;
    let mut total_step_instances = 0usize;

    let mut step_fail_units: BTreeMap<&str, usize> =
        all_steps.iter().map(|s| (*s, 0)).collect();
    let mut step_attempts: BTreeMap<&str, usize> =
        all_steps.iter().map(|s| (*s, 0)).collect();
    let mut step_failed_attempts: BTreeMap<&str, usize> =
        all_steps.iter().map(|s| (*s, 0)).collect();

    for (sn, evs) in &by_sn {
        let mut unit_first_pass_ok = true;
        let mut unit_final_ok = true;

        for step in &all_steps {
            let key = (*sn, *step);
            let Some(final_event) = final_ev.get(&key) else {
                // Step ausente: a unidade não completou o plano.
                unit_first_pass_ok = false;
                unit_final_ok = false;
                if let Some(c) = step_fail_units.get_mut(step) {
                    *c += 1;
                }
                continue;
            };

            let failed_once = any_fail.get(&key).copied().unwrap_or(false);
            total_step_instances += 1;

            if failed_once {
                if let Some(c) = step_fail_units.get_mut(step) {
                    *c += 1;
                }
            }

            for ev in evs.iter().filter(|e| e.test_step == **step) {
                if let Some(c) = step_attempts.get_mut(step) {
                    *c += 1;
                }
                if !ev.passed {
                    if let Some(c) = step_failed_attempts.get_mut(step) {
                        *c += 1;
                    }
                }
            }

            // FPY: a tripla explícita.
            if !(final_event.passed && final_event.attempt == 1 && !failed_once) {
                unit_first_pass_ok = false;
            }
            if !final_event.passed {
                unit_final_ok = false;
            }
            if failed_once && final_event.passed {
                flaky_instances += 1;
            }
        }

        if unit_first_pass_ok {
            pass_first_pass += 1;
        }
        if unit_final_ok {
            pass_final += 1;
        }
    }

    let total_units = by_sn.len();
    let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };

    YieldSummary {
        total_units,
        fpy: ratio(pass_first_pass, total_units),
        fty: ratio(pass_final, total_units),
        overall_pass_first_pass: pass_first_pass,
        overall_pass_final: pass_final,
        flaky_rate: ratio(flaky_instances, total_step_instances),
        step_fail_rate_units: step_fail_units
            .iter()
            .map(|(s, c)| (s.to_string(), ratio(*c, total_units)))
            .collect(),
        step_fail_rate_attempts: step_attempts
            .iter()
            .map(|(s, total)| {
                let failed = step_failed_attempts.get(s).copied().unwrap_or(0);
                (s.to_string(), ratio(failed, *total))
            })
            .collect(),
    }
}

pub fn write_yield_csv(summary: &YieldSummary, out_dir: &Path) -> Result<()> {
    let mut w = csv::Writer::from_writer(File::create(out_dir.join("yield_summary.csv"))?);
    w.write_record(["metric", "value"])?;
    w.write_record(["total_units", &summary.total_units.to_string()])?;
    w.write_record(["fpy", &round6(summary.fpy).to_string()])?;
    w.write_record(["fty", &round6(summary.fty).to_string()])?;
    w.write_record([
        "overall_pass_first_pass",
        &summary.overall_pass_first_pass.to_string(),
    ])?;
    w.write_record(["overall_pass_final", &summary.overall_pass_final.to_string()])?;
    w.write_record(["flaky_rate", &round6(summary.flaky_rate).to_string()])?;
    w.flush()?;
    Ok(())
}

pub fn write_step_rates_csv(summary: &YieldSummary, out_dir: &Path) -> Result<()> {
    let mut w = csv::Writer::from_writer(File::create(out_dir.join("step_fail_rates.csv"))?);
    w.write_record(["test_step", "fail_rate_units", "fail_rate_attempts"])?;
    for (step, rate_units) in &summary.step_fail_rate_units {
        let rate_attempts = summary
            .step_fail_rate_attempts
            .get(step)
            .copied()
            .unwrap_or(0.0);
        w.write_record([
            step.as_str(),
            &round6(*rate_units).to_string(),
            &round6(rate_attempts).to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[serde_json::Value]) -> Vec<EventRow> {
        values
            .iter()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// O cenário de referência: 2 SNs, 2 steps; SN0002 flake em
    /// read_temp (falha e depois passa).
    fn known_small_dataset() -> Vec<EventRow> {
        rows(&[
            json!({"sn":"SN0001","batch_id":"B1","stage":"DVT","fw_version":"1.0.0","test_step":"ping","command":"PING","attempt":1,"passed":true,"error_code":null,"duration_ms":10}),
            json!({"sn":"SN0001","batch_id":"B1","stage":"DVT","fw_version":"1.0.0","test_step":"read_temp","command":"READ_TEMP","attempt":1,"passed":true,"error_code":null,"duration_ms":20,"measurement":"temp_c","value":25.0}),
            json!({"sn":"SN0002","batch_id":"B1","stage":"DVT","fw_version":"1.0.1","test_step":"ping","command":"PING","attempt":1,"passed":true,"error_code":null,"duration_ms":12}),
            json!({"sn":"SN0002","batch_id":"B1","stage":"DVT","fw_version":"1.0.1","test_step":"read_temp","command":"READ_TEMP","attempt":1,"passed":false,"error_code":"E_TIMEOUT","duration_ms":1000,"measurement":"temp_c","value":null}),
            json!({"sn":"SN0002","batch_id":"B1","stage":"DVT","fw_version":"1.0.1","test_step":"read_temp","command":"READ_TEMP","attempt":2,"passed":true,"error_code":null,"duration_ms":25,"measurement":"temp_c","value":26.0}),
        ])
    }

    #[test]
    fn test_known_small_dataset() {
        let ys = compute_yields(&known_small_dataset());

        assert_eq!(ys.total_units, 2);
        // FPY: só SN0001 passa de primeira (SN0002 precisou de retry).
        assert_eq!(ys.overall_pass_first_pass, 1);
        assert!((ys.fpy - 0.5).abs() < 1e-9);
        // FTY: os dois passam no final.
        assert_eq!(ys.overall_pass_final, 2);
        assert!((ys.fty - 1.0).abs() < 1e-9);
        // Flaky: 1 instância flaky em 4 instâncias de step.
        assert!((ys.flaky_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_step_fail_rates() {
        let ys = compute_yields(&known_small_dataset());
        // read_temp: 1 de 2 unidades falhou pelo menos uma vez.
        assert!((ys.step_fail_rate_units["read_temp"] - 0.5).abs() < 1e-9);
        assert!((ys.step_fail_rate_units["ping"] - 0.0).abs() < 1e-9);
        // read_temp: 1 evento reprovado em 3.
        assert!((ys.step_fail_rate_attempts["read_temp"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_step_counts_as_unit_failure() {
        // SN0002 nunca rodou read_temp.
        let events = rows(&[
            json!({"sn":"SN0001","test_step":"ping","attempt":1,"passed":true}),
            json!({"sn":"SN0001","test_step":"read_temp","attempt":1,"passed":true}),
            json!({"sn":"SN0002","test_step":"ping","attempt":1,"passed":true}),
        ]);
        let ys = compute_yields(&events);
        assert_eq!(ys.total_units, 2);
        assert!((ys.fty - 0.5).abs() < 1e-9);
        assert!((ys.fpy - 0.5).abs() < 1e-9);
        assert!((ys.step_fail_rate_units["read_temp"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fail_then_fail_is_not_flaky() {
        let events = rows(&[
            json!({"sn":"SN0001","test_step":"st","attempt":1,"passed":false,"error_code":"E_INTERNAL"}),
            json!({"sn":"SN0001","test_step":"st","attempt":2,"passed":false,"error_code":"E_INTERNAL"}),
        ]);
        let ys = compute_yields(&events);
        assert_eq!(ys.flaky_rate, 0.0);
        assert_eq!(ys.fty, 0.0);
    }

    #[test]
    fn test_empty_log_yields_zeroes() {
        let ys = compute_yields(&[]);
        assert_eq!(ys.total_units, 0);
        assert_eq!(ys.fpy, 0.0);
        assert_eq!(ys.fty, 0.0);
        assert_eq!(ys.flaky_rate, 0.0);
    }

    #[test]
    fn test_csv_writers_emit_sorted_steps() {
        let dir = tempfile::tempdir().unwrap();
        let ys = compute_yields(&known_small_dataset());
        write_yield_csv(&ys, dir.path()).unwrap();
        write_step_rates_csv(&ys, dir.path()).unwrap();

        let rates = std::fs::read_to_string(dir.path().join("step_fail_rates.csv")).unwrap();
        let lines: Vec<_> = rates.lines().collect();
        assert_eq!(lines[0], "test_step,fail_rate_units,fail_rate_attempts");
        // Ordenação por chave ascendente: ping antes de read_temp.
        assert!(lines[1].starts_with("ping,"));
        assert!(lines[2].starts_with("read_temp,"));

        let summary = std::fs::read_to_string(dir.path().join("yield_summary.csv")).unwrap();
        assert!(summary.contains("fpy,0.5"));
        assert!(summary.contains("fty,1"));
        assert!(summary.contains("flaky_rate,0.25"));
    }
}
