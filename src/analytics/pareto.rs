//! # Pareto de Falhas
//!
//! Contagens sobre EVENTOS reprovados (tentativas, não instâncias de
//! step: mais sensível a flakes), em três dimensões independentes:
//! `test_step`, `error_code` e `batch_id`.
//!
//! Saída sempre ordenada por contagem descendente, empate por chave
//! ascendente: a ordem clássica de um gráfico de Pareto.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use crate::analytics::io::EventRow;

/// Contagens já ordenadas (desc por contagem, asc por chave).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParetoCounts {
    pub by_step: Vec<(String, u64)>,
    pub by_error: Vec<(String, u64)>,
    pub by_batch: Vec<(String, u64)>,
}

fn ranked(counts: BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut items: Vec<(String, u64)> = counts.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items
}

/// Conta falhas por dimensão a partir dos eventos crus.
pub fn pareto_failures(events: &[EventRow]) -> ParetoCounts {
    let mut by_step: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_error: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_batch: BTreeMap<String, u64> = BTreeMap::new();

    for ev in events {
        if ev.passed {
            continue;
        }
        *by_step.entry(ev.test_step.clone()).or_default() += 1;
        *by_error
            .entry(ev.error_code.clone().unwrap_or_default())
            .or_default() += 1;
        *by_batch.entry(ev.batch_id.clone()).or_default() += 1;
    }

    ParetoCounts {
        by_step: ranked(by_step),
        by_error: ranked(by_error),
        by_batch: ranked(by_batch),
    }
}

fn write_one(items: &[(String, u64)], dimension: &str, path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_writer(File::create(path)?);
    w.write_record([dimension, "failed_attempts"])?;
    for (name, count) in items {
        w.write_record([name.as_str(), &count.to_string()])?;
    }
    w.flush()?;
    Ok(())
}

/// Escreve `pareto_step.csv`, `pareto_error.csv` e `pareto_batch.csv`.
pub fn write_pareto_csv(counts: &ParetoCounts, out_dir: &Path) -> Result<()> {
    write_one(&counts.by_step, "step", &out_dir.join("pareto_step.csv"))?;
    write_one(&counts.by_error, "error", &out_dir.join("pareto_error.csv"))?;
    write_one(&counts.by_batch, "batch", &out_dir.join("pareto_batch.csv"))?;
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

    #[test]
    fn test_counts_only_failed_events() {
        let events = rows(&[
            json!({"sn":"SN1","batch_id":"B1","test_step":"read_temp","attempt":1,"passed":false,"error_code":"E_TIMEOUT"}),
            json!({"sn":"SN1","batch_id":"B1","test_step":"read_temp","attempt":2,"passed":true,"error_code":null}),
        ]);
        let p = pareto_failures(&events);
        assert_eq!(p.by_step, vec![("read_temp".to_string(), 1)]);
        assert_eq!(p.by_error, vec![("E_TIMEOUT".to_string(), 1)]);
        assert_eq!(p.by_batch, vec![("B1".to_string(), 1)]);
    }

    #[test]
    fn test_ranked_desc_with_ascending_tie_break() {
        let events = rows(&[
            json!({"sn":"SN1","batch_id":"B1","test_step":"b_step","passed":false,"error_code":"E_BUSY"}),
            json!({"sn":"SN1","batch_id":"B1","test_step":"a_step","passed":false,"error_code":"E_TIMEOUT"}),
            json!({"sn":"SN1","batch_id":"B1","test_step":"c_step","passed":false,"error_code":"E_TIMEOUT"}),
            json!({"sn":"SN1","batch_id":"B1","test_step":"c_step","passed":false,"error_code":"E_TIMEOUT"}),
        ]);
        let p = pareto_failures(&events);
        // c_step tem 2; a_step e b_step empatam com 1, ordem alfabética.
        assert_eq!(
            p.by_step,
            vec![
                ("c_step".to_string(), 2),
                ("a_step".to_string(), 1),
                ("b_step".to_string(), 1),
            ]
        );
        assert_eq!(
            p.by_error,
            vec![("E_TIMEOUT".to_string(), 3), ("E_BUSY".to_string(), 1)]
        );
    }

    #[test]
    fn test_csv_artifact_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let events = rows(&[
            json!({"sn":"SN1","batch_id":"B1","test_step":"st","passed":false,"error_code":"E_INTERNAL"}),
        ]);
        write_pareto_csv(&pareto_failures(&events), dir.path()).unwrap();

        for name in ["pareto_step.csv", "pareto_error.csv", "pareto_batch.csv"] {
            assert!(dir.path().join(name).exists(), "faltou {name}");
        }
        let step_csv = std::fs::read_to_string(dir.path().join("pareto_step.csv")).unwrap();
        assert_eq!(step_csv.lines().next().unwrap(), "step,failed_attempts");
        assert_eq!(step_csv.lines().nth(1).unwrap(), "st,1");
    }
}
