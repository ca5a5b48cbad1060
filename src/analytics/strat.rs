//! # Estratificação de FTY
//!
//! Particiona as unidades ao longo de um atributo e reporta o FTY de
//! cada grupo. Para `fw_version`, `stage` e `batch_id`, o grupo de um
//! SN é o PRIMEIRO valor visto do campo (estável pela ordem do log).
//! Para `temp_bin`, é a média das medições `temp_c` em eventos que
//! passaram, discretizada em `{<20C, 20-30C, 30-40C, >=40C}`; SNs sem
//! dado de temperatura ficam fora da estratificação térmica.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use crate::analytics::io::EventRow;

/// Dimensões de estratificação suportadas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratKey {
    FwVersion,
    Stage,
    BatchId,
    TempBin,
}

impl StratKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StratKey::FwVersion => "fw_version",
            StratKey::Stage => "stage",
            StratKey::BatchId => "batch_id",
            StratKey::TempBin => "temp_bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratRow {
    pub key: String,
    pub group: String,
    pub units: usize,
    pub fty: f64,
}

/// Passa-final por SN: todo step visto no log precisa ter evento final
/// aprovado; step ausente para o SN reprova a unidade.
fn final_pass_by_sn(events: &[EventRow]) -> BTreeMap<String, bool> {
    let mut final_ev: BTreeMap<(&str, &str), &EventRow> = BTreeMap::new();
    let mut steps: std::collections::BTreeSet<&str> = Default::default();
    let mut sns: std::collections::BTreeSet<&str> = Default::default();

    for ev in events {
        if ev.sn.is_empty() || ev.test_step.is_empty() {
            continue;
        }
        sns.insert(&ev.sn);
        steps.insert(&ev.test_step);
        let key = (ev.sn.as_str(), ev.test_step.as_str());
        match final_ev.get(&key) {
            Some(cur) if ev.attempt < cur.attempt => {}
            _ => {
                final_ev.insert(key, ev);
            }
        }
    }

    let mut out = BTreeMap::new();
    for sn in &sns {
        let mut ok = true;
        for step in &steps {
            match final_ev.get(&(*sn, *step)) {
                Some(ev) if ev.passed => {}
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        out.insert(sn.to_string(), ok);
    }
    out
}

fn temp_bin(avg: f64) -> &'static str {
    if avg < 20.0 {
        "<20C"
    } else if avg < 30.0 {
        "20-30C"
    } else if avg < 40.0 {
        "30-40C"
    } else {
        ">=40C"
    }
}

/// FTY estratificado pela dimensão pedida, grupos em ordem ascendente.
pub fn stratify(events: &[EventRow], key: StratKey) -> Vec<StratRow> {
    let final_pass = final_pass_by_sn(events);

    // Grupo por SN.
    let mut group_by_sn: BTreeMap<String, String> = BTreeMap::new();
    match key {
        StratKey::FwVersion | StratKey::Stage | StratKey::BatchId => {
            for ev in events {
                if ev.sn.is_empty() || group_by_sn.contains_key(&ev.sn) {
                    continue;
                }
                let value = match key {
                    StratKey::FwVersion => &ev.fw_version,
                    StratKey::Stage => &ev.stage,
                    StratKey::BatchId => &ev.batch_id,
                    StratKey::TempBin => unreachable!(),
                };
                let value = if value.is_empty() { "UNKNOWN" } else { value };
                group_by_sn.insert(ev.sn.clone(), value.to_string());
            }
        }
        StratKey::TempBin => {
            let mut temps: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for ev in events {
                if ev.measurement.as_deref() != Some("temp_c") || !ev.passed {
                    continue;
                }
                let Some(v) = ev.value.as_ref().and_then(|v| v.as_f64()) else {
                    continue;
                };
                temps.entry(ev.sn.clone()).or_default().push(v);
            }
            for (sn, xs) in temps {
                if xs.is_empty() {
                    continue;
                }
                let avg = xs.iter().sum::<f64>() / xs.len() as f64;
                group_by_sn.insert(sn, temp_bin(avg).to_string());
            }
        }
    }

    // Agrega por grupo. Na estratificação térmica, SN sem grupo (sem
    // dado de temperatura) fica de fora.
    let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (sn, _) in &final_pass {
        match group_by_sn.get(sn) {
            Some(g) => groups.entry(g.clone()).or_default().push(sn),
            None if key == StratKey::TempBin => continue,
            None => groups.entry("UNKNOWN".to_string()).or_default().push(sn),
        }
    }

    groups
        .into_iter()
        .map(|(group, sns)| {
            let units = sns.len();
            let passed = sns
                .iter()
                .filter(|sn| final_pass.get(**sn).copied().unwrap_or(false))
                .count();
            StratRow {
                key: key.as_str().to_string(),
                group,
                units,
                fty: if units > 0 { passed as f64 / units as f64 } else { 0.0 },
            }
        })
        .collect()
}

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

/// Escreve `strat_<key>.csv` com colunas `key, group, units, fty`.
pub fn write_strat_csv(rows: &[StratRow], out_dir: &Path, key: StratKey) -> Result<()> {
    let path = out_dir.join(format!("strat_{}.csv", key.as_str()));
    let mut w = csv::Writer::from_writer(File::create(path)?);
    w.write_record(["key", "group", "units", "fty"])?;
    for r in rows {
        w.write_record([
            r.key.as_str(),
            r.group.as_str(),
            &r.units.to_string(),
            &round6(r.fty).to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}
