//! # Analytics de Yield (replay puro do log de eventos)
//!
//! Tudo aqui é função pura do `events.jsonl`: mesma entrada, mesmos
//! CSVs, byte a byte. Nenhuma métrica consulta o DUT, o plano ou o
//! relógio: só o stream de eventos.
//!
//! ## Artefatos gerados em `<run_dir>/analytics/`:
//!
//! - `yield_summary.csv`: FPY, FTY, flaky rate, contagens
//! - `step_fail_rates.csv`: taxas de falha por step (unidades e tentativas)
//! - `pareto_step.csv`, `pareto_error.csv`, `pareto_batch.csv`
//! - `strat_fw_version.csv`, `strat_stage.csv`, `strat_batch_id.csv`,
//!   `strat_temp_bin.csv`
//!
//! Ordenação determinística em TODAS as saídas: chave ascendente, a
//! menos que o artefato peça contagem descendente (Pareto).

pub mod io;
pub mod pareto;
pub mod strat;
pub mod yields;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::analytics::strat::StratKey;

/// Roda o pipeline completo de analytics a partir do log cru.
pub fn run_analytics(run_dir: &Path) -> Result<PathBuf> {
    let events = io::read_events_jsonl(&run_dir.join("events.jsonl"))?;
    let out_dir = run_dir.join("analytics");
    std::fs::create_dir_all(&out_dir)?;

    let summary = yields::compute_yields(&events);
    yields::write_yield_csv(&summary, &out_dir)?;
    yields::write_step_rates_csv(&summary, &out_dir)?;

    let counts = pareto::pareto_failures(&events);
    pareto::write_pareto_csv(&counts, &out_dir)?;

    for key in [
        StratKey::FwVersion,
        StratKey::Stage,
        StratKey::BatchId,
        StratKey::TempBin,
    ] {
        let rows = strat::stratify(&events, key);
        strat::write_strat_csv(&rows, &out_dir, key)?;
    }

    info!(out_dir = %out_dir.display(), events = events.len(), "Analytics geradas");
    Ok(out_dir)
}
