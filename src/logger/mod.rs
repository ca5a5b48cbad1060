//! # Logger de Eventos (append-only, formato duplo)
//!
//! Cada tentativa de cada step vira exatamente UM registro em dois
//! sinks do diretório do run:
//!
//! - `events.jsonl`: registro estruturado completo, incluindo o mapa
//!   `data` (com a resposta crua para replay);
//! - `events.csv`: espelho achatado com ordem de colunas CONGELADA
//!   (sem o `data`).
//!
//! ## Evolução do schema
//!
//! A lista de colunas do CSV é append-only: colunas novas entram no
//! FIM, junto com um bump de `schema_version`. Colunas existentes nunca
//! mudam de posição, nome ou semântica. O JSONL pode ganhar campos
//! livremente.
//!
//! ## Durabilidade
//!
//! Cada `log()` abre, escreve e fecha os arquivos: o registro fica
//! visível mesmo se o processo morrer logo depois. A única garantia de
//! ordem é dentro de uma mesma instância de logger.

use anyhow::{Context as _, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Versão corrente do schema do log.
pub const LOG_SCHEMA_VERSION: u32 = 1;

/// Ordem congelada das colunas do CSV no schema_version 1.
pub const CSV_COLUMNS: [&str; 22] = [
    "schema_version",
    "timestamp",
    "run_id",
    "batch_id",
    "station_id",
    "stage",
    "sn",
    "fw_version",
    "test_step",
    "command",
    "attempt",
    "retry_count",
    "retries_allowed",
    "timeout_s",
    "backoff_ms",
    "duration_ms",
    "passed",
    "error_code",
    "measurement",
    "value",
    "units",
    "message",
];

fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Identidade do run, comum a todos os eventos de um batch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub batch_id: String,
    pub station_id: String,
    pub stage: String,
}

/// Campos por tentativa, preenchidos pelo runner.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub sn: String,
    pub fw_version: String,
    pub test_step: String,
    pub command: String,
    pub attempt: u32,
    pub retries_allowed: u32,
    pub timeout_s: f64,
    pub backoff_ms: u64,
    pub duration_ms: u64,
    pub passed: bool,
    pub error_code: Option<String>,
    pub measurement: Option<String>,
    pub value: Option<Value>,
    pub units: Option<String>,
    pub message: String,
    pub data: Value,
}

/// Um evento do log. A unidade atômica de persistência do MTAP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub schema_version: u32,
    pub timestamp: String,
    pub run_id: String,
    pub batch_id: String,
    pub station_id: String,
    pub stage: String,
    pub sn: String,
    pub fw_version: String,

    pub test_step: String,
    pub command: String,
    pub attempt: u32,
    pub retry_count: u32,
    pub retries_allowed: u32,
    pub timeout_s: f64,
    pub backoff_ms: u64,
    pub duration_ms: u64,

    pub passed: bool,
    pub error_code: Option<String>,

    pub measurement: Option<String>,
    pub value: Option<Value>,
    pub units: Option<String>,

    pub message: String,

    /// Payload extra para replay/debug. Só existe no JSONL.
    #[serde(default)]
    pub data: Value,
}

impl StepEvent {
    /// Constrói o evento garantindo os invariantes derivados:
    /// `retry_count = attempt - 1` e `schema_version` corrente.
    pub fn make(ctx: &RunContext, rec: AttemptRecord) -> Self {
        Self {
            schema_version: LOG_SCHEMA_VERSION,
            timestamp: utc_now_iso(),
            run_id: ctx.run_id.clone(),
            batch_id: ctx.batch_id.clone(),
            station_id: ctx.station_id.clone(),
            stage: ctx.stage.clone(),
            sn: rec.sn,
            fw_version: rec.fw_version,
            test_step: rec.test_step,
            command: rec.command,
            attempt: rec.attempt,
            retry_count: rec.attempt.saturating_sub(1),
            retries_allowed: rec.retries_allowed,
            timeout_s: rec.timeout_s,
            backoff_ms: rec.backoff_ms,
            duration_ms: rec.duration_ms,
            passed: rec.passed,
            error_code: rec.error_code,
            measurement: rec.measurement,
            value: rec.value,
            units: rec.units,
            message: rec.message,
            data: rec.data,
        }
    }

    /// Linha do CSV, na ordem congelada de [`CSV_COLUMNS`].
    fn csv_row(&self) -> Vec<String> {
        fn opt_str(v: &Option<String>) -> String {
            v.clone().unwrap_or_default()
        }
        fn opt_value(v: &Option<Value>) -> String {
            match v {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        }

        vec![
            self.schema_version.to_string(),
            self.timestamp.clone(),
            self.run_id.clone(),
            self.batch_id.clone(),
            self.station_id.clone(),
            self.stage.clone(),
            self.sn.clone(),
            self.fw_version.clone(),
            self.test_step.clone(),
            self.command.clone(),
            self.attempt.to_string(),
            self.retry_count.to_string(),
            self.retries_allowed.to_string(),
            self.timeout_s.to_string(),
            self.backoff_ms.to_string(),
            self.duration_ms.to_string(),
            self.passed.to_string(),
            opt_str(&self.error_code),
            opt_str(&self.measurement),
            opt_value(&self.value),
            opt_str(&self.units),
            self.message.clone(),
        ]
    }
}

/// Logger append-only: um registro JSONL + uma linha CSV por tentativa.
pub struct RunLogger {
    jsonl_path: PathBuf,
    csv_path: PathBuf,
}

impl RunLogger {
    /// Abre o logger no diretório do run, criando-o se necessário.
    /// O cabeçalho do CSV é escrito apenas se o arquivo ainda não existe.
    pub fn new(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)
            .with_context(|| format!("Failed to create run dir: {}", run_dir.display()))?;

        let jsonl_path = run_dir.join("events.jsonl");
        let csv_path = run_dir.join("events.csv");

        if !csv_path.exists() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&csv_path)
                .with_context(|| format!("Failed to create {}", csv_path.display()))?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(CSV_COLUMNS)?;
            writer.flush()?;
        }

        Ok(Self {
            jsonl_path,
            csv_path,
        })
    }

    /// Um append em cada sink. Handles abertos e fechados por chamada.
    pub fn log(&self, ev: &StepEvent) -> Result<()> {
        let mut jsonl = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)
            .with_context(|| format!("Failed to open {}", self.jsonl_path.display()))?;
        let mut line = serde_json::to_string(ev)?;
        line.push('\n');
        jsonl.write_all(line.as_bytes())?;

        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Failed to open {}", self.csv_path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(csv_file);
        writer.write_record(ev.csv_row())?;
        writer.flush()?;

        Ok(())
    }
}
