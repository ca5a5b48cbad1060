//! # Módulo de Plano de Teste
//!
//! Estruturas de dados do plano YAML (metadados, estação, batch, steps)
//! e o carregamento com gating por estágio.
//!
//! ## Estrutura de um plano:
//!
//! ```yaml
//! plan: { name: smoke, version: 1 }
//! station: { name: FCT-01, stage: EVT, fw_expected: "1.0.0" }
//! batch: { sn_count: 3 }
//! steps:
//!   - id: ping
//!     name: Ping basico
//!     cmd: PING
//!     retries: 1
//!     backoff_ms: 100
//!     timeout_s: 2.0
//!     req_ids: [REQ-001]
//!     stages: [EVT, DVT, PVT, MP]
//! ```
//!
//! O plano é read-only depois de carregado. O gating por estágio filtra
//! os steps cuja lista `stages` contém o estágio efetivo da estação;
//! a visão SEM gating (todos os steps) alimenta o gate de
//! rastreabilidade.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::validation;

/// Estágio de maturidade de manufatura.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    EVT,
    DVT,
    PVT,
    MP,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::EVT, Stage::DVT, Stage::PVT, Stage::MP];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::EVT => "EVT",
            Stage::DVT => "DVT",
            Stage::PVT => "PVT",
            Stage::MP => "MP",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EVT" => Ok(Stage::EVT),
            "DVT" => Ok(Stage::DVT),
            "PVT" => Ok(Stage::PVT),
            "MP" => Ok(Stage::MP),
            other => bail!("Invalid stage: {other}. Expected one of: EVT, DVT, PVT, MP"),
        }
    }
}

/// Metadados do plano.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanMeta {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Estação de teste: nome, estágio default e firmware esperado.
#[derive(Debug, Clone, Deserialize)]
pub struct Station {
    pub name: String,
    pub stage: Stage,
    pub fw_expected: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Batch {
    pub sn_count: usize,
}

/// Limites de medição de um step: `equals` OU faixa `min`/`max`.
/// Misturar os dois é inválido; pelo menos um precisa existir.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Campo do `data` da resposta a checar.
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub units: Option<String>,
}

/// Um passo do plano.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,

    #[serde(default)]
    pub limits: Option<Limits>,

    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,

    pub req_ids: Vec<String>,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
}

fn default_timeout_s() -> f64 {
    2.0
}

fn default_stages() -> Vec<Stage> {
    Stage::ALL.to_vec()
}

/// Documento completo do plano, como está no YAML (sem gating).
#[derive(Debug, Clone, Deserialize)]
pub struct PlanDoc {
    pub plan: PlanMeta,
    pub station: Station,
    pub batch: Batch,
    pub steps: Vec<Step>,
}

/// Visão executável do plano: estágio efetivo aplicado e steps gateados.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub version: u32,
    pub station_name: String,
    pub stage: Stage,
    pub fw_expected: String,
    pub sn_count: usize,
    pub steps: Vec<Step>,
}

/// Carrega e valida o plano SEM aplicar gating por estágio.
///
/// É a visão que o gate de rastreabilidade usa: a intenção completa de
/// teste, em todos os estágios.
pub fn load_plan_raw(path: &Path) -> Result<PlanDoc> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    let doc: PlanDoc = serde_yaml::from_str(&text)
        .with_context(|| format!("Invalid test plan YAML: {}", path.display()))?;

    if let Err(errors) = validation::validate_plan(&doc) {
        let joined = errors
            .iter()
            .map(|e| format!("  - {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Invalid test plan: {}\n{joined}", path.display());
    }

    Ok(doc)
}

/// Carrega, valida e aplica o gating por estágio.
///
/// `stage = None` usa o estágio declarado pela estação.
pub fn load_plan(path: &Path, stage: Option<Stage>) -> Result<Plan> {
    let doc = load_plan_raw(path)?;
    let effective = stage.unwrap_or(doc.station.stage);

    let steps: Vec<Step> = doc
        .steps
        .into_iter()
        .filter(|s| s.stages.contains(&effective))
        .collect();

    Ok(Plan {
        name: doc.plan.name,
        version: doc.plan.version,
        station_name: doc.station.name,
        stage: effective,
        fw_expected: doc.station.fw_expected,
        sn_count: doc.batch.sn_count,
        steps,
    })
}
