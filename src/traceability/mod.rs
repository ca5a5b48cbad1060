//! # Gate de Rastreabilidade (requisito ↔ step)
//!
//! Auditoria executada ANTES de qualquer chamada ao DUT:
//!
//! 1. Todo requisito do registro é exercitado por pelo menos um step
//!    (do plano SEM gating: a intenção completa, em todos os estágios);
//! 2. Todo `req_id` referenciado por um step existe no registro.
//!
//! Qualquer violação aborta o batch. No sucesso, a matriz de cobertura
//! (`req_id, title, covered, mapped_steps`) é gravada no diretório do
//! run para o dossiê de qualificação.

use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::plan::PlanDoc;

/// Registro default embutido, usado quando não há
/// `traceability/req_traceability.yaml` no diretório de trabalho.
const EMBEDDED_REGISTRY: &str = include_str!("../../resources/req_traceability.yaml");

/// Uma entrada do registro de requisitos.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Requirement {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    requirements: BTreeMap<String, Requirement>,
}

/// Violações do gate. Qualquer uma delas aborta o run (exit code
/// próprio, distinto de falha de batch e de config).
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("Uncovered requirements: {0:?}")]
    Uncovered(Vec<String>),

    #[error("Plan references unknown requirements: {0:?}")]
    UnknownRequirements(Vec<String>),
}

/// Carrega o registro de um caminho explícito.
pub fn load_requirements(path: &Path) -> Result<BTreeMap<String, Requirement>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read requirements registry: {}", path.display()))?;
    let doc: RegistryDoc = serde_yaml::from_str(&text)
        .with_context(|| format!("Invalid requirements YAML: {}", path.display()))?;
    Ok(doc.requirements)
}

/// Resolução do registro: arquivo do diretório de trabalho, senão o
/// default embutido no binário.
pub fn load_requirements_or_default() -> Result<BTreeMap<String, Requirement>> {
    let dev = Path::new("traceability/req_traceability.yaml");
    if dev.exists() {
        return load_requirements(dev);
    }
    let doc: RegistryDoc =
        serde_yaml::from_str(EMBEDDED_REGISTRY).context("Invalid embedded requirements registry")?;
    Ok(doc.requirements)
}

/// Pares `(step_id, req_ids)` da visão SEM gating do plano.
pub fn step_req_pairs(doc: &PlanDoc) -> Vec<(String, Vec<String>)> {
    doc.steps
        .iter()
        .map(|s| (s.id.clone(), s.req_ids.clone()))
        .collect()
}

/// Valida as duas direções da cobertura.
pub fn validate_coverage(
    requirements: &BTreeMap<String, Requirement>,
    step_pairs: &[(String, Vec<String>)],
) -> Result<(), CoverageError> {
    let registry: BTreeSet<&str> = requirements.keys().map(String::as_str).collect();
    let referenced: BTreeSet<&str> = step_pairs
        .iter()
        .flat_map(|(_, rids)| rids.iter().map(String::as_str))
        .collect();

    let missing: Vec<String> = registry
        .difference(&referenced)
        .map(|s| s.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CoverageError::Uncovered(missing));
    }

    let unknown: Vec<String> = referenced
        .difference(&registry)
        .map(|s| s.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(CoverageError::UnknownRequirements(unknown));
    }

    Ok(())
}

/// Linhas da matriz: `req_id, title, covered(Y/N), mapped_steps`.
pub fn generate_coverage_matrix(
    requirements: &BTreeMap<String, Requirement>,
    step_pairs: &[(String, Vec<String>)],
) -> Vec<[String; 4]> {
    let mut req_to_steps: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (step_id, rids) in step_pairs {
        for rid in rids {
            req_to_steps.entry(rid).or_default().push(step_id);
        }
    }

    requirements
        .iter()
        .map(|(rid, info)| {
            let mapped = req_to_steps.get(rid.as_str()).cloned().unwrap_or_default();
            [
                rid.clone(),
                info.title.clone(),
                if mapped.is_empty() { "N" } else { "Y" }.to_string(),
                mapped.join(","),
            ]
        })
        .collect()
}

pub fn write_coverage_csv(path: &Path, rows: &[[String; 4]]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = csv::Writer::from_writer(File::create(path)?);
    w.write_record(["req_id", "title", "covered", "mapped_steps"])?;
    for row in rows {
        w.write_record(row)?;
    }
    w.flush()?;
    Ok(())
}

/// O gate completo: carrega o registro, valida e grava a matriz.
/// Retorna [`CoverageError`] (via anyhow, para downcast no CLI) em
/// qualquer violação: antes de qualquer chamada ao DUT.
pub fn enforce(doc: &PlanDoc, run_dir: &Path) -> Result<()> {
    let requirements = load_requirements_or_default()?;
    let pairs = step_req_pairs(doc);
    validate_coverage(&requirements, &pairs)?;
    let rows = generate_coverage_matrix(&requirements, &pairs);
    write_coverage_csv(&run_dir.join("coverage_matrix.csv"), &rows)?;
    info!(requirements = requirements.len(), "Gate de rastreabilidade aprovado");
    Ok(())
}
