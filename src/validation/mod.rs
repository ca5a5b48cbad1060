//! # Módulo de Validação de Plano
//!
//! Valida o documento de plano ANTES de qualquer chamada ao DUT, e
//! coleta TODOS os problemas de uma vez (não para no primeiro).
//!
//! ## Validações realizadas:
//!
//! 1. Plano com pelo menos um step
//! 2. `batch.sn_count` em [1, 1000]
//! 3. IDs de step únicos e não vazios
//! 4. `retries` em [0, 10], `backoff_ms` em [0, 10000], `timeout_s` em (0, 30]
//! 5. `req_ids` não vazio, cada um começando com `REQ-`
//! 6. `stages` não vazio
//! 7. `limits`: `equals` OU `min`/`max`, nunca os dois; pelo menos um

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

use crate::plan::{PlanDoc, Step};

static REQ_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^REQ-").expect("valid req-id regex")
});

/// Erros de validação de plano. O atributo `#[error]` define a mensagem
/// mostrada ao operador.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Plano vazio: nenhum step definido")]
    EmptyPlan,

    #[error("batch.sn_count = {value} fora da faixa [1, 1000]")]
    SnCountOutOfRange { value: usize },

    #[error("Step com id vazio")]
    EmptyStepId,

    #[error("Step '{step_id}': id duplicado no plano")]
    DuplicateStepId { step_id: String },

    #[error("Step '{step_id}': retries = {value} fora da faixa [0, 10]")]
    RetriesOutOfRange { step_id: String, value: u32 },

    #[error("Step '{step_id}': backoff_ms = {value} fora da faixa [0, 10000]")]
    BackoffOutOfRange { step_id: String, value: u64 },

    #[error("Step '{step_id}': timeout_s = {value} fora da faixa (0, 30]")]
    TimeoutOutOfRange { step_id: String, value: f64 },

    #[error("Step '{step_id}': req_ids vazio (todo step rastreia pelo menos um requisito)")]
    EmptyReqIds { step_id: String },

    #[error("Step '{step_id}': req_id '{req_id}' com formato inválido (esperado prefixo REQ-)")]
    BadReqIdFormat { step_id: String, req_id: String },

    #[error("Step '{step_id}': stages vazio (o step nunca executaria)")]
    EmptyStages { step_id: String },

    #[error("Step '{step_id}': limits mistura equals com min/max")]
    LimitsMixed { step_id: String },

    #[error("Step '{step_id}': limits sem equals, min ou max")]
    LimitsEmpty { step_id: String },
}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Valida o plano completo (visão sem gating).
pub fn validate_plan(doc: &PlanDoc) -> ValidationResult {
    let mut errors = Vec::new();

    if doc.steps.is_empty() {
        errors.push(ValidationError::EmptyPlan);
        // Sem steps não há mais o que validar.
        return Err(errors);
    }

    if doc.batch.sn_count < 1 || doc.batch.sn_count > 1000 {
        errors.push(ValidationError::SnCountOutOfRange {
            value: doc.batch.sn_count,
        });
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &doc.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
        validate_step(step, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_step(step: &Step, errors: &mut Vec<ValidationError>) {
    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return;
    }

    if step.retries > 10 {
        errors.push(ValidationError::RetriesOutOfRange {
            step_id: step.id.clone(),
            value: step.retries,
        });
    }

    if step.backoff_ms > 10_000 {
        errors.push(ValidationError::BackoffOutOfRange {
            step_id: step.id.clone(),
            value: step.backoff_ms,
        });
    }

    if !(step.timeout_s > 0.0 && step.timeout_s <= 30.0) {
        errors.push(ValidationError::TimeoutOutOfRange {
            step_id: step.id.clone(),
            value: step.timeout_s,
        });
    }

    if step.req_ids.is_empty() {
        errors.push(ValidationError::EmptyReqIds {
            step_id: step.id.clone(),
        });
    }
    for rid in &step.req_ids {
        if !REQ_ID_RE.is_match(rid) {
            errors.push(ValidationError::BadReqIdFormat {
                step_id: step.id.clone(),
                req_id: rid.clone(),
            });
        }
    }

    if step.stages.is_empty() {
        errors.push(ValidationError::EmptyStages {
            step_id: step.id.clone(),
        });
    }

    if let Some(limits) = &step.limits {
        let has_range = limits.min.is_some() || limits.max.is_some();
        if limits.equals.is_some() && has_range {
            errors.push(ValidationError::LimitsMixed {
                step_id: step.id.clone(),
            });
        }
        if limits.equals.is_none() && !has_range {
            errors.push(ValidationError::LimitsEmpty {
                step_id: step.id.clone(),
            });
        }
    }
}
