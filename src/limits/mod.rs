//! # Módulo de Limites de Medição
//!
//! Avalia o `limits` de um step contra o `data` da resposta do DUT.
//!
//! ## Semântica (congelada, os testes de analytics dependem dela):
//!
//! - `equals = X`: passa sse `data[field] == X` (números comparados
//!   numericamente: `200` e `200.0` são iguais).
//! - faixa: passa sse `(min ausente ∨ v ≥ min) ∧ (max ausente ∨ v ≤ max)`.
//! - campo AUSENTE na resposta: a checagem de faixa não se aplica e o
//!   step passa: limite só reprova o que conseguiu medir.
//! - campo presente mas não numérico numa checagem de faixa: reprova.
//!
//! Falha de limite vira `LIMIT_FAIL` no evento, sintetizado pelo runner.

use serde_json::Value;

use crate::plan::Limits;

/// Resultado da checagem, já com a tripla de medição para o evento.
#[derive(Debug, Clone)]
pub struct MeasurementCheck {
    pub passed: bool,
    /// Nome do campo medido (vai para `measurement` no evento).
    pub measurement: Option<String>,
    /// Valor observado (vai para `value` no evento).
    pub value: Option<Value>,
    pub units: Option<String>,
}

impl MeasurementCheck {
    /// Step sem limites: passa sem tripla de medição.
    pub fn unchecked() -> Self {
        Self {
            passed: true,
            measurement: None,
            value: None,
            units: None,
        }
    }
}

/// Igualdade com números comparados numericamente.
fn value_equals(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Avalia os limites de um step contra o `data` da resposta.
pub fn evaluate(limits: Option<&Limits>, data: &Value) -> MeasurementCheck {
    let Some(limits) = limits else {
        return MeasurementCheck::unchecked();
    };

    let observed = data.get(&limits.field).cloned();
    let base = MeasurementCheck {
        passed: true,
        measurement: Some(limits.field.clone()),
        value: observed.clone(),
        units: limits.units.clone(),
    };

    if let Some(expected) = &limits.equals {
        let passed = observed
            .as_ref()
            .map(|v| value_equals(v, expected))
            .unwrap_or(false);
        return MeasurementCheck { passed, ..base };
    }

    // Faixa numérica.
    let Some(observed) = observed else {
        // Campo ausente: nada a reprovar.
        return base;
    };
    let Some(v) = observed.as_f64() else {
        // Presente mas não numérico: não dá para comparar, reprova.
        return MeasurementCheck { passed: false, ..base };
    };

    let mut passed = true;
    if let Some(min) = limits.min {
        passed = passed && v >= min;
    }
    if let Some(max) = limits.max {
        passed = passed && v <= max;
    }
    MeasurementCheck { passed, ..base }
}
