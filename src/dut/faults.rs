//! # Injetor de Faults
//!
//! Decide, por requisição `(cmd, sn)`, exatamente UMA ação, nesta ordem
//! de precedência:
//!
//! 1. **BUSY rate-limit**: intervalo mínimo entre requisições do mesmo
//!    contexto (determinístico);
//! 2. **BUSY probabilístico**: contenção simulada de recurso;
//! 3. **Fail sintético**: `E_INTERNAL`, com probabilidade amplificada
//!    por burn-in e pelo estado BAD da cadeia de Markov;
//! 4. **Timeout**: atrasar a resposta (`delay`) ou derrubar a conexão
//!    (`drop`);
//! 5. **PASS**: a requisição segue para o modelo de device.
//!
//! ## Rajadas intermitentes (Markov de 2 estados)
//!
//! GOOD alterna para BAD com `p_good_to_bad`; BAD volta com
//! `p_bad_to_good`. Enquanto em BAD, fail e timeout ganham probabilidade
//! adicional: é isso que produz rajadas de falhas consecutivas, o
//! padrão mais difícil de depurar numa linha de produção real.
//!
//! A cadeia é amostrada UMA única vez por avaliação de ação: o ramo de
//! fail e o de timeout observam o MESMO estado pós-transição.
//!
//! ## Drift
//!
//! Separado da cascata de ações: antes do despacho o servidor pede ao
//! injetor a atualização dos offsets de drift do device. O drift é
//! cumulativo e sobrevive no DeviceState.

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;

use crate::config::{CommandFaults, FaultProfile, TimeoutMode};
use crate::errors::ErrorCode;

/// Estado da cadeia de Markov por `(sn, cmd)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkovState {
    #[default]
    Good,
    Bad,
}

/// Contexto por `(sn, cmd)`. Sobrevive a trocas de perfil.
#[derive(Debug, Default)]
struct FaultContext {
    markov_state: MarkovState,
    last_cmd_ts: Option<Instant>,
}

/// Ação única retornada pela avaliação da cascata.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultAction {
    /// Responder imediatamente com um erro da taxonomia.
    Respond { code: ErrorCode, message: String },
    /// Dormir `delay_s` e então prosseguir com o device normalmente.
    Delay { delay_s: f64 },
    /// Dormir `delay_s` e fechar a conexão sem responder.
    Drop { delay_s: f64 },
    /// Seguir direto para o modelo de device.
    Pass,
}

/// Decisão de timeout (exposta para testes de calibração de perfil).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutDecision {
    pub should: bool,
    pub mode: TimeoutMode,
    pub delay_s: f64,
}

pub struct FaultInjector {
    profile: FaultProfile,
    ctx: HashMap<(String, String), FaultContext>,
}

impl FaultInjector {
    pub fn new(profile: FaultProfile) -> Self {
        Self {
            profile,
            ctx: HashMap::new(),
        }
    }

    /// Troca o perfil ativo. Os contextos (estado de Markov, timestamps
    /// de rate-limit) sobrevivem à troca.
    pub fn set_profile(&mut self, profile: FaultProfile) {
        self.profile = profile;
    }

    pub fn profile(&self) -> &FaultProfile {
        &self.profile
    }

    fn cfg_for(&self, cmd: &str) -> CommandFaults {
        self.profile.effective(cmd)
    }

    fn ctx_for(&mut self, sn: &str, cmd: &str) -> &mut FaultContext {
        self.ctx
            .entry((sn.to_string(), cmd.to_string()))
            .or_default()
    }

    /// Multiplicadores de burn-in em função dos ciclos do device.
    /// Retorna `(fail_multiplier, drift_multiplier)`, ambos com piso 0.
    pub fn burn_in_effect(&self, cmd: &str, cycles: u64) -> (f64, f64) {
        let b = self.cfg_for(cmd).burn_in;
        let k = cycles as f64 / 1000.0;
        let fail_mult = 1.0 + b.fail_p_multiplier_per_1k_cycles * k;
        let drift_mult = 1.0 + b.drift_multiplier_per_1k_cycles * k;
        (fail_mult.max(0.0), drift_mult.max(0.0))
    }

    /// Avança os offsets de drift (efeito colateral no DeviceState, o
    /// chamador grava o resultado de volta). Cumulativo por requisição.
    pub fn apply_drift(
        &self,
        cmd: &str,
        cycles: u64,
        temp_offset_c: f64,
        vbat_offset_v: f64,
    ) -> (f64, f64) {
        let drift = self.cfg_for(cmd).drift;
        let (_, drift_mult) = self.burn_in_effect(cmd, cycles);
        (
            temp_offset_c + drift.temp_offset_per_cycle_c * drift_mult,
            vbat_offset_v + drift.vbat_offset_per_cycle_v * drift_mult,
        )
    }

    /// Um passo da cadeia de Markov para `(sn, cmd)`.
    ///
    /// Chamado exatamente uma vez por avaliação de ação: os ramos de
    /// fail e timeout leem o estado retornado, sem re-amostrar.
    fn markov_step(&mut self, rng: &mut StdRng, cmd: &str, sn: &str) -> MarkovState {
        let m = self.profile.intermittent_markov.clone();
        if !m.enabled {
            return MarkovState::Good;
        }
        let ctx = self.ctx_for(sn, cmd);
        match ctx.markov_state {
            MarkovState::Good => {
                if rng.gen::<f64>() < m.p_good_to_bad {
                    ctx.markov_state = MarkovState::Bad;
                }
            }
            MarkovState::Bad => {
                if rng.gen::<f64>() < m.p_bad_to_good {
                    ctx.markov_state = MarkovState::Good;
                }
            }
        }
        ctx.markov_state
    }

    fn uniform_delay(rng: &mut StdRng, range: [f64; 2]) -> f64 {
        let [lo, hi] = range;
        if hi <= 0.0 {
            0.0
        } else if hi <= lo {
            lo
        } else {
            rng.gen_range(lo..hi)
        }
    }

    /// Gate de BUSY. O timestamp do contexto é atualizado NA ENTRADA
    /// (gate por chegada de requisição); a comparação usa a chegada
    /// anterior, então a primeira requisição de um contexto nunca é
    /// rate-limitada.
    pub fn should_busy(
        &mut self,
        rng: &mut StdRng,
        cmd: &str,
        sn: &str,
        now: Instant,
    ) -> Option<(ErrorCode, String)> {
        let cfg = self.cfg_for(cmd).busy;
        let ctx = self.ctx_for(sn, cmd);
        let prev = ctx.last_cmd_ts.replace(now);

        if cfg.min_interval_ms > 0 {
            if let Some(prev) = prev {
                let elapsed_ms = now.duration_since(prev).as_millis() as u64;
                if elapsed_ms < cfg.min_interval_ms {
                    return Some((
                        ErrorCode::Busy,
                        format!("Rate-limited: min_interval_ms={}", cfg.min_interval_ms),
                    ));
                }
            }
        }

        if cfg.p > 0.0 && rng.gen::<f64>() < cfg.p {
            return Some((
                ErrorCode::Busy,
                "Simulated resource contention (BUSY)".to_string(),
            ));
        }

        None
    }

    fn fail_probability(&self, cmd: &str, cycles: u64, markov: MarkovState) -> f64 {
        let cfg = self.cfg_for(cmd);
        let (fail_mult, _) = self.burn_in_effect(cmd, cycles);
        let mut p = cfg.fail.p * fail_mult;
        if markov == MarkovState::Bad {
            p += self.profile.intermittent_markov.fail_p_bad_state;
        }
        p.min(1.0)
    }

    /// Fail sintético isolado (amostra a cadeia por conta própria).
    /// Usado em testes de calibração; o caminho do servidor passa por
    /// [`FaultInjector::evaluate`].
    pub fn should_fail(&mut self, rng: &mut StdRng, cmd: &str, sn: &str, cycles: u64) -> bool {
        let markov = self.markov_step(rng, cmd, sn);
        let p = self.fail_probability(cmd, cycles, markov);
        rng.gen::<f64>() < p
    }

    fn timeout_decision(
        &self,
        rng: &mut StdRng,
        cmd: &str,
        markov: MarkovState,
    ) -> TimeoutDecision {
        let cfg = self.cfg_for(cmd).timeout;
        let m = &self.profile.intermittent_markov;

        let mut p = cfg.p;
        let mut delay = Self::uniform_delay(rng, cfg.delay_s);

        if m.enabled && markov == MarkovState::Bad {
            p += m.timeout_p_bad_state;
            if m.timeout_delay_s[1] > 0.0 {
                delay = Self::uniform_delay(rng, m.timeout_delay_s);
            }
        }

        TimeoutDecision {
            should: rng.gen::<f64>() < p.min(1.0),
            mode: cfg.mode,
            delay_s: delay,
        }
    }

    /// Timeout isolado (amostra a cadeia por conta própria).
    pub fn should_timeout(
        &mut self,
        rng: &mut StdRng,
        cmd: &str,
        sn: &str,
        _cycles: u64,
    ) -> TimeoutDecision {
        let markov = self.markov_step(rng, cmd, sn);
        self.timeout_decision(rng, cmd, markov)
    }

    /// Cascata completa, na precedência documentada no topo do módulo.
    pub fn evaluate(
        &mut self,
        rng: &mut StdRng,
        cmd: &str,
        sn: &str,
        cycles: u64,
        now: Instant,
    ) -> FaultAction {
        if let Some((code, message)) = self.should_busy(rng, cmd, sn, now) {
            return FaultAction::Respond { code, message };
        }

        // Um único passo de Markov por avaliação; fail e timeout
        // observam o mesmo estado pós-transição.
        let markov = self.markov_step(rng, cmd, sn);

        let p_fail = self.fail_probability(cmd, cycles, markov);
        if rng.gen::<f64>() < p_fail {
            return FaultAction::Respond {
                code: ErrorCode::Internal,
                message: "Simulated intermittent/internal fault".to_string(),
            };
        }

        let to = self.timeout_decision(rng, cmd, markov);
        if to.should {
            return match to.mode {
                TimeoutMode::Drop => FaultAction::Drop { delay_s: to.delay_s },
                TimeoutMode::Delay => FaultAction::Delay { delay_s: to.delay_s },
            };
        }

        FaultAction::Pass
    }
}
