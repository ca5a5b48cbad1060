//! # Modelo de Device (DUT simulado)
//!
//! Simulação stateful por SN: temperatura e tensão de bateria com
//! random walk, burn-in proporcional a ciclos e ruído gaussiano de
//! medição. O estado nasce no primeiro toque em um SN e só morre com o
//! processo.
//!
//! Determinismo: o modelo NUNCA cria RNG próprio: todo sorteio vem do
//! gerador único do servidor, passado por referência. Com seed fixo e o
//! mesmo trace de requisições, as respostas são bit-reproduzíveis.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

use crate::config::DeviceDefaults;

/// Modo de operação do device. SAFE é mais estável (walk reduzido,
/// self-test menos propenso a falhar).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Normal,
    Safe,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Normal => "NORMAL",
            DeviceMode::Safe => "SAFE",
        }
    }

    /// Parse tolerante: qualquer coisa que não seja SAFE vira NORMAL.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAFE" => DeviceMode::Safe,
            _ => DeviceMode::Normal,
        }
    }
}

/// Estado por SN. Os offsets de drift são alimentados pelo injetor de
/// faults e persistem entre requisições.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub sn: String,
    pub fw: String,
    pub mode: DeviceMode,

    pub temp_c: f64,
    pub vbat_v: f64,

    pub temp_noise_sigma: f64,
    pub vbat_noise_sigma: f64,

    pub temp_drift_per_cycle_c: f64,
    pub vbat_drift_per_cycle_v: f64,

    /// Offsets acumulados pelo motor de drift do injetor de faults.
    pub drift_offset_c: f64,
    pub drift_offset_v: f64,

    pub self_test_fail_p_base: f64,
    pub burn_in_fail_slope: f64,

    pub cycles: u64,
    pub last_update: Instant,
}

/// Limites físicos dos sinais simulados.
const TEMP_MIN_C: f64 = -40.0;
const TEMP_MAX_C: f64 = 125.0;
const VBAT_MIN_V: f64 = 9.0;
const VBAT_MAX_V: f64 = 16.0;

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

/// Ruído gaussiano com sigma do device. Sigma não-positivo (config
/// degenerada) produz ruído zero em vez de abortar o servidor.
fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return 0.0;
    }
    match Normal::new(0.0, sigma) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.0,
    }
}

/// Coleção de devices simulados, indexados por SN.
#[derive(Debug)]
pub struct DeviceModel {
    defaults: DeviceDefaults,
    devices: HashMap<String, DeviceState>,
}

impl DeviceModel {
    pub fn new(defaults: DeviceDefaults) -> Self {
        Self {
            defaults,
            devices: HashMap::new(),
        }
    }

    /// Resolve o estado de um SN, criando com os defaults do config na
    /// primeira referência.
    pub fn get_or_create(&mut self, sn: &str) -> &mut DeviceState {
        let defaults = &self.defaults;
        self.devices.entry(sn.to_string()).or_insert_with(|| DeviceState {
            sn: sn.to_string(),
            fw: defaults.fw.clone(),
            mode: DeviceMode::parse(&defaults.mode),
            temp_c: defaults.temp_c,
            vbat_v: defaults.vbat_v,
            temp_noise_sigma: defaults.temp_noise_sigma,
            vbat_noise_sigma: defaults.vbat_noise_sigma,
            temp_drift_per_cycle_c: defaults.temp_drift_per_cycle_c,
            vbat_drift_per_cycle_v: defaults.vbat_drift_per_cycle_v,
            drift_offset_c: 0.0,
            drift_offset_v: 0.0,
            self_test_fail_p_base: defaults.self_test_fail_p_base,
            burn_in_fail_slope: defaults.burn_in_fail_slope,
            cycles: 0,
            last_update: Instant::now(),
        })
    }

    /// Ciclos atuais de um SN (0 se o device ainda não existe).
    pub fn cycles_of(&self, sn: &str) -> u64 {
        self.devices.get(sn).map(|d| d.cycles).unwrap_or(0)
    }

    /// Random walk proporcional ao tempo desde o último toque.
    /// SAFE anda com metade da escala.
    fn update_signals(&mut self, rng: &mut StdRng, sn: &str) {
        let d = self.get_or_create(sn);
        let now = Instant::now();
        let dt = now.duration_since(d.last_update).as_secs_f64();
        d.last_update = now;

        let wander_scale = match d.mode {
            DeviceMode::Normal => 0.01,
            DeviceMode::Safe => 0.005,
        };
        d.temp_c += wander_scale * dt * (rng.gen::<f64>() - 0.5);

        let v_wander_scale = match d.mode {
            DeviceMode::Normal => 0.005,
            DeviceMode::Safe => 0.003,
        };
        d.vbat_v += v_wander_scale * dt * (rng.gen::<f64>() - 0.5);

        d.temp_c = d.temp_c.clamp(TEMP_MIN_C, TEMP_MAX_C);
        d.vbat_v = d.vbat_v.clamp(VBAT_MIN_V, VBAT_MAX_V);
    }

    /// Burn-in: um ciclo a mais + drift por ciclo no sinal verdadeiro.
    fn apply_burn_in(&mut self, sn: &str) {
        let d = self.get_or_create(sn);
        d.cycles += 1;
        d.temp_c += d.temp_drift_per_cycle_c;
        d.vbat_v += d.vbat_drift_per_cycle_v;
    }

    /// `PING <sn>`: identidade e tensão instantânea (sem burn-in).
    pub fn ping(&mut self, rng: &mut StdRng, sn: &str) -> Value {
        self.update_signals(rng, sn);
        let d = self.get_or_create(sn);
        json!({
            "sn": d.sn,
            "fw": d.fw,
            "mode": d.mode.as_str(),
            "vbat_v": round4(d.vbat_v + d.drift_offset_v),
        })
    }

    /// `READ_TEMP <sn>`: avança burn-in e mede com ruído gaussiano.
    pub fn read_temp(&mut self, rng: &mut StdRng, sn: &str) -> Value {
        self.apply_burn_in(sn);
        self.update_signals(rng, sn);

        let d = self.get_or_create(sn);
        let temp_true = d.temp_c + d.drift_offset_c;
        let vbat_true = d.vbat_v + d.drift_offset_v;
        let temp_sigma = d.temp_noise_sigma;
        let vbat_sigma = d.vbat_noise_sigma;
        let sn_owned = d.sn.clone();
        let cycles = d.cycles;

        let temp_meas = temp_true + gauss(rng, temp_sigma);
        let vbat_meas = vbat_true + gauss(rng, vbat_sigma);

        json!({
            "sn": sn_owned,
            "temp_c": round4(temp_meas),
            "vbat_v": round4(vbat_meas),
            "cycles": cycles,
        })
    }

    /// `SELF_TEST <sn>`: avança burn-in; falha com probabilidade
    /// crescente com os ciclos (0.7x em SAFE).
    pub fn self_test(&mut self, rng: &mut StdRng, sn: &str) -> Value {
        self.apply_burn_in(sn);
        self.update_signals(rng, sn);

        let d = self.get_or_create(sn);
        let mut p_fail = d.self_test_fail_p_base + d.burn_in_fail_slope * d.cycles as f64;
        if d.mode == DeviceMode::Safe {
            p_fail *= 0.7;
        }
        let sn_owned = d.sn.clone();
        let cycles = d.cycles;

        let failed = rng.gen::<f64>() < p_fail;
        json!({
            "sn": sn_owned,
            "self_test_ok": !failed,
            "p_fail": round6(p_fail),
            "cycles": cycles,
        })
    }

    /// `SET_TEMP <sn> <temp_c>`: força a temperatura verdadeira.
    /// A validação de faixa acontece no servidor, antes daqui.
    pub fn set_temp(&mut self, sn: &str, temp_c: f64) -> Value {
        let d = self.get_or_create(sn);
        d.temp_c = temp_c;
        json!({ "sn": d.sn, "temp_c": round4(d.temp_c) })
    }
}
