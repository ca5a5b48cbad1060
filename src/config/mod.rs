//! # Módulo de Configuração
//!
//! Duas configurações vivem aqui, uma por lado do fio:
//!
//! 1. [`Settings`]: configuração do runner, carregada de variáveis de
//!    ambiente (com `.env` honrado via `dotenvy`), sempre com defaults
//!    seguros.
//! 2. [`DutConfig`]: documento YAML do simulador de DUT: seed de
//!    determinismo, defaults do device e os perfis de fault nomeados.
//!
//! ## Cadeia de resolução do DutConfig
//!
//! 1. Caminho explícito (argumento de CLI)
//! 2. Variável de ambiente `MTAP_DUT_CONFIG`
//! 3. `dut/config.yaml` relativo ao diretório de trabalho
//! 4. Default embutido no binário
//!
//! Documento ausente ou malformado cai para o próximo elo da cadeia.
//! Ausência completa resulta em config vazia: todas as probabilidades
//! zeradas, equivalente ao perfil `clean`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default de DutConfig embutido no binário, usado quando nenhum arquivo
/// é encontrado na cadeia de resolução.
const EMBEDDED_DUT_CONFIG: &str = include_str!("../../resources/dut_config.yaml");

// ============================================================================
// SETTINGS DO RUNNER
// ============================================================================

/// Configuração do runner, resolvida de variáveis de ambiente.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Host do DUT (`MTAP_HOST`).
    pub host: String,
    /// Porta TCP do DUT (`MTAP_DUT_PORT`).
    pub dut_port: u16,
    /// Diretório raiz dos runs (`MTAP_RUNS_DIR`).
    pub runs_dir: PathBuf,
    /// Nível de log default (`MTAP_LOG_LEVEL`).
    pub log_level: String,
    /// Retries default por passo (`MTAP_RETRY_MAX`).
    pub retry_max: u32,
    /// Timeout default do client em segundos (`MTAP_TIMEOUT_S`).
    pub timeout_s: f64,
    /// Quantidade default de SNs num batch (`MTAP_SN_COUNT`).
    pub sn_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            dut_port: 9000,
            runs_dir: PathBuf::from("runs"),
            log_level: "INFO".to_string(),
            retry_max: 2,
            timeout_s: 2.0,
            sn_count: 3,
        }
    }
}

impl Settings {
    /// Carrega settings do ambiente. Valores não parseáveis mantêm o
    /// default (mesma postura tolerante do resto da cadeia de config).
    pub fn load() -> Self {
        // `.env` no diretório de trabalho, se existir. Nunca sobrescreve
        // variáveis já exportadas.
        let _ = dotenvy::dotenv();

        let mut s = Self::default();

        if let Ok(v) = std::env::var("MTAP_HOST") {
            if !v.trim().is_empty() {
                s.host = v;
            }
        }
        if let Ok(v) = std::env::var("MTAP_DUT_PORT") {
            if let Ok(n) = v.parse() {
                s.dut_port = n;
            }
        }
        if let Ok(v) = std::env::var("MTAP_RUNS_DIR") {
            if !v.trim().is_empty() {
                s.runs_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("MTAP_LOG_LEVEL") {
            if !v.trim().is_empty() {
                s.log_level = v;
            }
        }
        if let Ok(v) = std::env::var("MTAP_RETRY_MAX") {
            if let Ok(n) = v.parse() {
                s.retry_max = n;
            }
        }
        if let Ok(v) = std::env::var("MTAP_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                s.timeout_s = n;
            }
        }
        if let Ok(v) = std::env::var("MTAP_SN_COUNT") {
            if let Ok(n) = v.parse() {
                s.sn_count = n;
            }
        }

        s
    }
}

// ============================================================================
// CONFIG DO DUT (DOCUMENTO YAML)
// ============================================================================

/// Documento de configuração do simulador de DUT.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DutConfig {
    #[serde(default)]
    pub determinism: Determinism,
    /// Nome do perfil de fault ativo no boot do servidor.
    #[serde(default = "default_profile_name")]
    pub default_fault_profile: String,
    /// Valores iniciais de DeviceState para SNs recém-criados.
    #[serde(default)]
    pub device_defaults: DeviceDefaults,
    /// Perfis de fault nomeados, trocáveis em runtime via SET_FAULT_PROFILE.
    #[serde(default)]
    pub fault_profiles: HashMap<String, FaultProfile>,
}

fn default_profile_name() -> String {
    "clean".to_string()
}

/// Bloco de determinismo: um seed fixo torna o servidor bit-reproduzível
/// para um mesmo trace de requisições.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Determinism {
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Valores iniciais do modelo de device (ver `dut::device`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub fw: String,
    pub mode: String,
    pub temp_c: f64,
    pub vbat_v: f64,
    pub temp_noise_sigma: f64,
    pub vbat_noise_sigma: f64,
    pub temp_drift_per_cycle_c: f64,
    pub vbat_drift_per_cycle_v: f64,
    pub self_test_fail_p_base: f64,
    pub burn_in_fail_slope: f64,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            fw: "1.0.0".to_string(),
            mode: "NORMAL".to_string(),
            temp_c: 25.0,
            vbat_v: 12.0,
            temp_noise_sigma: 0.05,
            vbat_noise_sigma: 0.02,
            temp_drift_per_cycle_c: 0.0,
            vbat_drift_per_cycle_v: 0.0,
            self_test_fail_p_base: 0.01,
            burn_in_fail_slope: 0.000_05,
        }
    }
}

// ============================================================================
// PERFIS DE FAULT
// ============================================================================

/// Perfil de fault: seção `default` + overrides por comando + bloco de
/// Markov intermitente. Imutável depois de carregado: a mescla por
/// comando é feita por [`FaultProfile::effective`], nunca por mutação.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultProfile {
    #[serde(default)]
    pub default: CommandFaults,
    #[serde(default)]
    pub per_command: HashMap<String, CommandFaultsOverride>,
    #[serde(default)]
    pub intermittent_markov: MarkovConfig,
}

impl FaultProfile {
    /// Config efetiva para um comando: override por comando mesclado
    /// CAMPO a CAMPO sobre a seção `default`.
    pub fn effective(&self, cmd: &str) -> CommandFaults {
        let mut cfg = self.default.clone();
        if let Some(over) = self.per_command.get(cmd) {
            over.apply(&mut cfg);
        }
        cfg
    }
}

/// Seção completa de faults de um comando (após a mescla).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandFaults {
    pub timeout: TimeoutFault,
    pub fail: FailFault,
    pub drift: DriftFault,
    pub burn_in: BurnInFault,
    pub busy: BusyFault,
}

/// Modo do timeout sintético: atrasar e responder, ou derrubar a conexão.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutMode {
    #[default]
    Delay,
    Drop,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutFault {
    pub p: f64,
    pub mode: TimeoutMode,
    /// Faixa `[lo, hi]` do atraso em segundos, sorteio uniforme.
    pub delay_s: [f64; 2],
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailFault {
    pub p: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriftFault {
    pub temp_offset_per_cycle_c: f64,
    pub vbat_offset_per_cycle_v: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BurnInFault {
    pub fail_p_multiplier_per_1k_cycles: f64,
    pub drift_multiplier_per_1k_cycles: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusyFault {
    /// Rate-limit determinístico: intervalo mínimo entre requisições do
    /// mesmo `(sn, cmd)`. Zero desliga o gate.
    pub min_interval_ms: u64,
    pub p: f64,
}

/// Override parcial por comando: só os campos presentes no YAML
/// substituem o default: o resto da seção é herdado.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandFaultsOverride {
    pub timeout: Option<TimeoutOverride>,
    pub fail: Option<FailOverride>,
    pub drift: Option<DriftOverride>,
    pub burn_in: Option<BurnInOverride>,
    pub busy: Option<BusyOverride>,
}

impl CommandFaultsOverride {
    fn apply(&self, cfg: &mut CommandFaults) {
        if let Some(t) = &self.timeout {
            if let Some(p) = t.p {
                cfg.timeout.p = p;
            }
            if let Some(mode) = t.mode {
                cfg.timeout.mode = mode;
            }
            if let Some(delay) = t.delay_s {
                cfg.timeout.delay_s = delay;
            }
        }
        if let Some(f) = &self.fail {
            if let Some(p) = f.p {
                cfg.fail.p = p;
            }
        }
        if let Some(d) = &self.drift {
            if let Some(v) = d.temp_offset_per_cycle_c {
                cfg.drift.temp_offset_per_cycle_c = v;
            }
            if let Some(v) = d.vbat_offset_per_cycle_v {
                cfg.drift.vbat_offset_per_cycle_v = v;
            }
        }
        if let Some(b) = &self.burn_in {
            if let Some(v) = b.fail_p_multiplier_per_1k_cycles {
                cfg.burn_in.fail_p_multiplier_per_1k_cycles = v;
            }
            if let Some(v) = b.drift_multiplier_per_1k_cycles {
                cfg.burn_in.drift_multiplier_per_1k_cycles = v;
            }
        }
        if let Some(b) = &self.busy {
            if let Some(v) = b.min_interval_ms {
                cfg.busy.min_interval_ms = v;
            }
            if let Some(p) = b.p {
                cfg.busy.p = p;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutOverride {
    pub p: Option<f64>,
    pub mode: Option<TimeoutMode>,
    pub delay_s: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailOverride {
    pub p: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriftOverride {
    pub temp_offset_per_cycle_c: Option<f64>,
    pub vbat_offset_per_cycle_v: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BurnInOverride {
    pub fail_p_multiplier_per_1k_cycles: Option<f64>,
    pub drift_multiplier_per_1k_cycles: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusyOverride {
    pub min_interval_ms: Option<u64>,
    pub p: Option<f64>,
}

/// Cadeia de Markov de 2 estados (GOOD/BAD) para rajadas intermitentes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MarkovConfig {
    pub enabled: bool,
    pub p_good_to_bad: f64,
    pub p_bad_to_good: f64,
    /// Probabilidade ADICIONAL de fail enquanto a cadeia está em BAD.
    pub fail_p_bad_state: f64,
    /// Probabilidade ADICIONAL de timeout enquanto a cadeia está em BAD.
    pub timeout_p_bad_state: f64,
    /// Override `[lo, hi]` do atraso quando o timeout vem do ramo Markov.
    pub timeout_delay_s: [f64; 2],
}

// ============================================================================
// RESOLUÇÃO DO DUT CONFIG
// ============================================================================

fn try_parse(source: &str, text: &str) -> Option<DutConfig> {
    match serde_yaml::from_str::<DutConfig>(text) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(source = %source, error = %e, "DUT config malformado, caindo para o próximo da cadeia");
            None
        }
    }
}

fn try_read(source: &str, path: &Path) -> Option<DutConfig> {
    let text = std::fs::read_to_string(path).ok()?;
    try_parse(source, &text)
}

/// Resolve o DutConfig pela cadeia documentada no topo do módulo.
pub fn load_dut_config(explicit: Option<&Path>) -> DutConfig {
    if let Some(p) = explicit {
        if p.exists() {
            if let Some(cfg) = try_read("explicit", p) {
                return cfg;
            }
        }
    }

    if let Ok(env_path) = std::env::var("MTAP_DUT_CONFIG") {
        let env_path = env_path.trim().to_string();
        if !env_path.is_empty() {
            let p = PathBuf::from(&env_path);
            if p.exists() {
                if let Some(cfg) = try_read("MTAP_DUT_CONFIG", &p) {
                    return cfg;
                }
            }
        }
    }

    let dev = Path::new("dut/config.yaml");
    if dev.exists() {
        if let Some(cfg) = try_read("dut/config.yaml", dev) {
            return cfg;
        }
    }

    try_parse("embedded", EMBEDDED_DUT_CONFIG).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_YAML: &str = r#"
default:
  timeout: { p: 0.1, mode: delay, delay_s: [0.5, 1.5] }
  fail: { p: 0.03 }
  drift: { temp_offset_per_cycle_c: 0.01, vbat_offset_per_cycle_v: 0.001 }
  burn_in: { fail_p_multiplier_per_1k_cycles: 0.2, drift_multiplier_per_1k_cycles: 0.3 }
  busy: { min_interval_ms: 0, p: 0.0 }
per_command:
  PING:
    fail: { p: 0.0 }
  READ_TEMP:
    timeout: { mode: drop }
intermittent_markov:
  enabled: true
  p_good_to_bad: 0.05
  p_bad_to_good: 0.2
  fail_p_bad_state: 0.8
"#;

    #[test]
    fn test_effective_merges_field_by_field() {
        let profile: FaultProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();

        // PING: só fail.p sobrescrito, o resto herdado do default.
        let ping = profile.effective("PING");
        assert_eq!(ping.fail.p, 0.0);
        assert_eq!(ping.timeout.p, 0.1);
        assert_eq!(ping.busy.min_interval_ms, 0);

        // READ_TEMP: só o modo do timeout muda; p e delay herdados.
        let rt = profile.effective("READ_TEMP");
        assert_eq!(rt.timeout.mode, TimeoutMode::Drop);
        assert_eq!(rt.timeout.p, 0.1);
        assert_eq!(rt.timeout.delay_s, [0.5, 1.5]);
        assert_eq!(rt.fail.p, 0.03);
    }

    #[test]
    fn test_effective_does_not_mutate_base_profile() {
        let profile: FaultProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();
        let _ = profile.effective("PING");
        assert_eq!(profile.default.fail.p, 0.03);
    }

    #[test]
    fn test_unknown_command_gets_pure_defaults() {
        let profile: FaultProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();
        let other = profile.effective("SELF_TEST");
        assert_eq!(other.fail.p, 0.03);
        assert_eq!(other.timeout.mode, TimeoutMode::Delay);
    }

    #[test]
    fn test_empty_config_is_all_zeroes() {
        let cfg = DutConfig::default();
        assert!(cfg.fault_profiles.is_empty());
        let clean = FaultProfile::default();
        let eff = clean.effective("READ_TEMP");
        assert_eq!(eff.timeout.p, 0.0);
        assert_eq!(eff.fail.p, 0.0);
        assert_eq!(eff.busy.p, 0.0);
        assert!(!clean.intermittent_markov.enabled);
    }

    #[test]
    fn test_embedded_default_parses() {
        let cfg = try_parse("embedded", EMBEDDED_DUT_CONFIG).unwrap();
        assert!(cfg.fault_profiles.contains_key("clean"));
    }

    #[test]
    fn test_device_defaults() {
        let d = DeviceDefaults::default();
        assert_eq!(d.fw, "1.0.0");
        assert_eq!(d.mode, "NORMAL");
        assert_eq!(d.temp_c, 25.0);
        assert_eq!(d.vbat_v, 12.0);
    }

    #[test]
    fn test_settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.dut_port, 9000);
        assert_eq!(s.retry_max, 2);
        assert_eq!(s.timeout_s, 2.0);
        assert_eq!(s.sn_count, 3);
    }
}
