//! # MTAP: Manufacturing Test Automation Platform
//!
//! Ponto de entrada da plataforma. Três subcomandos compõem o pipeline:
//!
//! ```bash
//! # 1. Sobe o simulador TCP de DUT (em um terminal)
//! mtap dut
//!
//! # 2. Roda um batch multi-SN contra o DUT (em outro)
//! mtap batch --plan plans/smoke_plan.yaml --station-id FCT-01
//!
//! # 3. Recalcula as métricas de yield de um run já gravado
//! mtap analytics --run-dir runs/20260801T120000Z
//! ```
//!
//! ## Códigos de saída
//!
//! | Código | Significado                                  |
//! |--------|----------------------------------------------|
//! | 0      | batch completo, todos os SNs aprovados       |
//! | 1      | batch completo com pelo menos um SN reprovado|
//! | 2      | argumentos de CLI ou configuração inválidos  |
//! | 3      | violação do gate de rastreabilidade          |

mod analytics;
mod client;
mod config;
mod dut;
mod errors;
mod ids;
mod limits;
mod logger;
mod plan;
mod protocol;
mod reporting;
mod runner;
mod telemetry;
mod traceability;
mod validation;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use tokio::net::TcpListener;
use tracing::{error, info, Level};

use crate::client::DutClient;
use crate::config::{load_dut_config, Settings};
use crate::dut::server::DutServer;
use crate::logger::{RunContext, RunLogger};
use crate::plan::Stage;
use crate::runner::TestRunner;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use crate::traceability::CoverageError;

// ============================================================================
// DEFINIÇÃO DA CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "mtap")]
#[command(about = "Manufacturing Test Automation Platform (MTAP)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sobe o simulador TCP de DUT.
    Dut {
        /// Caminho explícito do config do DUT (YAML). Sem ele, a cadeia
        /// MTAP_DUT_CONFIG → dut/config.yaml → default embutido.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Sobrescreve o host do config do runner.
        #[arg(long)]
        host: Option<String>,

        /// Sobrescreve a porta do config do runner.
        #[arg(long)]
        port: Option<u16>,

        /// Logs detalhados de debug.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Executa um batch multi-SN contra o DUT.
    Batch {
        /// Caminho do plano de teste (YAML).
        #[arg(long)]
        plan: PathBuf,

        /// Identificador do batch. Sem ele, um UUID v4 é gerado.
        #[arg(long)]
        batch_id: Option<String>,

        /// Identificador da estação de teste.
        #[arg(long)]
        station_id: String,

        /// Lista de SNs separados por vírgula. Vazio = gera
        /// SN0001..SN<n> a partir de batch.sn_count do plano.
        #[arg(long, default_value = "")]
        sns: String,

        /// Estágio efetivo (EVT, DVT, PVT, MP). Vazio = o da estação.
        #[arg(long)]
        stage: Option<String>,

        /// Exporta também um junit.xml no caminho dado.
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Habilita exportação de traces OTEL.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// Endpoint do coletor OTLP (default: env ou localhost:4317).
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Modo silencioso: só erros no stderr.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Logs detalhados de debug.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Recalcula as analytics de yield de um run existente.
    Analytics {
        /// Diretório do run (runs/<run_id>).
        #[arg(long)]
        run_dir: PathBuf,
    },
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Dut {
            config,
            host,
            port,
            verbose,
        } => {
            init_logging(verbose, false, None);
            let code = run_dut(config.as_deref(), host, port).await;
            ExitCode::from(code)
        }

        Commands::Batch {
            plan,
            batch_id,
            station_id,
            sns,
            stage,
            junit,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let endpoint = otel.then(|| {
                otel_endpoint
                    .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
                    .unwrap_or_else(|| "http://localhost:4317".to_string())
            });
            init_logging(verbose, silent, endpoint);

            let code = run_batch_cmd(
                &plan,
                batch_id,
                &station_id,
                &sns,
                stage.as_deref(),
                junit.as_deref(),
            )
            .await;

            shutdown_telemetry();
            ExitCode::from(code)
        }

        Commands::Analytics { run_dir } => {
            init_logging(false, false, None);
            match analytics::run_analytics(&run_dir) {
                Ok(out_dir) => {
                    info!(out_dir = %out_dir.display(), "Analytics gravadas");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Falha nas analytics");
                    ExitCode::from(2)
                }
            }
        }
    }
}

/// Monta a telemetria com o nível vindo dos flags e do ambiente.
/// Falha de OTLP cai para logging simples de console.
fn init_logging(verbose: bool, silent: bool, otlp_endpoint: Option<String>) {
    let settings_level = Settings::load().log_level;

    let mut config = TelemetryConfig::from_env();
    config.otlp_endpoint = otlp_endpoint.or(config.otlp_endpoint);
    config.log_level = if silent {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::from_str(&settings_level).unwrap_or(Level::INFO)
    };

    if init_telemetry(config).is_err() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

// ============================================================================
// SUBCOMANDO: DUT
// ============================================================================

async fn run_dut(config: Option<&Path>, host: Option<String>, port: Option<u16>) -> u8 {
    let settings = Settings::load();
    let host = host.unwrap_or(settings.host);
    let port = port.unwrap_or(settings.dut_port);

    let cfg = load_dut_config(config);
    let (server, shutdown) = DutServer::new(cfg);

    let listener = match TcpListener::bind((host.as_str(), port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(host = %host, port = port, error = %e, "Não consegui fazer bind");
            return 2;
        }
    };

    // Ctrl-C vira o sinal de shutdown observado pelo loop de accept.
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("[DUT] ctrl-c, encerrando");
        shutdown.signal();
    });

    match server.serve(listener).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Servidor DUT morreu");
            2
        }
    }
}

// ============================================================================
// SUBCOMANDO: BATCH
// ============================================================================

fn parse_sns(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run_batch_cmd(
    plan_path: &Path,
    batch_id: Option<String>,
    station_id: &str,
    sns_arg: &str,
    stage_arg: Option<&str>,
    junit_path: Option<&Path>,
) -> u8 {
    let settings = Settings::load();

    // Estágio efetivo: flag da CLI vence o declarado pela estação.
    let stage_override = match stage_arg.filter(|s| !s.trim().is_empty()) {
        None => None,
        Some(s) => match Stage::from_str(s) {
            Ok(stage) => Some(stage),
            Err(e) => {
                error!(error = %e, "Estágio inválido");
                return 2;
            }
        },
    };

    let plan = match plan::load_plan(plan_path, stage_override) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Falha ao carregar o plano");
            return 2;
        }
    };

    let run_id = ids::run_id_utc();
    let run_dir = settings.runs_dir.join(&run_id);
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        error!(error = %e, "Falha ao criar o diretório do run");
        return 2;
    }

    // Gate de rastreabilidade: raciocina sobre o plano SEM gating e
    // aborta ANTES de qualquer chamada ao DUT.
    let raw_plan = match plan::load_plan_raw(plan_path) {
        Ok(doc) => doc,
        Err(e) => {
            error!(error = %e, "Falha ao carregar o plano");
            return 2;
        }
    };
    if let Err(e) = traceability::enforce(&raw_plan, &run_dir) {
        if e.downcast_ref::<CoverageError>().is_some() {
            error!(error = %e, "Gate de rastreabilidade reprovou o plano");
            return 3;
        }
        error!(error = %e, "Falha no gate de rastreabilidade");
        return 2;
    }

    let batch_id = batch_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut sns = parse_sns(sns_arg);
    if sns.is_empty() {
        sns = ids::default_sns(plan.sn_count);
    }

    info!(
        run_id = %run_id,
        batch_id = %batch_id,
        station_id = %station_id,
        plan = %plan.name,
        plan_version = plan.version,
        station = %plan.station_name,
        stage = %plan.stage,
        fw_expected = %plan.fw_expected,
        sn_count = sns.len(),
        steps = plan.steps.len(),
        "Batch iniciando"
    );

    let logger = match RunLogger::new(&run_dir) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Falha ao abrir o log de eventos");
            return 2;
        }
    };

    let client = DutClient::tcp(settings.host.clone(), settings.dut_port, settings.timeout_s);
    let ctx = RunContext {
        run_id: run_id.clone(),
        batch_id: batch_id.clone(),
        station_id: station_id.to_string(),
        stage: plan.stage.to_string(),
    };
    let runner = TestRunner::new(client, logger, ctx, plan);

    let summary = match runner.run_batch(&sns).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Batch abortado");
            return 2;
        }
    };

    if let Err(e) = summary.write_json(&run_dir.join("results_summary.json")) {
        error!(error = %e, "Falha ao gravar results_summary.json");
        return 2;
    }

    match analytics::run_analytics(&run_dir) {
        Ok(out_dir) => info!(analytics = %out_dir.display(), "Analytics do run gravadas"),
        Err(e) => error!(error = %e, "Falha nas analytics do run"),
    }

    match reporting::report::generate_report(&run_dir) {
        Ok(path) => info!(report = %path.display(), "Relatório de qualificação gerado"),
        Err(e) => error!(error = %e, "Falha ao renderizar o relatório"),
    }

    if let Some(path) = junit_path {
        match reporting::junit::write_junit(path, &summary) {
            Ok(()) => info!(junit = %path.display(), "JUnit exportado"),
            Err(e) => error!(error = %e, "Falha ao exportar JUnit"),
        }
    }

    if summary.overall_passed {
        info!(run_id = %run_id, "Batch aprovado ✅");
        0
    } else {
        let failed: Vec<&str> = summary
            .per_sn
            .values()
            .filter(|s| !s.passed)
            .map(|s| s.sn.as_str())
            .collect();
        error!(run_id = %run_id, failed_sns = ?failed, "Batch reprovado ❌");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sns_trims_and_drops_empties() {
        assert_eq!(parse_sns("SN1, SN2 ,,SN3"), vec!["SN1", "SN2", "SN3"]);
        assert!(parse_sns("").is_empty());
        assert!(parse_sns(" , ").is_empty());
    }
}
