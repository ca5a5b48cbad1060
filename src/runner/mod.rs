//! # Runner de Batch (orquestrador)
//!
//! Executa o plano contra o DUT, um SN por vez, um step por vez, uma
//! tentativa por vez, registrando CADA tentativa como um evento no log.
//!
//! ## Fluxo por SN:
//!
//! 1. **Descoberta de firmware**: um `PING <sn>`; falhou, registra
//!    `"unknown"` e segue.
//! 2. **Para cada step do plano** (já gateado por estágio):
//!    - o timeout do client passa a ser o `timeout_s` do step;
//!    - loop de tentativas `1..=retries+1`:
//!      envia `CMD <sn>`, mede a duração, avalia limites, emite o
//!      evento, decide retry;
//!    - passou → próximo step; vai tentar de novo → dorme `backoff_ms`;
//!      esgotou → registra a falha e segue para o próximo step.
//! 3. O SN passa sse a tentativa FINAL de todo step passou.
//!
//! ## Política de retry
//!
//! Qualquer resultado não-passed conta para retry, SEM whitelist de
//! código de erro. Isso é proposital: flakes de qualquer origem ficam
//! observáveis no log como tentativas convergindo.
//!
//! ## Sequencialidade
//!
//! Execução estritamente sequencial dentro do batch (ordem de SN =
//! ordem de entrada; ordem de step = ordem do plano). Paralelizar SNs
//! quebraria o determinismo do seed compartilhado do DUT.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::client::DutClient;
use crate::errors::ErrorCode;
use crate::limits;
use crate::logger::{AttemptRecord, RunContext, RunLogger, StepEvent};
use crate::plan::{Plan, Step};

/// Resultado consolidado da tentativa FINAL de um step.
#[derive(Debug, Clone)]
pub struct StepAttemptResult {
    pub passed: bool,
    pub error_code: Option<String>,
    pub message: String,
    pub data: Value,
    pub duration_ms: u64,
}

/// Falha registrada no sumário por SN.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step_id: String,
    pub cmd: String,
    pub error_code: Option<String>,
    pub message: String,
    pub duration_ms: u64,
    pub data: Value,
}

/// Desfecho de um SN.
#[derive(Debug, Clone, Serialize)]
pub struct SnSummary {
    pub sn: String,
    pub fw_version: String,
    pub passed: bool,
    pub failures: Vec<StepFailure>,
}

/// Desfecho do batch inteiro, persistido em `results_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub batch_id: String,
    pub station_id: String,
    pub stage: String,
    pub overall_passed: bool,
    pub per_sn: BTreeMap<String, SnSummary>,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

pub struct TestRunner {
    client: DutClient,
    logger: RunLogger,
    ctx: RunContext,
    plan: Plan,
}

impl TestRunner {
    pub fn new(client: DutClient, logger: RunLogger, ctx: RunContext, plan: Plan) -> Self {
        Self {
            client,
            logger,
            ctx,
            plan,
        }
    }

    /// Um PING para descobrir o firmware do SN. Qualquer falha vira
    /// `"unknown"`: a descoberta nunca derruba o batch.
    async fn ping_fw(&self, sn: &str) -> String {
        let res = self.client.call("PING", &[sn], None).await;
        if res.ok {
            res.data["fw"].as_str().unwrap_or("unknown").to_string()
        } else {
            "unknown".to_string()
        }
    }

    /// Loop de tentativas de um step. Emite exatamente um evento por
    /// tentativa; o resultado retornado descreve a tentativa final.
    #[instrument(skip(self, step), fields(sn = %sn, step_id = %step.id, cmd = %step.cmd))]
    pub async fn run_step(&self, sn: &str, fw_version: &str, step: &Step) -> Result<StepAttemptResult> {
        let retries_allowed = step.retries;
        let backoff_ms = step.backoff_ms;
        let timeout_s = step.timeout_s;

        let mut last = StepAttemptResult {
            passed: false,
            error_code: Some(ErrorCode::Internal.as_str().to_string()),
            message: "Uninitialized".to_string(),
            data: json!({}),
            duration_ms: 0,
        };

        for attempt in 1..=retries_allowed + 1 {
            let t0 = Instant::now();
            // Timeout do passo sobrescreve o default do client.
            let res = self.client.call(&step.cmd, &[sn], Some(timeout_s)).await;
            let duration_ms = t0.elapsed().as_millis() as u64;

            let mut passed = res.ok;
            let mut error_code = res.error_code.clone();

            // Checagem de limites pode converter ok em LIMIT_FAIL.
            let (measurement, value, units) = if passed {
                let check = limits::evaluate(step.limits.as_ref(), &res.data);
                if !check.passed {
                    passed = false;
                    error_code = Some(ErrorCode::LimitFail.as_str().to_string());
                }
                (check.measurement, check.value, check.units)
            } else {
                (None, None, None)
            };

            let will_retry = !passed && attempt <= retries_allowed;
            let retry_reason = will_retry
                .then(|| error_code.clone().unwrap_or_else(|| "UNKNOWN".to_string()));

            let mut data = res.data.clone();
            if let Value::Object(map) = &mut data {
                map.insert("req_ids".to_string(), json!(step.req_ids));
            }

            let event = StepEvent::make(
                &self.ctx,
                AttemptRecord {
                    sn: sn.to_string(),
                    fw_version: fw_version.to_string(),
                    test_step: step.id.clone(),
                    command: step.cmd.clone(),
                    attempt,
                    retries_allowed,
                    timeout_s,
                    backoff_ms,
                    duration_ms,
                    passed,
                    error_code: error_code.clone(),
                    measurement,
                    value,
                    units,
                    message: res.message.clone(),
                    data: json!({
                        "step_name": step.name,
                        "req_ids": step.req_ids,
                        "will_retry": will_retry,
                        "retry_reason": retry_reason,
                        "raw": res.raw,
                    }),
                },
            );
            self.logger.log(&event)?;

            last = StepAttemptResult {
                passed,
                error_code: error_code.clone(),
                message: res.message,
                data,
                duration_ms,
            };

            if passed {
                break;
            }

            if will_retry {
                warn!(
                    attempt = attempt,
                    retries_allowed = retries_allowed,
                    error_code = error_code.as_deref().unwrap_or("UNKNOWN"),
                    backoff_ms = backoff_ms,
                    "Tentativa falhou, aguardando retry"
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }

        Ok(last)
    }

    /// Todos os steps de um SN, na ordem do plano.
    pub async fn run_sn(&self, sn: &str) -> Result<SnSummary> {
        let fw = self.ping_fw(sn).await;
        info!(sn = %sn, fw = %fw, "Iniciando SN");

        let mut failures = Vec::new();
        let mut sn_passed = true;

        for step in &self.plan.steps {
            let out = self.run_step(sn, &fw, step).await?;
            if !out.passed {
                sn_passed = false;
                failures.push(StepFailure {
                    step_id: step.id.clone(),
                    cmd: step.cmd.clone(),
                    error_code: out.error_code,
                    message: out.message,
                    duration_ms: out.duration_ms,
                    data: out.data,
                });
            }
        }

        info!(sn = %sn, passed = sn_passed, "SN finalizado");
        Ok(SnSummary {
            sn: sn.to_string(),
            fw_version: fw,
            passed: sn_passed,
            failures,
        })
    }

    /// O batch inteiro, SN por SN na ordem recebida.
    pub async fn run_batch(&self, sns: &[String]) -> Result<RunSummary> {
        let mut per_sn = BTreeMap::new();
        let mut overall = true;

        for sn in sns {
            let summary = self.run_sn(sn).await?;
            overall = overall && summary.passed;
            per_sn.insert(sn.clone(), summary);
        }

        Ok(RunSummary {
            run_id: self.ctx.run_id.clone(),
            batch_id: self.ctx.batch_id.clone(),
            station_id: self.ctx.station_id.clone(),
            stage: self.ctx.stage.clone(),
            overall_passed: overall,
            per_sn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientResult, DutTransport};
    use crate::plan::Stage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Transporte roteirizado: devolve respostas enfileiradas na ordem
    /// das chamadas, registrando as linhas enviadas.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<ClientResult>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<ClientResult>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DutTransport for ScriptedTransport {
        async fn call_line(&self, line: &str, _timeout: std::time::Duration) -> ClientResult {
            self.sent.lock().unwrap().push(line.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| fail("E_CLIENT", "script exhausted"))
        }
    }

    fn ok_with(data: Value) -> ClientResult {
        let raw = json!({
            "ok": true, "error_code": null, "message": "",
            "data": data, "meta": {"cmd": "X"},
        });
        ClientResult {
            ok: true,
            error_code: None,
            message: String::new(),
            data: raw["data"].clone(),
            raw,
        }
    }

    fn fail(code: &str, message: &str) -> ClientResult {
        ClientResult {
            ok: false,
            error_code: Some(code.to_string()),
            message: message.to_string(),
            data: json!({}),
            raw: json!({}),
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: "RUN1".to_string(),
            batch_id: "B1".to_string(),
            station_id: "S1".to_string(),
            stage: "EVT".to_string(),
        }
    }

    fn plan(steps_yaml: &str) -> Plan {
        let doc: crate::plan::PlanDoc = serde_yaml::from_str(&format!(
            r#"
plan: {{ name: T }}
station: {{ name: S, stage: EVT, fw_expected: '1.0.0' }}
batch: {{ sn_count: 1 }}
steps:
{steps_yaml}
"#
        ))
        .unwrap();
        Plan {
            name: doc.plan.name,
            version: doc.plan.version,
            station_name: doc.station.name,
            stage: Stage::EVT,
            fw_expected: doc.station.fw_expected,
            sn_count: doc.batch.sn_count,
            steps: doc.steps,
        }
    }

    fn read_events(dir: &Path) -> Vec<StepEvent> {
        let text = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        text.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn runner_with(
        dir: &Path,
        transport: Arc<ScriptedTransport>,
        plan: Plan,
    ) -> TestRunner {
        let client = DutClient::with_transport(transport, 2.0);
        let logger = RunLogger::new(dir).unwrap();
        TestRunner::new(client, logger, ctx(), plan)
    }

    #[tokio::test]
    async fn test_clean_run_one_event_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            ok_with(json!({"sn": "SN1", "fw": "1.0.0"})), // PING (descoberta)
            ok_with(json!({"sn": "SN1", "fw": "1.0.0"})), // step ping
            ok_with(json!({"sn": "SN1", "temp_c": 25.0, "cycles": 1})), // step read_temp
        ]);
        let p = plan(
            "  - { id: ping, name: Ping, cmd: PING, req_ids: [REQ-001] }\n  - { id: read_temp, name: Temp, cmd: READ_TEMP, req_ids: [REQ-002] }",
        );
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_batch(&["SN1".to_string()]).await.unwrap();
        assert!(summary.overall_passed);
        assert_eq!(summary.per_sn["SN1"].fw_version, "1.0.0");

        let events = read_events(dir.path());
        assert_eq!(events.len(), 2, "descoberta de fw não vira evento");
        assert!(events.iter().all(|e| e.passed && e.attempt == 1));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_and_converges() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            ok_with(json!({"fw": "1.0.0"})),
            fail("E_TIMEOUT", "Client timeout"),
            ok_with(json!({"temp_c": 25.0})),
        ]);
        let p = plan(
            "  - { id: read_temp, name: Temp, cmd: READ_TEMP, retries: 1, backoff_ms: 0, req_ids: [REQ-001] }",
        );
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_sn("SN2").await.unwrap();
        assert!(summary.passed, "converge na segunda tentativa");

        let events = read_events(dir.path());
        assert_eq!(events.len(), 2);

        let first = &events[0];
        assert!(!first.passed);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.error_code.as_deref(), Some("E_TIMEOUT"));
        assert_eq!(first.data["will_retry"], json!(true));
        assert_eq!(first.data["retry_reason"], json!("E_TIMEOUT"));

        let second = &events[1];
        assert!(second.passed);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.data["will_retry"], json!(false));
    }

    #[tokio::test]
    async fn test_limit_failure_synthesizes_limit_fail() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            ok_with(json!({"fw": "1.0.0"})),
            ok_with(json!({"temp_c": 200.0})),
        ]);
        let p = plan(
            "  - { id: read_temp, name: Temp, cmd: READ_TEMP, limits: { field: temp_c, max: 50 }, req_ids: [REQ-001] }",
        );
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_sn("SN1").await.unwrap();
        assert!(!summary.passed);
        assert_eq!(
            summary.failures[0].error_code.as_deref(),
            Some("LIMIT_FAIL")
        );

        let events = read_events(dir.path());
        assert_eq!(events[0].error_code.as_deref(), Some("LIMIT_FAIL"));
        assert_eq!(events[0].measurement.as_deref(), Some("temp_c"));
        assert_eq!(events[0].value, Some(json!(200.0)));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            ok_with(json!({"fw": "1.0.0"})),
            fail("E_INTERNAL", "boom"),
        ]);
        let p = plan(
            "  - { id: st, name: SelfTest, cmd: SELF_TEST, retries: 0, req_ids: [REQ-001] }",
        );
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_sn("SN1").await.unwrap();
        assert!(!summary.passed);

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attempt, 1);
        assert_eq!(events[0].data["will_retry"], json!(false));
    }

    #[tokio::test]
    async fn test_retries_exhausted_emits_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            ok_with(json!({"fw": "1.0.0"})),
            fail("E_BUSY", "busy"),
            fail("E_BUSY", "busy"),
            fail("E_BUSY", "busy"),
        ]);
        let p = plan(
            "  - { id: rt, name: Temp, cmd: READ_TEMP, retries: 2, backoff_ms: 0, req_ids: [REQ-001] }",
        );
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_sn("SN1").await.unwrap();
        assert!(!summary.passed);

        let events = read_events(dir.path());
        assert_eq!(events.len(), 3);
        // Invariantes de evento: attempt <= retries_allowed + 1,
        // retry_count = attempt - 1, terminal na última tentativa.
        for ev in &events {
            assert!(ev.attempt >= 1 && ev.attempt <= ev.retries_allowed + 1);
            assert_eq!(ev.retry_count, ev.attempt - 1);
        }
        let last = events.last().unwrap();
        assert_eq!(last.attempt, last.retries_allowed + 1);
        assert_eq!(last.data["will_retry"], json!(false));
    }

    #[tokio::test]
    async fn test_failed_fw_discovery_records_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            fail("E_CLIENT", "connection refused"),
            ok_with(json!({"fw": "1.0.0"})),
        ]);
        let p = plan("  - { id: ping, name: Ping, cmd: PING, req_ids: [REQ-001] }");
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner.run_sn("SN1").await.unwrap();
        assert_eq!(summary.fw_version, "unknown");
        assert!(summary.passed, "descoberta falha não reprova o SN");
    }

    // ------------------------------------------------------------------
    // Ponta a ponta: runner de verdade contra servidor DUT de verdade.
    // ------------------------------------------------------------------

    async fn spawn_dut(
        profiles: &str,
        default_profile: &str,
    ) -> (std::net::SocketAddr, crate::dut::server::ShutdownHandle) {
        let cfg: crate::config::DutConfig = serde_yaml::from_str(&format!(
            r#"
determinism: {{ seed: 99 }}
default_fault_profile: {default_profile}
fault_profiles:
  clean:
    default:
      timeout: {{ p: 0.0, mode: delay, delay_s: [0.0, 0.0] }}
      fail: {{ p: 0.0 }}
      busy: {{ min_interval_ms: 0, p: 0.0 }}
{profiles}
"#
        ))
        .unwrap();
        let (server, handle) = crate::dut::server::DutServer::new(cfg);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_end_to_end_clean_profile() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown) = spawn_dut("", "clean").await;

        let client = DutClient::tcp(addr.ip().to_string(), addr.port(), 2.0);
        let logger = RunLogger::new(dir.path()).unwrap();
        let p = plan(
            "  - { id: ping, name: Ping, cmd: PING, req_ids: [REQ-001] }\n  - { id: read_temp, name: Temp, cmd: READ_TEMP, limits: { field: temp_c, max: 80 }, req_ids: [REQ-002] }",
        );
        let runner = TestRunner::new(client, logger, ctx(), p);

        let summary = runner
            .run_batch(&["SN0001".to_string(), "SN0002".to_string()])
            .await
            .unwrap();
        assert!(summary.overall_passed);

        // 2 SNs x 2 steps = 4 eventos, todos passed na tentativa 1.
        let events = read_events(dir.path());
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.passed && e.attempt == 1));
        assert!(events
            .iter()
            .filter(|e| e.test_step == "read_temp")
            .all(|e| e.measurement.as_deref() == Some("temp_c")));

        // Yields derivados do log: tudo limpo.
        let rows = crate::analytics::io::read_events_jsonl(&dir.path().join("events.jsonl")).unwrap();
        let ys = crate::analytics::yields::compute_yields(&rows);
        assert_eq!(ys.total_units, 2);
        assert!((ys.fpy - 1.0).abs() < 1e-9);
        assert!((ys.fty - 1.0).abs() < 1e-9);
        assert_eq!(ys.flaky_rate, 0.0);

        // E o pipeline completo de artefatos roda sobre o mesmo diretório.
        let out_dir = crate::analytics::run_analytics(dir.path()).unwrap();
        let yield_csv = std::fs::read_to_string(out_dir.join("yield_summary.csv")).unwrap();
        assert!(yield_csv.contains("fpy,1"));
        assert!(yield_csv.contains("fty,1"));

        shutdown.signal();
    }

    #[tokio::test]
    async fn test_end_to_end_server_delay_exceeds_client_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = r#"
  slow:
    default:
      timeout: { p: 1.0, mode: delay, delay_s: [0.3, 0.3] }
"#;
        let (addr, shutdown) = spawn_dut(profiles, "slow").await;

        let client = DutClient::tcp(addr.ip().to_string(), addr.port(), 0.05);
        let logger = RunLogger::new(dir.path()).unwrap();
        let p = plan(
            "  - { id: read_temp, name: Temp, cmd: READ_TEMP, retries: 1, backoff_ms: 0, timeout_s: 0.05, req_ids: [REQ-001] }",
        );
        let runner = TestRunner::new(client, logger, ctx(), p);

        let summary = runner.run_sn("SN0001").await.unwrap();
        assert!(!summary.passed);

        // Duas tentativas, ambas E_TIMEOUT do lado do client.
        let events = read_events(dir.path());
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| !e.passed && e.error_code.as_deref() == Some("E_TIMEOUT")));

        let rows = crate::analytics::io::read_events_jsonl(&dir.path().join("events.jsonl")).unwrap();
        let pareto = crate::analytics::pareto::pareto_failures(&rows);
        assert_eq!(pareto.by_error, vec![("E_TIMEOUT".to_string(), 2)]);
        assert_eq!(pareto.by_step, vec![("read_temp".to_string(), 2)]);

        shutdown.signal();
    }

    #[tokio::test]
    async fn test_batch_outcome_is_conjunction() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            // SN1: descoberta + passo ok
            ok_with(json!({"fw": "1.0.0"})),
            ok_with(json!({})),
            // SN2: descoberta ok + passo falha
            ok_with(json!({"fw": "1.0.0"})),
            fail("E_INTERNAL", "boom"),
        ]);
        let p = plan("  - { id: ping, name: Ping, cmd: PING, req_ids: [REQ-001] }");
        let runner = runner_with(dir.path(), transport, p);

        let summary = runner
            .run_batch(&["SN1".to_string(), "SN2".to_string()])
            .await
            .unwrap();
        assert!(!summary.overall_passed);
        assert!(summary.per_sn["SN1"].passed);
        assert!(!summary.per_sn["SN2"].passed);
    }
}
