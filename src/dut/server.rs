//! # Servidor DUT (simulador TCP multi-cliente)
//!
//! Loop de accept em uma task; cada conexão aceita ganha sua própria
//! task. O protocolo é o codec de linha de `crate::protocol`: uma
//! requisição ASCII por linha, uma resposta JSON por linha.
//!
//! ## Estado compartilhado
//!
//! RNG, mapa de devices, injetor de faults e o perfil ativo são UM
//! estado só, guardado por um único mutex por despacho. A granularidade
//! é proposital: os sorteios do RNG precisam observar ordem total para
//! o servidor ser reproduzível, e a troca de perfil é global. O lock é
//! liberado ANTES de qualquer sleep de DELAY/DROP.
//!
//! ## Shutdown
//!
//! Um canal `watch` é observado entre ciclos de accept e entre linhas
//! de cada conexão; conexões em voo terminam a linha corrente e saem.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;

use crate::config::{DutConfig, FaultProfile};
use crate::dut::device::DeviceModel;
use crate::dut::faults::{FaultAction, FaultInjector};
use crate::errors::ErrorCode;
use crate::protocol::{self, parse_command, Response};

/// Faixa física aceita por SET_TEMP.
const SET_TEMP_MIN: f64 = -40.0;
const SET_TEMP_MAX: f64 = 125.0;

/// Estado compartilhado entre as tasks de conexão.
struct ServerState {
    rng: StdRng,
    devices: DeviceModel,
    faults: FaultInjector,
    /// Perfis nomeados do config, para trocas em runtime.
    profiles: std::collections::HashMap<String, FaultProfile>,
}

impl ServerState {
    fn resolve_profile(&self, name: &str) -> FaultProfile {
        // Nome desconhecido resolve silenciosamente para `clean`;
        // `clean` ausente equivale a um perfil vazio (tudo zerado).
        self.profiles
            .get(name)
            .or_else(|| self.profiles.get("clean"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Handle para sinalizar o shutdown do servidor.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.0.send(true);
    }
}

/// O que fazer com a linha despachada.
enum Dispatch {
    /// Escrever a resposta e seguir lendo.
    Reply(Response),
    /// Linha vazia: nada a responder.
    Ignore,
    /// DROP simulado: fechar a conexão sem responder.
    Close,
}

pub struct DutServer {
    state: Arc<Mutex<ServerState>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DutServer {
    /// Monta o servidor a partir do documento de config do DUT.
    ///
    /// O perfil inicial vem de `MTAP_FAULT_PROFILE` (se setado) ou de
    /// `default_fault_profile`; nomes desconhecidos caem em `clean`.
    pub fn new(cfg: DutConfig) -> (Self, ShutdownHandle) {
        let rng = match cfg.determinism.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let profile_name = std::env::var("MTAP_FAULT_PROFILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| cfg.default_fault_profile.clone());

        let state = ServerState {
            rng,
            devices: DeviceModel::new(cfg.device_defaults.clone()),
            faults: FaultInjector::new(FaultProfile::default()),
            profiles: cfg.fault_profiles.clone(),
        };
        let initial = state.resolve_profile(&profile_name);

        let state = Arc::new(Mutex::new(ServerState {
            faults: FaultInjector::new(initial),
            ..state
        }));

        let (tx, rx) = watch::channel(false);
        (
            Self {
                state,
                shutdown_rx: rx,
            },
            ShutdownHandle(tx),
        )
    }

    /// Loop de accept. Consome o listener já vinculado (os testes usam
    /// porta efêmera; o binário faz bind em host:porta do config).
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "[DUT] listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // Sender sumiu = ninguém mais consegue nos parar; trata
                    // como pedido de shutdown.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "[DUT] connection accepted");
                            let state = Arc::clone(&self.state);
                            let shutdown = self.shutdown_rx.clone();
                            tokio::spawn(async move {
                                handle_connection(state, stream, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "[DUT] accept failed");
                        }
                    }
                }
            }
        }

        info!("[DUT] shutdown complete");
        Ok(())
    }
}

/// Loop por conexão: bufferiza até `\n`, despacha, escreve a resposta.
/// O socket fecha em TODOS os caminhos de saída (fim do escopo).
async fn handle_connection(
    state: Arc<Mutex<ServerState>>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                match dispatch(&state, &line).await {
                    Dispatch::Ignore => continue,
                    Dispatch::Close => return,
                    Dispatch::Reply(resp) => {
                        if write_line(&mut write_half, &resp).await.is_err() {
                            return;
                        }
                    }
                }
            }
            // Cliente fechou ou erro de leitura: encerra a conexão.
            Ok(None) | Err(_) => return,
        }
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, resp: &Response) -> anyhow::Result<()> {
    let mut payload = resp.to_line()?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    Ok(())
}

/// Despacho por tag de comando (match), sem polimorfismo: os cinco
/// comandos quase não compartilham código.
async fn dispatch(state: &Arc<Mutex<ServerState>>, line: &str) -> Dispatch {
    let Some(req) = parse_command(line) else {
        return Dispatch::Ignore;
    };
    let cmd = req.cmd.as_str();

    match cmd {
        "SET_FAULT_PROFILE" => {
            if req.args.len() != 1 {
                return reply_err(
                    ErrorCode::BadArgs,
                    "SET_FAULT_PROFILE requires 1 argument: <profile>",
                    cmd,
                );
            }
            let name = req.args[0].trim().to_string();
            let mut guard = state.lock().await;
            let profile = guard.resolve_profile(&name);
            guard.faults.set_profile(profile);
            info!(profile = %name, "[DUT] fault profile switched");
            Dispatch::Reply(protocol::ok(json!({ "profile": name }), cmd))
        }

        "PING" | "READ_TEMP" | "SELF_TEST" => {
            if req.args.len() != 1 {
                return reply_err(
                    ErrorCode::BadArgs,
                    format!("{cmd} requires 1 argument: <sn>"),
                    cmd,
                );
            }
            let sn = req.args[0].clone();

            let action = {
                let mut guard = state.lock().await;
                let cycles = {
                    let d = guard.devices.get_or_create(&sn);
                    let (offsets_c, offsets_v) = (d.drift_offset_c, d.drift_offset_v);
                    let cycles = d.cycles;
                    // Drift por requisição: deslocamento lento da baseline.
                    let (new_c, new_v) =
                        guard.faults.apply_drift(cmd, cycles, offsets_c, offsets_v);
                    let d = guard.devices.get_or_create(&sn);
                    d.drift_offset_c = new_c;
                    d.drift_offset_v = new_v;
                    cycles
                };
                let ServerState { rng, faults, .. } = &mut *guard;
                let action = faults.evaluate(rng, cmd, &sn, cycles, Instant::now());
                if action == FaultAction::Pass {
                    let ServerState { rng, devices, .. } = &mut *guard;
                    let data = run_device_op(devices, rng, cmd, &sn);
                    return Dispatch::Reply(protocol::ok(data, cmd));
                }
                action
            };

            match action {
                FaultAction::Respond { code, message } => reply_err(code, message, cmd),
                FaultAction::Delay { delay_s } => {
                    // Sleep fora do lock; o device responde depois do atraso.
                    sleep_s(delay_s).await;
                    let mut guard = state.lock().await;
                    let ServerState { rng, devices, .. } = &mut *guard;
                    let data = run_device_op(devices, rng, cmd, &sn);
                    Dispatch::Reply(protocol::ok(data, cmd))
                }
                FaultAction::Drop { delay_s } => {
                    sleep_s(delay_s).await;
                    Dispatch::Close
                }
                FaultAction::Pass => unreachable!("Pass é tratado dentro do lock"),
            }
        }

        "SET_TEMP" => {
            if req.args.len() != 2 {
                return reply_err(
                    ErrorCode::BadArgs,
                    "SET_TEMP requires 2 arguments: <sn> <temp_c>",
                    cmd,
                );
            }
            let sn = req.args[0].clone();
            let Ok(temp_c) = req.args[1].parse::<f64>() else {
                return reply_err(ErrorCode::BadArgs, "temp_c must be a float", cmd);
            };
            if !temp_c.is_finite() || !(SET_TEMP_MIN..=SET_TEMP_MAX).contains(&temp_c) {
                return reply_err(
                    ErrorCode::OutOfRange,
                    "temp_c out of range [-40.0, 125.0]",
                    cmd,
                );
            }

            let action = {
                let mut guard = state.lock().await;
                let cycles = guard.devices.get_or_create(&sn).cycles;
                let ServerState { rng, faults, .. } = &mut *guard;
                let action = faults.evaluate(rng, cmd, &sn, cycles, Instant::now());
                if action == FaultAction::Pass {
                    let data = guard.devices.set_temp(&sn, temp_c);
                    return Dispatch::Reply(protocol::ok(data, cmd));
                }
                action
            };

            match action {
                FaultAction::Respond { code, message } => reply_err(code, message, cmd),
                FaultAction::Delay { delay_s } => {
                    sleep_s(delay_s).await;
                    let mut guard = state.lock().await;
                    let data = guard.devices.set_temp(&sn, temp_c);
                    Dispatch::Reply(protocol::ok(data, cmd))
                }
                FaultAction::Drop { delay_s } => {
                    sleep_s(delay_s).await;
                    Dispatch::Close
                }
                FaultAction::Pass => unreachable!("Pass é tratado dentro do lock"),
            }
        }

        other => reply_err(ErrorCode::UnknownCmd, format!("Unknown command: {other}"), other),
    }
}

fn reply_err(code: ErrorCode, message: impl Into<String>, cmd: &str) -> Dispatch {
    Dispatch::Reply(protocol::err(code, message, cmd))
}

async fn sleep_s(delay_s: f64) {
    if delay_s > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delay_s)).await;
    }
}

fn run_device_op(devices: &mut DeviceModel, rng: &mut StdRng, cmd: &str, sn: &str) -> Value {
    match cmd {
        "PING" => devices.ping(rng, sn),
        "READ_TEMP" => devices.read_temp(rng, sn),
        "SELF_TEST" => devices.self_test(rng, sn),
        _ => unreachable!("comando sem operação de device: {cmd}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;

    fn test_config(extra_profiles: &str) -> DutConfig {
        let yaml = format!(
            r#"
determinism: {{ seed: 42 }}
default_fault_profile: clean
fault_profiles:
  clean:
    default:
      timeout: {{ p: 0.0, mode: delay, delay_s: [0.0, 0.0] }}
      fail: {{ p: 0.0 }}
      busy: {{ min_interval_ms: 0, p: 0.0 }}
{extra_profiles}
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    async fn spawn_server(cfg: DutConfig) -> (SocketAddr, ShutdownHandle) {
        let (server, handle) = DutServer::new(cfg);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, handle)
    }

    /// Uma conexão nova por chamada, como o client real faz.
    async fn call(addr: SocketAddr, line: &str) -> Response {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        reader.read_line(&mut buf).await.unwrap();
        serde_json::from_str(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_ping_returns_identity() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let resp = call(addr, "PING SN0001").await;
        assert!(resp.ok);
        assert_eq!(resp.data["sn"], "SN0001");
        assert_eq!(resp.data["fw"], "1.0.0");
        assert_eq!(resp.data["mode"], "NORMAL");
        handle.signal();
    }

    #[tokio::test]
    async fn test_read_temp_advances_cycles_across_connections() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let a = call(addr, "READ_TEMP SN0001").await;
        let b = call(addr, "READ_TEMP SN0001").await;
        assert_eq!(a.data["cycles"], 1);
        assert_eq!(b.data["cycles"], 2);
        handle.signal();
    }

    #[tokio::test]
    async fn test_command_case_is_normalized() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let resp = call(addr, "ping SN0001").await;
        assert!(resp.ok);
        assert_eq!(resp.meta.cmd, "PING");
        handle.signal();
    }

    #[tokio::test]
    async fn test_set_temp_boundaries() {
        let (addr, handle) = spawn_server(test_config("")).await;

        let resp = call(addr, "SET_TEMP SN0001 -40.0").await;
        assert!(resp.ok, "extremo inferior deveria passar");
        let resp = call(addr, "SET_TEMP SN0001 125.0").await;
        assert!(resp.ok, "extremo superior deveria passar");

        let resp = call(addr, "SET_TEMP SN0001 -40.0001").await;
        assert_eq!(resp.error_code, Some(ErrorCode::OutOfRange));
        let resp = call(addr, "SET_TEMP SN0001 125.0001").await;
        assert_eq!(resp.error_code, Some(ErrorCode::OutOfRange));

        let resp = call(addr, "SET_TEMP SN0001 abc").await;
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));
        handle.signal();
    }

    #[tokio::test]
    async fn test_bad_arity_names_expectation() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let resp = call(addr, "PING").await;
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));
        assert!(resp.message.contains("1 argument"));

        let resp = call(addr, "PING SN1 extra").await;
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));
        handle.signal();
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let resp = call(addr, "REBOOT SN0001").await;
        assert_eq!(resp.error_code, Some(ErrorCode::UnknownCmd));
        handle.signal();
    }

    #[tokio::test]
    async fn test_empty_line_is_ignored() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"\n   \nPING SN0001\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        reader.read_line(&mut buf).await.unwrap();
        let resp: Response = serde_json::from_str(&buf).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.meta.cmd, "PING");
        handle.signal();
    }

    #[tokio::test]
    async fn test_unknown_profile_resolves_to_clean() {
        let (addr, handle) = spawn_server(test_config("")).await;
        let resp = call(addr, "SET_FAULT_PROFILE does_not_exist").await;
        assert!(resp.ok);
        assert_eq!(resp.data["profile"], "does_not_exist");
        // Segue limpo: nenhuma falha injetada.
        let resp = call(addr, "READ_TEMP SN0001").await;
        assert!(resp.ok);
        handle.signal();
    }

    #[tokio::test]
    async fn test_busy_rate_limit_second_request() {
        let profiles = r#"
  rate_limited:
    default:
      busy: { min_interval_ms: 60000, p: 0.0 }
"#;
        let (addr, handle) = spawn_server(test_config(profiles)).await;
        let resp = call(addr, "SET_FAULT_PROFILE rate_limited").await;
        assert!(resp.ok);

        let first = call(addr, "READ_TEMP SN0001").await;
        assert!(first.ok, "primeira requisição passa o gate");
        let second = call(addr, "READ_TEMP SN0001").await;
        assert_eq!(second.error_code, Some(ErrorCode::Busy));
        assert!(second.message.contains("Rate-limited"));
        handle.signal();
    }

    #[tokio::test]
    async fn test_drop_closes_connection_without_reply() {
        let profiles = r#"
  dropper:
    default:
      timeout: { p: 1.0, mode: drop, delay_s: [0.0, 0.0] }
"#;
        let (addr, handle) = spawn_server(test_config(profiles)).await;
        let resp = call(addr, "SET_FAULT_PROFILE dropper").await;
        assert!(resp.ok);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"READ_TEMP SN0001\n").await.unwrap();
        let mut buf = Vec::new();
        let n = stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0, "DROP fecha sem resposta");

        // A próxima conexão funciona normalmente (perfil de volta a clean).
        let resp = call(addr, "SET_FAULT_PROFILE clean").await;
        assert!(resp.ok);
        let resp = call(addr, "READ_TEMP SN0001").await;
        assert!(resp.ok);
        handle.signal();
    }

    #[tokio::test]
    async fn test_internal_fault_responds_with_error() {
        let profiles = r#"
  always_fail:
    default:
      fail: { p: 1.0 }
"#;
        let (addr, handle) = spawn_server(test_config(profiles)).await;
        let resp = call(addr, "SET_FAULT_PROFILE always_fail").await;
        assert!(resp.ok);
        let resp = call(addr, "READ_TEMP SN0001").await;
        assert_eq!(resp.error_code, Some(ErrorCode::Internal));
        assert_eq!(resp.data, json!({}));
        handle.signal();
    }

    #[tokio::test]
    async fn test_same_seed_same_trace_is_reproducible() {
        // Perfil com moeda de fail: a sequência de decisões do injetor
        // vem toda do RNG seedado, então dois servidores com o mesmo
        // seed e o mesmo trace têm que decidir IGUAL, requisição a
        // requisição.
        let profiles = r#"
  coin:
    default:
      fail: { p: 0.5 }
"#;

        let trace = [
            "READ_TEMP SN0001",
            "SELF_TEST SN0001",
            "READ_TEMP SN0002",
            "SELF_TEST SN0002",
            "READ_TEMP SN0001",
            "SELF_TEST SN0001",
            "READ_TEMP SN0002",
            "SELF_TEST SN0001",
        ];

        let mut outputs: Vec<Vec<String>> = Vec::new();
        for _ in 0..2 {
            let mut cfg = test_config(profiles);
            cfg.default_fault_profile = "coin".to_string();
            let (addr, handle) = spawn_server(cfg).await;
            let mut decisions = Vec::new();
            for req in trace {
                let resp = call(addr, req).await;
                // Campos determinísticos do seed (independentes de
                // relógio de parede): desfecho, código de erro, ciclos,
                // resultado e p_fail do self-test.
                decisions.push(format!(
                    "{}|{:?}|{}|{}|{}",
                    resp.ok,
                    resp.error_code,
                    resp.data["cycles"],
                    resp.data["self_test_ok"],
                    resp.data["p_fail"],
                ));
            }
            handle.signal();
            outputs.push(decisions);
        }

        assert_eq!(outputs[0], outputs[1], "mesmo seed, mesmo trace, mesmas decisões");
    }
}
