//! # Client do DUT
//!
//! Uma conexão TCP NOVA por chamada (sem pooling): envia uma linha, lê
//! até o `\n`, parseia o JSON. O timeout cobre conexão + envio +
//! recepção, e é por passo do plano.
//!
//! O client nunca interpreta semântica: só transporta. Os modos de
//! falha que ele sintetiza são os três últimos da taxonomia:
//!
//! - timeout de leitura (ou peer fechando sem linha completa) → `E_TIMEOUT`
//! - resposta não-JSON → `E_BAD_RESP`
//! - qualquer outro erro de transporte → `E_CLIENT`
//!
//! O transporte fica atrás do trait [`DutTransport`] para o loop de
//! retry do runner ser testável com transportes roteirizados, sem
//! servidor de verdade.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::errors::ErrorCode;

/// Resultado de uma chamada, do jeito que o runner consome.
///
/// `raw` carrega a resposta inteira para replay no log de eventos.
#[derive(Debug, Clone)]
pub struct ClientResult {
    pub ok: bool,
    pub error_code: Option<String>,
    pub message: String,
    pub data: Value,
    pub raw: Value,
}

impl ClientResult {
    fn transport_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: Some(code.as_str().to_string()),
            message: message.into(),
            data: json!({}),
            raw: json!({}),
        }
    }

    fn from_raw_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(raw) => Self {
                ok: raw["ok"].as_bool().unwrap_or(false),
                error_code: raw["error_code"].as_str().map(str::to_string),
                message: raw["message"].as_str().unwrap_or("").to_string(),
                data: if raw["data"].is_null() { json!({}) } else { raw["data"].clone() },
                raw,
            },
            Err(e) => Self::transport_error(ErrorCode::BadResp, e.to_string()),
        }
    }
}

/// Seam de transporte entre runner e fio.
#[async_trait]
pub trait DutTransport: Send + Sync {
    /// Envia uma linha crua e devolve o resultado já classificado.
    async fn call_line(&self, line: &str, timeout: Duration) -> ClientResult;
}

/// Transporte real: TCP de vida curta, uma conexão por chamada.
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ida e volta completa. `Ok(None)` = peer fechou sem uma linha
    /// completa, tratado como sem-resposta (timeout) pelo chamador.
    async fn round_trip(&self, line: &str) -> std::io::Result<Option<String>> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let payload = format!("{}\n", line.trim_end_matches('\n'));
        stream.write_all(payload.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        let n = reader.read_line(&mut buf).await?;
        if n == 0 || !buf.ends_with('\n') {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

#[async_trait]
impl DutTransport for TcpTransport {
    async fn call_line(&self, line: &str, timeout: Duration) -> ClientResult {
        match tokio::time::timeout(timeout, self.round_trip(line)).await {
            Err(_elapsed) => ClientResult::transport_error(ErrorCode::Timeout, "Client timeout"),
            Ok(Ok(None)) => ClientResult::transport_error(
                ErrorCode::Timeout,
                "No complete response line from DUT",
            ),
            Ok(Ok(Some(raw_line))) => ClientResult::from_raw_line(raw_line.trim_end()),
            Ok(Err(e)) => ClientResult::transport_error(ErrorCode::Client, e.to_string()),
        }
    }
}

/// Client de alto nível usado pelo runner.
pub struct DutClient {
    transport: Arc<dyn DutTransport>,
    /// Timeout default em segundos; passos do plano sobrescrevem por
    /// chamada.
    pub timeout_s: f64,
}

impl DutClient {
    pub fn tcp(host: impl Into<String>, port: u16, timeout_s: f64) -> Self {
        Self {
            transport: Arc::new(TcpTransport::new(host, port)),
            timeout_s,
        }
    }

    /// Injeta um transporte alternativo (testes do runner usam
    /// transportes roteirizados).
    pub fn with_transport(transport: Arc<dyn DutTransport>, timeout_s: f64) -> Self {
        Self {
            transport,
            timeout_s,
        }
    }

    pub async fn call_line(&self, line: &str, timeout_s: Option<f64>) -> ClientResult {
        let t = timeout_s.unwrap_or(self.timeout_s).max(0.001);
        self.transport
            .call_line(line, Duration::from_secs_f64(t))
            .await
    }

    /// Monta `CMD arg1 arg2 ...` e chama.
    pub async fn call(&self, cmd: &str, args: &[&str], timeout_s: Option<f64>) -> ClientResult {
        let mut line = cmd.to_string();
        for a in args {
            line.push(' ');
            line.push_str(a);
        }
        self.call_line(line.trim(), timeout_s).await
    }
}
