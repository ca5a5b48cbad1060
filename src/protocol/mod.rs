//! # Módulo de Protocolo de Fio (codec de linha)
//!
//! Define o contrato bit-exato entre o runner e o simulador de DUT:
//! requisições ASCII de uma linha, respostas JSON de uma linha.
//!
//! ## Formato da requisição
//!
//! ```text
//! READ_TEMP SN0001\n
//! SET_TEMP SN0001 25.0\n
//! ```
//!
//! Uma linha terminada em `\n`, tokenizada por whitespace. O token de
//! comando é normalizado para MAIÚSCULAS; os argumentos ficam na ordem
//! declarada. Linhas vazias são ignoradas na entrada.
//!
//! ## Formato da resposta
//!
//! Um objeto JSON por linha:
//!
//! ```json
//! {"ok": true, "error_code": null, "message": "", "data": {...}, "meta": {"cmd": "PING"}}
//! ```
//!
//! Invariante: `ok = true` implica `error_code = null`. Em erro,
//! `data = {}` e `error_code` vem da taxonomia congelada de [`ErrorCode`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::ErrorCode;

/// Requisição já tokenizada: comando em maiúsculas + argumentos em ordem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: String,
    pub args: Vec<String>,
}

/// Tokeniza uma linha de requisição.
///
/// Retorna `None` para linhas vazias ou só de whitespace: o servidor
/// as ignora sem responder.
pub fn parse_command(line: &str) -> Option<Request> {
    let mut tokens = line.split_whitespace();
    let cmd = tokens.next()?.to_ascii_uppercase();
    let args: Vec<String> = tokens.map(str::to_string).collect();
    Some(Request { cmd, args })
}

/// Metadados da resposta (hoje só o eco do comando despachado).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub cmd: String,
}

/// Resposta do DUT, serializada como um objeto JSON por linha.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub error_code: Option<ErrorCode>,
    pub message: String,
    pub data: Value,
    pub meta: Meta,
}

impl Response {
    /// Serializa a resposta como linha de fio (JSON + `\n` por conta do
    /// chamador). JSON de structs com esses tipos nunca falha.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Resposta de sucesso com o payload da operação do device.
pub fn ok(data: Value, cmd: &str) -> Response {
    Response {
        ok: true,
        error_code: None,
        message: String::new(),
        data,
        meta: Meta { cmd: cmd.to_string() },
    }
}

/// Resposta de erro. `data` é sempre `{}` em erro, por contrato.
pub fn err(code: ErrorCode, message: impl Into<String>, cmd: &str) -> Response {
    Response {
        ok: false,
        error_code: Some(code),
        message: message.into(),
        data: json!({}),
        meta: Meta { cmd: cmd.to_string() },
    }
}
