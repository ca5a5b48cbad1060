//! # Módulo de Códigos de Erro (taxonomia congelada)
//!
//! Define os códigos de erro que circulam por TODO o pipeline MTAP:
//! do simulador de DUT, pelo runner, até o log de eventos e as análises.
//!
//! ## Para todos entenderem:
//!
//! Quando um passo de teste falha, o motivo precisa ser rastreável do
//! começo ao fim. Um `E_TIMEOUT` visto no Pareto de falhas é o MESMO
//! `E_TIMEOUT` que o cliente registrou quando o DUT não respondeu.
//!
//! ## Categorias
//!
//! | Faixa        | Códigos                                   | Origem            |
//! |--------------|-------------------------------------------|-------------------|
//! | Protocolo    | E_UNKNOWN_CMD, E_BAD_ARGS, E_OUT_OF_RANGE | servidor DUT      |
//! | Transiente   | E_TIMEOUT, E_BUSY                         | servidor / client |
//! | Fault        | E_INTERNAL                                | injetor de faults |
//! | Runner       | LIMIT_FAIL, E_BAD_RESP, E_CLIENT          | runner/client     |
//!
//! A taxonomia é CONGELADA: códigos nunca mudam de nome nem de sentido.
//! Novos códigos só entram acompanhados de um bump de `schema_version`
//! no log de eventos.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Código de erro simbólico, estável no protocolo e no log de eventos.
///
/// Serializa como a string congelada (ex.: `"E_TIMEOUT"`), nunca como
/// índice numérico: o log de eventos é lido por ferramentas externas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Comando não pertence ao conjunto congelado do protocolo.
    #[serde(rename = "E_UNKNOWN_CMD")]
    UnknownCmd,

    /// Aridade ou formato de argumento inválido na linha de requisição.
    #[serde(rename = "E_BAD_ARGS")]
    BadArgs,

    /// O DUT não respondeu dentro do timeout do passo (lado cliente),
    /// ou o injetor simulou um estouro de tempo (lado servidor).
    #[serde(rename = "E_TIMEOUT")]
    Timeout,

    /// Falha interna sintética, sorteada pelo injetor de faults.
    #[serde(rename = "E_INTERNAL")]
    Internal,

    /// Valor fora da faixa física aceita (ex.: SET_TEMP fora de [-40, 125]).
    #[serde(rename = "E_OUT_OF_RANGE")]
    OutOfRange,

    /// DUT ocupado: rate-limit determinístico ou contenção probabilística.
    #[serde(rename = "E_BUSY")]
    Busy,

    /// Medição fora dos limites do plano. Sintetizado pelo runner,
    /// nunca emitido pelo DUT.
    #[serde(rename = "LIMIT_FAIL")]
    LimitFail,

    /// Resposta do DUT não parseável como JSON. Sintetizado pelo client.
    #[serde(rename = "E_BAD_RESP")]
    BadResp,

    /// Qualquer outra falha de transporte no client (conexão recusada,
    /// reset, etc.).
    #[serde(rename = "E_CLIENT")]
    Client,
}

impl ErrorCode {
    /// Forma congelada do código, como circula no protocolo e no log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownCmd => "E_UNKNOWN_CMD",
            ErrorCode::BadArgs => "E_BAD_ARGS",
            ErrorCode::Timeout => "E_TIMEOUT",
            ErrorCode::Internal => "E_INTERNAL",
            ErrorCode::OutOfRange => "E_OUT_OF_RANGE",
            ErrorCode::Busy => "E_BUSY",
            ErrorCode::LimitFail => "LIMIT_FAIL",
            ErrorCode::BadResp => "E_BAD_RESP",
            ErrorCode::Client => "E_CLIENT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
