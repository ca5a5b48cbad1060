// Module: Ids
// Run ids, batch ids and serial-number helpers.

use chrono::Utc;
use rand::Rng;

/// Run id compacto em UTC, que também nomeia o diretório do run.
/// Formato: `YYYYMMDDTHHMMSSZ`.
pub fn run_id_utc() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// SNs determinísticos `SN0001..SN<n>` para quando o operador não passa
/// uma lista explícita.
pub fn default_sns(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("SN{i:04}")).collect()
}

/// SN aleatório para experimentação ad-hoc.
pub fn make_sn(prefix: &str, digits: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..digits)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    format!("{prefix}{suffix}")
}
