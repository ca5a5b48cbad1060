// Module: Analytics IO
// Lenient replay view of the event log. Readers must accept logs written
// by any schema_version <= the current one, so every field has a default.

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

fn one() -> u32 {
    1
}

/// Visão leniente de um evento para replay: campos ausentes em schemas
/// antigos caem nos defaults em vez de derrubar a análise.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventRow {
    pub sn: String,
    pub batch_id: String,
    pub stage: String,
    pub fw_version: String,
    pub test_step: String,
    pub command: String,
    #[serde(default = "one")]
    pub attempt: u32,
    pub passed: bool,
    pub error_code: Option<String>,
    pub measurement: Option<String>,
    pub value: Option<Value>,
    pub duration_ms: u64,
    pub message: String,
}

/// Lê o `events.jsonl` inteiro. Arquivo ausente = log vazio (replay de
/// um run que nunca emitiu eventos).
pub fn read_events_jsonl(path: &Path) -> Result<Vec<EventRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: EventRow = serde_json::from_str(line)
            .with_context(|| format!("Bad event at {}:{}", path.display(), idx + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_is_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let rows = read_events_jsonl(&dir.path().join("events.jsonl")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_blank_lines_are_skipped_and_defaults_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{{\"sn\":\"SN1\",\"test_step\":\"ping\",\"passed\":true}}").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{{\"sn\":\"SN2\",\"test_step\":\"ping\",\"passed\":false,\"attempt\":2}}").unwrap();

        let rows = read_events_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
        // Campo ausente cai no default: attempt = 1.
        assert_eq!(rows[0].attempt, 1);
        assert_eq!(rows[1].attempt, 2);
        assert!(rows[0].error_code.is_none());
    }
}
