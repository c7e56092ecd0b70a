//! Initial datastore contents loaded from a JSON-lines file.
//!
//! One `KvPair` per line; blank lines and lines starting with `#` are skipped.
//! A pair without a value is loaded as a deletion.

use std::path::Path;

use anyhow::Context;
use strata_core::{KvPair, Update, UpdateType};

pub fn load_seed(path: &Path) -> anyhow::Result<Vec<Update>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    parse_seed(&contents).with_context(|| format!("invalid seed file {}", path.display()))
}

pub fn parse_seed(contents: &str) -> anyhow::Result<Vec<Update>> {
    let mut updates = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let kv: KvPair = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a key/value pair", index + 1))?;
        let update_type = if kv.value.is_some() {
            UpdateType::New
        } else {
            UpdateType::Deleted
        };
        updates.push(Update { kv, update_type });
    }
    Ok(updates)
}
