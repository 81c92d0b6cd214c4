//! KSTAR export/import bundles.
//!
//! A bundle is a single JSON document with the agent's memory arrays, basic
//! statistics, and a SHA-256 integrity checksum over the memory payload.
//! Control tokens are excluded unless explicitly requested. Import merges
//! by record id by default; `replace` truncates each family first and is
//! only honored when the caller supplies the bundle's checksum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use p3394_domain::error::{Error, Result};

use crate::store::{Family, KstarStore};

pub const BUNDLE_FORMAT: &str = "kstar-bundle";
pub const BUNDLE_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bundle shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleMemory {
    #[serde(default)]
    pub traces: Vec<Value>,
    #[serde(default)]
    pub perceptions: Vec<Value>,
    #[serde(default)]
    pub facts: Vec<Value>,
    #[serde(default)]
    pub skills: Vec<Value>,
    #[serde(default)]
    pub tokens: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleStatistics {
    pub traces: usize,
    pub perceptions: usize,
    pub facts: usize,
    pub skills: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub agent: Map<String, Value>,
    pub memory: BundleMemory,
    pub statistics: BundleStatistics,
    /// SHA-256 (hex) over the canonical JSON of `memory`.
    pub integrity: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub include_tokens: bool,
    /// Agent identity metadata stamped into the bundle.
    pub agent: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub replace: bool,
    /// Required when `replace` is set; must equal the bundle's integrity.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportResult {
    pub added: BundleStatistics,
    pub skipped: usize,
    pub replaced: bool,
}

fn memory_checksum(memory: &BundleMemory) -> Result<String> {
    let canonical = serde_json::to_vec(memory)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn record_id(value: &Value) -> Option<&str> {
    value
        .get("id")
        .or_else(|| value.get("token_id"))
        .and_then(Value::as_str)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Export / import
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl KstarStore {
    pub fn export_bundle(&self, options: &ExportOptions) -> Result<Bundle> {
        let memory = BundleMemory {
            traces: self.read_family_values(Family::Traces)?,
            perceptions: self.read_family_values(Family::Perceptions)?,
            facts: self.read_family_values(Family::Facts)?,
            skills: self.read_family_values(Family::Skills)?,
            tokens: if options.include_tokens {
                self.read_family_values(Family::Tokens)?
            } else {
                Vec::new()
            },
        };
        let statistics = BundleStatistics {
            traces: memory.traces.len(),
            perceptions: memory.perceptions.len(),
            facts: memory.facts.len(),
            skills: memory.skills.len(),
            tokens: memory.tokens.len(),
        };
        let integrity = memory_checksum(&memory)?;
        Ok(Bundle {
            format: BUNDLE_FORMAT.into(),
            version: BUNDLE_VERSION,
            exported_at: Utc::now(),
            agent: options.agent.clone(),
            memory,
            statistics,
            integrity,
        })
    }

    pub fn import_bundle(&self, bundle: &Bundle, options: &ImportOptions) -> Result<ImportResult> {
        if bundle.format != BUNDLE_FORMAT {
            return Err(Error::Config(format!(
                "not a kstar bundle: format={}",
                bundle.format
            )));
        }
        let computed = memory_checksum(&bundle.memory)?;
        if computed != bundle.integrity {
            return Err(Error::Config("bundle integrity checksum mismatch".into()));
        }
        if options.replace {
            match options.checksum.as_deref() {
                Some(checksum) if checksum == bundle.integrity => {}
                _ => {
                    return Err(Error::Config(
                        "replace import requires the matching bundle checksum".into(),
                    ))
                }
            }
        }

        let mut result = ImportResult {
            replaced: options.replace,
            ..Default::default()
        };

        let families = [
            (Family::Traces, &bundle.memory.traces),
            (Family::Perceptions, &bundle.memory.perceptions),
            (Family::Facts, &bundle.memory.facts),
            (Family::Skills, &bundle.memory.skills),
            (Family::Tokens, &bundle.memory.tokens),
        ];

        for (family, incoming) in families {
            let added = if options.replace {
                self.replace_family(family, incoming)?;
                incoming.len()
            } else {
                // Merge: skip records whose id already exists.
                let existing: std::collections::HashSet<String> = self
                    .read_family_values(family)?
                    .iter()
                    .filter_map(|v| record_id(v).map(str::to_owned))
                    .collect();
                let mut added = 0usize;
                for value in incoming {
                    match record_id(value) {
                        Some(id) if existing.contains(id) => result.skipped += 1,
                        _ => {
                            self.append_value(family, value)?;
                            added += 1;
                        }
                    }
                }
                added
            };
            match family {
                Family::Traces => result.added.traces = added,
                Family::Perceptions => result.added.perceptions = added,
                Family::Facts => result.added.facts = added,
                Family::Skills => result.added.skills = added,
                Family::Tokens => result.added.tokens = added,
            }
        }

        // Token records may have changed on disk.
        self.rebuild_token_index()?;
        Ok(result)
    }

    /// Write a bundle to `{storage}/export/{timestamp}.kstar`.
    pub fn write_bundle_file(
        &self,
        storage_root: &std::path::Path,
        bundle: &Bundle,
    ) -> Result<std::path::PathBuf> {
        let dir = storage_root.join("export");
        std::fs::create_dir_all(&dir)?;
        let name = format!("{}.kstar", bundle.exported_at.format("%Y%m%dT%H%M%SZ"));
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(bundle)?)?;
        Ok(path)
    }
}
