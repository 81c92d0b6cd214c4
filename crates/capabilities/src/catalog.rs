//! Capability catalog: the persisted, classified view over the registry.
//!
//! Every descriptor is wrapped with a source tag, a power level, and a
//! cognitive pattern. At startup the catalog reconciles what the running
//! system discovered (built-ins, skills, transports, SDK tools) against what
//! long-term memory remembers, keeping orphaned entries for audit but
//! disabling them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use p3394_domain::error::Result;
use p3394_domain::trace::TraceEvent;

use crate::descriptor::CapabilityDescriptor;
use crate::registry::{CapabilityFilter, CapabilityRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Builtin,
    Sdk,
    Skill,
    Config,
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerLevel {
    Standard,
    /// May invoke other capabilities.
    Meta,
    /// Mutates agent state or configuration.
    SelfModifying,
    /// Factory-essential; required to boot.
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CognitivePattern {
    Execution,
    Procedural,
    Iterative,
    Diagnostic,
    Generative,
    Orchestration,
    Reflective,
}

/// Power level from the capability id prefix, unless overridden.
pub fn classify_power(d: &CapabilityDescriptor) -> PowerLevel {
    if let Some(level) = d.power_level {
        return level;
    }
    let id = d.capability_id.as_str();
    if id.starts_with("boot.") {
        PowerLevel::Bootstrap
    } else if id.starts_with("cap.") || id.starts_with("config.") {
        PowerLevel::SelfModifying
    } else if id.starts_with("task.") || id.starts_with("agent.") || id.starts_with("skill.") {
        PowerLevel::Meta
    } else {
        PowerLevel::Standard
    }
}

/// Cognitive pattern from the capability id prefix, unless overridden.
pub fn classify_pattern(d: &CapabilityDescriptor) -> CognitivePattern {
    if let Some(pattern) = d.cognitive_pattern {
        return pattern;
    }
    let id = d.capability_id.as_str();
    if id.starts_with("skill.") {
        CognitivePattern::Procedural
    } else if id.starts_with("diag.") {
        CognitivePattern::Diagnostic
    } else if id.starts_with("llm.") || id.starts_with("gen.") {
        CognitivePattern::Generative
    } else if id.starts_with("task.") || id.starts_with("agent.") {
        CognitivePattern::Orchestration
    } else if id.starts_with("kstar:") || id.starts_with("memory.") {
        CognitivePattern::Reflective
    } else if id.starts_with("loop.") || id.starts_with("iter.") {
        CognitivePattern::Iterative
    } else {
        CognitivePattern::Execution
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub descriptor: CapabilityDescriptor,
    pub source: SourceTag,
    pub power_level: PowerLevel,
    pub cognitive_pattern: CognitivePattern,
    /// Present in the running system's registry.
    pub in_system: bool,
    /// Present in persisted long-term memory.
    pub in_memory: bool,
}

impl CatalogEntry {
    pub fn discovered(descriptor: CapabilityDescriptor, source: SourceTag) -> Self {
        let power_level = classify_power(&descriptor);
        let cognitive_pattern = classify_pattern(&descriptor);
        Self {
            descriptor,
            source,
            power_level,
            cognitive_pattern,
            in_system: true,
            in_memory: false,
        }
    }

    /// Standard power level and enabled — what untrusted clients may see.
    pub fn safe_for_client(&self) -> bool {
        self.power_level == PowerLevel::Standard && self.descriptor.enabled()
    }

    /// Everything except plain execution capabilities.
    pub fn methodological_only(&self) -> bool {
        self.cognitive_pattern != CognitivePattern::Execution
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub in_both: Vec<String>,
    pub only_system: Vec<String>,
    pub only_memory: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CapabilityCatalog {
    path: PathBuf,
    entries: RwLock<HashMap<String, CatalogEntry>>,
}

impl CapabilityCatalog {
    /// Load persisted entries from `{storage}/ltm/capabilities/catalog.json`.
    pub fn load(storage_root: &Path) -> Result<Self> {
        let dir = storage_root.join("ltm").join("capabilities");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("catalog.json");

        let entries: HashMap<String, CatalogEntry> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        tracing::info!(entries = entries.len(), "capability catalog loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Merge system-discovered capabilities with persisted memory.
    ///
    /// New system capabilities are added to memory; entries only memory
    /// remembers are kept for audit but disabled. Everything discovered is
    /// also registered in `registry` (idempotently — discovery may have
    /// registered some already).
    pub fn reconcile(
        &self,
        registry: &CapabilityRegistry,
        discovered: Vec<(CapabilityDescriptor, SourceTag)>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        {
            let mut entries = self.entries.write();

            let mut seen = std::collections::HashSet::new();
            for (descriptor, source) in discovered {
                let id = descriptor.capability_id.clone();
                seen.insert(id.clone());

                if !registry.contains(&id) {
                    registry.register(descriptor.clone())?;
                }

                match entries.get_mut(&id) {
                    Some(entry) => {
                        entry.descriptor = descriptor;
                        entry.source = source;
                        entry.power_level = classify_power(&entry.descriptor);
                        entry.cognitive_pattern = classify_pattern(&entry.descriptor);
                        entry.in_system = true;
                        entry.in_memory = true;
                        report.in_both.push(id);
                    }
                    None => {
                        let mut entry = CatalogEntry::discovered(descriptor, source);
                        entry.in_memory = true; // persisted below
                        entries.insert(id.clone(), entry);
                        report.only_system.push(id);
                    }
                }
            }

            // Orphans: memory remembers them, the system no longer does.
            for (id, entry) in entries.iter_mut() {
                if !seen.contains(id) {
                    entry.in_system = false;
                    entry.descriptor.status.enabled = false;
                    report.only_memory.push(id.clone());
                }
            }
        }
        self.flush()?;

        TraceEvent::CatalogReconciled {
            in_both: report.in_both.len(),
            only_system: report.only_system.len(),
            only_memory: report.only_memory.len(),
        }
        .emit();
        Ok(report)
    }

    pub fn get(&self, id: &str) -> Option<CatalogEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        let mut list: Vec<_> = self.entries.read().values().cloned().collect();
        list.sort_by(|a, b| a.descriptor.capability_id.cmp(&b.descriptor.capability_id));
        list
    }

    /// Descriptor-level filter applied over catalog entries.
    pub fn query(&self, filter: &CapabilityFilter) -> Vec<CatalogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| filter.matches(&e.descriptor))
            .collect()
    }

    pub fn safe_for_client(&self) -> Vec<CatalogEntry> {
        self.entries()
            .into_iter()
            .filter(CatalogEntry::safe_for_client)
            .collect()
    }

    pub fn methodological_only(&self) -> Vec<CatalogEntry> {
        self.entries()
            .into_iter()
            .filter(CatalogEntry::methodological_only)
            .collect()
    }

    fn flush(&self) -> Result<()> {
        let entries = self.entries.read();
        std::fs::write(&self.path, serde_json::to_string_pretty(&*entries)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Substrate;

    fn cap(id: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::atomic(id, id, Substrate::Symbolic)
    }

    #[test]
    fn power_classification_by_prefix() {
        assert_eq!(classify_power(&cap("boot.init")), PowerLevel::Bootstrap);
        assert_eq!(classify_power(&cap("cap.configure")), PowerLevel::SelfModifying);
        assert_eq!(classify_power(&cap("task.delegate")), PowerLevel::Meta);
        assert_eq!(classify_power(&cap("cmd.version")), PowerLevel::Standard);
    }

    #[test]
    fn pattern_classification_by_prefix() {
        assert_eq!(classify_pattern(&cap("skill.report")), CognitivePattern::Procedural);
        assert_eq!(classify_pattern(&cap("kstar:store_trace")), CognitivePattern::Reflective);
        assert_eq!(classify_pattern(&cap("llm.chat")), CognitivePattern::Generative);
        assert_eq!(classify_pattern(&cap("cmd.help")), CognitivePattern::Execution);
    }

    #[test]
    fn descriptor_override_beats_prefix() {
        let mut d = cap("cmd.special");
        d.power_level = Some(PowerLevel::Bootstrap);
        d.cognitive_pattern = Some(CognitivePattern::Reflective);
        assert_eq!(classify_power(&d), PowerLevel::Bootstrap);
        assert_eq!(classify_pattern(&d), CognitivePattern::Reflective);
    }

    #[test]
    fn reconcile_sorts_into_three_sets() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::new();

        // First boot: two capabilities discovered.
        let catalog = CapabilityCatalog::load(dir.path()).unwrap();
        let report = catalog
            .reconcile(
                &registry,
                vec![
                    (cap("cmd.version"), SourceTag::Builtin),
                    (cap("skill.report"), SourceTag::Skill),
                ],
            )
            .unwrap();
        assert_eq!(report.only_system.len(), 2);
        assert!(report.in_both.is_empty());

        // Second boot: skill.report gone, cmd.status new.
        let registry2 = CapabilityRegistry::new();
        let catalog2 = CapabilityCatalog::load(dir.path()).unwrap();
        let report = catalog2
            .reconcile(
                &registry2,
                vec![
                    (cap("cmd.version"), SourceTag::Builtin),
                    (cap("cmd.status"), SourceTag::Builtin),
                ],
            )
            .unwrap();
        assert_eq!(report.in_both, vec!["cmd.version"]);
        assert_eq!(report.only_system, vec!["cmd.status"]);
        assert_eq!(report.only_memory, vec!["skill.report"]);

        // Orphan kept for audit, disabled, not in the live registry.
        let orphan = catalog2.get("skill.report").unwrap();
        assert!(!orphan.in_system);
        assert!(!orphan.descriptor.enabled());
        assert!(registry2.get("skill.report").is_none());
    }

    #[test]
    fn reconcile_registers_discovered_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::new();
        let catalog = CapabilityCatalog::load(dir.path()).unwrap();
        catalog
            .reconcile(&registry, vec![(cap("cmd.about"), SourceTag::Builtin)])
            .unwrap();
        assert!(registry.get("cmd.about").is_some());
    }

    #[test]
    fn safe_for_client_excludes_meta_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::new();
        let catalog = CapabilityCatalog::load(dir.path()).unwrap();

        let mut disabled = cap("cmd.hidden");
        disabled.status.enabled = false;
        catalog
            .reconcile(
                &registry,
                vec![
                    (cap("cmd.version"), SourceTag::Builtin),
                    (cap("task.delegate"), SourceTag::Builtin),
                    (disabled, SourceTag::Builtin),
                ],
            )
            .unwrap();

        let safe: Vec<_> = catalog
            .safe_for_client()
            .into_iter()
            .map(|e| e.descriptor.capability_id)
            .collect();
        assert_eq!(safe, vec!["cmd.version"]);
    }

    #[test]
    fn methodological_excludes_plain_execution() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CapabilityRegistry::new();
        let catalog = CapabilityCatalog::load(dir.path()).unwrap();
        catalog
            .reconcile(
                &registry,
                vec![
                    (cap("cmd.version"), SourceTag::Builtin),
                    (cap("skill.report"), SourceTag::Skill),
                ],
            )
            .unwrap();
        let methodological: Vec<_> = catalog
            .methodological_only()
            .into_iter()
            .map(|e| e.descriptor.capability_id)
            .collect();
        assert_eq!(methodological, vec!["skill.report"]);
    }
}
