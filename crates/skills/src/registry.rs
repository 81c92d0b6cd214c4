//! Trigger matching over loaded skills.
//!
//! Selection rule when several triggers match one text: longest trigger
//! wins, ties broken by registration (load) order. The resulting ordering
//! is exposed so the manifest can publish it.

use std::path::Path;

use p3394_domain::error::Result;
use p3394_domain::trace::TraceEvent;

use crate::loader::scan_skills;
use crate::types::SkillDocument;

pub struct SkillRegistry {
    skills: Vec<SkillDocument>,
}

impl SkillRegistry {
    pub fn load(skills_root: &Path) -> Result<Self> {
        let skills = scan_skills(skills_root)?;
        tracing::info!(skills = skills.len(), "skill registry loaded");
        Ok(Self { skills })
    }

    pub fn from_documents(skills: Vec<SkillDocument>) -> Self {
        Self { skills }
    }

    pub fn list(&self) -> &[SkillDocument] {
        &self.skills
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SkillDocument> {
        self.skills.iter().find(|s| s.name() == name)
    }

    /// Pick the skill for a free-text message, if any trigger matches a
    /// lowercased substring. Longest trigger first, then load order.
    pub fn select(&self, text: &str) -> Option<(&SkillDocument, &str)> {
        let lowered = text.to_lowercase();
        let mut best: Option<(&SkillDocument, &str)> = None;
        for skill in &self.skills {
            for trigger in &skill.frontmatter.triggers {
                let t = trigger.trim();
                if t.is_empty() || !lowered.contains(&t.to_lowercase()) {
                    continue;
                }
                let better = match best {
                    // Strictly longer wins; equal length keeps the earlier
                    // registration.
                    Some((_, current)) => t.len() > current.len(),
                    None => true,
                };
                if better {
                    best = Some((skill, t));
                }
            }
        }
        if let Some((skill, trigger)) = best {
            TraceEvent::SkillMatched {
                skill_name: skill.name().to_owned(),
                trigger: trigger.to_owned(),
            }
            .emit();
        }
        best
    }

    /// `(trigger, skill_name)` pairs in evaluation order (longest trigger
    /// first, then load order) — published in the manifest.
    pub fn trigger_ordering(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(usize, String, String)> = Vec::new();
        for (index, skill) in self.skills.iter().enumerate() {
            for trigger in &skill.frontmatter.triggers {
                pairs.push((index, trigger.clone(), skill.name().to_owned()));
            }
        }
        pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
        pairs.into_iter().map(|(_, t, n)| (t, n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SkillFrontmatter;
    use std::collections::BTreeMap;

    fn doc(name: &str, triggers: &[&str]) -> SkillDocument {
        SkillDocument {
            frontmatter: SkillFrontmatter {
                name: name.into(),
                description: format!("{name} skill"),
                triggers: triggers.iter().map(|t| t.to_string()).collect(),
                extra: BTreeMap::new(),
            },
            instructions: format!("Instructions for {name}."),
            path: format!("{name}.md").into(),
        }
    }

    #[test]
    fn no_match_returns_none() {
        let registry = SkillRegistry::from_documents(vec![doc("weather", &["weather"])]);
        assert!(registry.select("tell me a joke").is_none());
    }

    #[test]
    fn match_is_case_insensitive_substring() {
        let registry = SkillRegistry::from_documents(vec![doc("weather", &["weather"])]);
        let (skill, trigger) = registry.select("What's the WEATHER like?").unwrap();
        assert_eq!(skill.name(), "weather");
        assert_eq!(trigger, "weather");
    }

    #[test]
    fn longest_trigger_wins() {
        let registry = SkillRegistry::from_documents(vec![
            doc("report", &["report"]),
            doc("weekly", &["weekly report"]),
        ]);
        let (skill, trigger) = registry.select("please build the weekly report").unwrap();
        assert_eq!(skill.name(), "weekly");
        assert_eq!(trigger, "weekly report");
    }

    #[test]
    fn tie_goes_to_first_registered() {
        let registry = SkillRegistry::from_documents(vec![
            doc("alpha", &["status"]),
            doc("beta", &["status"]),
        ]);
        let (skill, _) = registry.select("status please").unwrap();
        assert_eq!(skill.name(), "alpha");
    }

    #[test]
    fn trigger_ordering_is_longest_then_load_order() {
        let registry = SkillRegistry::from_documents(vec![
            doc("alpha", &["status"]),
            doc("weekly", &["weekly report", "report"]),
        ]);
        let ordering = registry.trigger_ordering();
        assert_eq!(ordering[0].0, "weekly report");
        // "status" and "report" are both 6 chars; alpha loaded first.
        assert_eq!(ordering[1], ("status".into(), "alpha".into()));
        assert_eq!(ordering[2], ("report".into(), "weekly".into()));
    }
}
