//! Skill documents — natural-language procedures with YAML frontmatter.
//!
//! The frontmatter block is delimited by `---` on lines of their own and
//! carries at minimum `name`, `description`, and `triggers`. Unknown fields
//! are preserved but ignored by the core. The remainder of the document is
//! the instruction body prepended to the LLM prompt when the skill fires.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFrontmatter {
    pub name: String,
    pub description: String,
    /// Lowercased-substring triggers matched against inbound text.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Unknown frontmatter fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone)]
pub struct SkillDocument {
    pub frontmatter: SkillFrontmatter,
    /// Instruction body (everything after the frontmatter).
    pub instructions: String,
    pub path: PathBuf,
}

impl SkillDocument {
    pub fn name(&self) -> &str {
        &self.frontmatter.name
    }

    /// The capability id this skill registers under.
    pub fn capability_id(&self) -> String {
        format!("skill.{}", self.frontmatter.name)
    }

    pub fn render_index_line(&self) -> String {
        format!(
            "- {}: {} triggers={}",
            self.frontmatter.name,
            self.frontmatter.description,
            self.frontmatter.triggers.join(",")
        )
    }
}
