//! Skill document discovery and trigger matching.

pub mod loader;
pub mod registry;
pub mod types;

pub use loader::{parse_frontmatter, scan_skills};
pub use registry::SkillRegistry;
pub use types::{SkillDocument, SkillFrontmatter};
