//! Skill discovery: scan a skills directory for markdown documents with
//! YAML frontmatter. A missing directory is a warning, not a failure.

use std::path::Path;

use p3394_domain::error::{Error, Result};

use crate::types::{SkillDocument, SkillFrontmatter};

/// Split a document into `(frontmatter, body)`. Returns `None` when there
/// is no frontmatter block.
pub fn parse_frontmatter(content: &str) -> Option<(SkillFrontmatter, String)> {
    let rest = content.strip_prefix("---")?;
    // The opening delimiter must be a line of its own.
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['-']).trim_start();

    match serde_yaml::from_str::<SkillFrontmatter>(yaml) {
        Ok(frontmatter) => Some((frontmatter, body.to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "skipping document with invalid frontmatter");
            None
        }
    }
}

fn load_document(path: &Path) -> Result<Option<SkillDocument>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_frontmatter(&content).map(|(frontmatter, instructions)| SkillDocument {
        frontmatter,
        instructions,
        path: path.to_path_buf(),
    }))
}

/// Scan the skills root for `*.md` documents (directly, or a `SKILL.md`
/// one level down), sorted by name.
pub fn scan_skills(skills_root: &Path) -> Result<Vec<SkillDocument>> {
    let mut documents = Vec::new();
    if !skills_root.exists() {
        tracing::warn!(
            path = %skills_root.display(),
            "skills directory does not exist — continuing without skills"
        );
        return Ok(documents);
    }

    for entry in std::fs::read_dir(skills_root)? {
        let entry = entry?;
        let path = entry.path();

        let doc_path = if path.is_dir() {
            let nested = path.join("SKILL.md");
            if !nested.is_file() {
                continue;
            }
            nested
        } else if path.extension().map(|e| e == "md").unwrap_or(false) {
            path
        } else {
            continue;
        };

        match load_document(&doc_path) {
            Ok(Some(doc)) => {
                tracing::debug!(skill = %doc.name(), path = %doc_path.display(), "skill loaded");
                documents.push(doc);
            }
            Ok(None) => {
                tracing::debug!(path = %doc_path.display(), "no frontmatter — not a skill document");
            }
            Err(Error::Io(e)) => {
                tracing::warn!(path = %doc_path.display(), error = %e, "skipping unreadable skill document");
            }
            Err(e) => return Err(e),
        }
    }

    documents.sort_by(|a, b| a.frontmatter.name.cmp(&b.frontmatter.name));
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\nname: weekly-report\ndescription: Build the weekly report\ntriggers:\n  - weekly report\n  - status update\nauthor: someone\n---\n\nCollect the numbers, then summarize them.\n";

    #[test]
    fn parses_frontmatter_and_body() {
        let (fm, body) = parse_frontmatter(DOC).unwrap();
        assert_eq!(fm.name, "weekly-report");
        assert_eq!(fm.triggers.len(), 2);
        // Unknown fields preserved.
        assert!(fm.extra.contains_key("author"));
        assert!(body.starts_with("Collect the numbers"));
    }

    #[test]
    fn document_without_frontmatter_is_skipped() {
        assert!(parse_frontmatter("# Just a readme\n").is_none());
    }

    #[test]
    fn missing_directory_is_a_warning_not_an_error() {
        let skills = scan_skills(Path::new("/definitely/not/here")).unwrap();
        assert!(skills.is_empty());
    }

    #[test]
    fn scans_flat_files_and_skill_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), DOC).unwrap();
        let sub = dir.path().join("weather");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(
            sub.join("SKILL.md"),
            "---\nname: weather\ndescription: Weather lookups\ntriggers: [weather]\n---\nLook it up.\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a skill").unwrap();

        let skills = scan_skills(dir.path()).unwrap();
        let names: Vec<_> = skills.iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, vec!["weather", "weekly-report"]);
    }
}
