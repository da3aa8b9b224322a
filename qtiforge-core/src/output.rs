//! Output tree helpers: `<out>/<Qn>/question.xml` plus run artifacts.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const QUESTION_FILE: &str = "question.xml";

/// Write via a temp file in the same directory and rename over `path`, so a
/// reader never sees a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).with_context(|| format!("creating temp file in {}", dir.display()))?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes())
}

pub fn question_file(root: &Path, question_id: &str) -> PathBuf {
    root.join(question_id).join(QUESTION_FILE)
}

/// Every `<root>/<dir>/question.xml`, sorted by directory name.
pub fn question_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let candidate = entry.path().join(QUESTION_FILE);
        if candidate.is_file() {
            files.push(candidate);
        }
    }
    files.sort();
    Ok(files)
}

/// `Q12` from `<root>/Q12/question.xml`.
pub fn question_id_of(path: &Path) -> Option<&str> {
    path.parent()?.file_name()?.to_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = question_file(dir.path(), "Q1");
        write_atomic(&path, b"<a/>").unwrap();
        write_atomic(&path, b"<b/>").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "<b/>");
        // no temp files left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn lists_question_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["Q2", "Q10", "Q1"] {
            write_atomic(&question_file(dir.path(), id), b"<x/>").unwrap();
        }
        fs::create_dir_all(dir.path().join("unvalidated")).unwrap();
        let files = question_files(dir.path()).unwrap();
        let ids: Vec<&str> = files.iter().filter_map(|p| question_id_of(p)).collect();
        assert_eq!(ids, vec!["Q1", "Q10", "Q2"]);
    }
}
