//! Filesystem corpus: glob discovery and buffered JSONL reading.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::SourceError;

/// Expand a glob pattern into a sorted list of existing files.
pub fn discover(pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let paths = glob::glob(pattern)
        .map_err(|e| SourceError::InvalidLocation(format!("bad glob '{pattern}': {e}")))?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("unreadable path while expanding '{}': {}", pattern, e),
        }
    }
    files.sort();
    Ok(files)
}

/// Open a JSONL file as a lazy line iterator.
pub fn read_lines(
    path: &Path,
) -> Result<impl Iterator<Item = std::io::Result<String>>, SourceError> {
    let file = File::open(path)
        .map_err(|e| SourceError::OpenError(format!("{}: {}", path.display(), e)))?;
    Ok(BufReader::new(file).lines())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discovers_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("partition=0")).unwrap();
        std::fs::write(root.join("partition=0/a.jsonl"), "{}\n").unwrap();
        std::fs::write(root.join("partition=0/b.txt"), "nope").unwrap();

        let pattern = format!("{}/partition=*/*.jsonl", root.display());
        let files = discover(&pattern).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.jsonl"));
    }

    #[test]
    fn empty_glob_is_ok_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/missing/*.jsonl", dir.path().display());
        assert!(discover(&pattern).unwrap().is_empty());
    }

    #[test]
    fn read_lines_streams_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{{\"url\": \"http://a\"}}").unwrap();
        writeln!(f, "{{\"url\": \"http://b\"}}").unwrap();

        let lines: Vec<String> = read_lines(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        assert!(read_lines(Path::new("/nonexistent/x.jsonl")).is_err());
    }
}
