use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Invalid table header: {0}")]
    Header(#[from] toml::de::Error),
    #[error("Table header cannot be written: {0}")]
    HeaderWrite(#[from] toml::ser::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Element '{element}' not found in {table} table")]
    MissingElement { table: &'static str, element: String },
    #[error("Table has no rows")]
    Empty,
}

/// Maps element names to their first row.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameIndex(HashMap<String, usize>);

impl NameIndex {
    pub(crate) fn build<'a>(names: impl Iterator<Item = &'a str>) -> Self {
        let mut index = HashMap::new();
        for (i, name) in names.enumerate() {
            index.entry(name.to_string()).or_insert(i);
        }
        Self(index)
    }

    pub(crate) fn get(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }
}

/// Splits a CSV document whose leading `#` lines hold `key = value` summary pairs.
/// Returns the summary as a TOML document and the remaining CSV body.
pub(crate) fn split_commented_header(content: &str) -> (String, String) {
    let mut header = String::new();
    let mut body = String::new();
    for line in content.lines() {
        match line.trim_start().strip_prefix('#') {
            Some(rest) => {
                header.push_str(rest.trim());
                header.push('\n');
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    (header, body)
}

/// Writes each line of a TOML document as a `# key = value` comment.
pub(crate) fn write_commented_header(writer: &mut impl Write, header: &str) -> Result<(), TableError> {
    for line in header.lines().filter(|l| !l.trim().is_empty()) {
        writeln!(writer, "# {}", line).map_err(|e| TableError::Io {
            path: "<writer>".to_string(),
            source: e,
        })?;
    }
    Ok(())
}

pub(crate) fn create_file(path: &Path) -> Result<File, TableError> {
    File::create(path).map_err(|e| TableError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

pub(crate) fn read_file(path: &Path) -> Result<String, TableError> {
    std::fs::read_to_string(path).map_err(|e| TableError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_index_keeps_first_occurrence() {
        let index = NameIndex::build(["a", "b", "a"].into_iter());
        assert_eq!(index.get("a"), Some(0));
        assert_eq!(index.get("b"), Some(1));
        assert_eq!(index.get("c"), None);
    }

    #[test]
    fn commented_header_is_split_from_body() {
        let (header, body) = split_commented_header("# qx = 62.31\n# qy = 60.32\nname,s\nip1,0.0\n");
        assert_eq!(header, "qx = 62.31\nqy = 60.32\n");
        assert_eq!(body, "name,s\nip1,0.0\n");
    }

    #[test]
    fn written_header_splits_back_to_the_same_document() {
        let mut out = Vec::new();
        write_commented_header(&mut out, "qx = 62.31\n\nzeta0 = -0.001\n").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "# qx = 62.31\n# zeta0 = -0.001\n");
        let (header, body) = split_commented_header(&text);
        assert_eq!(header, "qx = 62.31\nzeta0 = -0.001\n");
        assert!(body.is_empty());
    }
}
