// Dot-file parser: KEY=value files feeding the variable resolver

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::parser::is_valid_var_key;

/// Parse a `.env`-style file into raw key-value pairs. Keys are plain
/// names, not `PIPE_VAR_`-prefixed. Blank lines and `#` comment lines are
/// skipped, an optional `export ` prefix is stripped, and values may be
/// single- or double-quoted. Malformed lines are skipped and reported as
/// warnings.
///
/// A missing file surfaces as `io::ErrorKind::NotFound` so callers can
/// treat it as a silent skip.
pub fn parse_dot_file(path: &Path) -> io::Result<(HashMap<String, String>, Vec<String>)> {
    let data = std::fs::read_to_string(path)?;

    let mut vars = HashMap::new();
    let mut warnings = Vec::new();

    for (i, raw) in data.lines().enumerate() {
        let line_num = i + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            warnings.push(format!(
                "{}:{line_num}: skipping malformed line (missing '='): {line:?}",
                path.display()
            ));
            continue;
        };

        let key = key.trim();
        let value = value.trim();

        if !is_valid_var_key(key) {
            warnings.push(format!(
                "{}:{line_num}: skipping invalid key {key:?}; use only letters, digits, hyphens, and underscores",
                path.display()
            ));
            continue;
        }

        vars.insert(key.to_string(), unquote(value));
    }

    Ok((vars, warnings))
}

/// Strip matching surrounding quotes verbatim; unquoted values lose any
/// trailing `#` comment.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    strip_inline_comment(value)
}

fn strip_inline_comment(value: &str) -> String {
    match value.find('#') {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> (HashMap<String, String>, Vec<String>) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".env");
        std::fs::write(&path, content).unwrap();
        parse_dot_file(&path).unwrap()
    }

    #[test]
    fn basic_pairs() {
        let (vars, warns) = parse("FOO=bar\nBAZ=qux\n");
        assert_eq!(vars.get("FOO").unwrap(), "bar");
        assert_eq!(vars.get("BAZ").unwrap(), "qux");
        assert!(warns.is_empty());
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let (vars, warns) = parse("# leading comment\n\nFOO=bar\n  # indented comment\n");
        assert_eq!(vars.len(), 1);
        assert!(warns.is_empty());
    }

    #[test]
    fn export_prefix_stripped() {
        let (vars, _) = parse("export TOKEN=abc\n");
        assert_eq!(vars.get("TOKEN").unwrap(), "abc");
    }

    #[test]
    fn quoted_values_kept_verbatim() {
        let (vars, _) = parse("A=\"has # hash\"\nB='single # quoted'\n");
        assert_eq!(vars.get("A").unwrap(), "has # hash");
        assert_eq!(vars.get("B").unwrap(), "single # quoted");
    }

    #[test]
    fn unquoted_inline_comment_removed() {
        let (vars, _) = parse("REGION=us-east-1 # default region\n");
        assert_eq!(vars.get("REGION").unwrap(), "us-east-1");
    }

    #[test]
    fn missing_equals_warns_and_skips() {
        let (vars, warns) = parse("JUSTAWORD\nOK=1\n");
        assert_eq!(vars.len(), 1);
        assert_eq!(warns.len(), 1);
        assert!(warns[0].contains("missing '='"));
        assert!(warns[0].contains(":1:"));
    }

    #[test]
    fn invalid_key_warns_and_skips() {
        let (vars, warns) = parse("BAD KEY=1\nGOOD=2\n");
        assert_eq!(vars.len(), 1);
        assert_eq!(warns.len(), 1);
        assert!(warns[0].contains("invalid key"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = parse_dot_file(Path::new("/definitely/not/here/.env")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn value_with_equals_sign_splits_at_first() {
        let (vars, _) = parse("CONN=host=db;port=5432\n");
        assert_eq!(vars.get("CONN").unwrap(), "host=db;port=5432");
    }
}
