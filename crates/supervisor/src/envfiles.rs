//! Environment files loaded into worker environments before spawn.

use std::path::Path;

use gantry_core::error::{Error, Result};

/// Load `KEY=VALUE` pairs from the listed files, in order. Later files win
/// on duplicate keys.
pub fn load_env_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<(String, String)>> {
    let mut vars: Vec<(String, String)> = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read env file {}: {e}", path.display()))
        })?;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::config(format!(
                    "malformed line {} in env file {}",
                    lineno + 1,
                    path.display()
                )));
            };
            let key = key.trim().to_owned();
            let value = unquote(value.trim()).to_owned();
            match vars.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => *existing = value,
                None => vars.push((key, value)),
            }
        }
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn env_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_basic_pairs() {
        let file = env_file("A=1\nB=two\n");
        let vars = load_env_files(&[file.path()]).unwrap();
        assert_eq!(
            vars,
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "two".to_owned())
            ]
        );
    }

    #[test]
    fn test_comments_blank_lines_and_export() {
        let file = env_file("# comment\n\nexport TOKEN='secret value'\nURL=\"https://x\"\n");
        let vars = load_env_files(&[file.path()]).unwrap();
        assert_eq!(
            vars,
            vec![
                ("TOKEN".to_owned(), "secret value".to_owned()),
                ("URL".to_owned(), "https://x".to_owned())
            ]
        );
    }

    #[test]
    fn test_later_files_override() {
        let first = env_file("A=1\n");
        let second = env_file("A=2\n");
        let vars = load_env_files(&[first.path(), second.path()]).unwrap();
        assert_eq!(vars, vec![("A".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn test_malformed_line_rejected() {
        let file = env_file("JUSTAKEY\n");
        assert!(load_env_files(&[file.path()]).is_err());
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(load_env_files(&[Path::new("/nonexistent/.env")]).is_err());
    }

    #[test]
    fn test_value_with_equals_sign() {
        let file = env_file("DSN=postgres://u:p@h/db?sslmode=on\n");
        let vars = load_env_files(&[file.path()]).unwrap();
        assert_eq!(vars[0].1, "postgres://u:p@h/db?sslmode=on");
    }
}
