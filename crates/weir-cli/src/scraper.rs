use serde::Serialize;
use weir_core::{AppError, Scraper};

/// A `name=value` entry read from a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub line: usize,
    pub name: String,
    pub value: String,
}

/// File-backed capability: keys are paths, rows are `name=value` lines.
///
/// Blank lines and `#` comments are not rows. Lines without `=` or with an
/// empty name fail to normalize and are skipped by the runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineScraper;

impl Scraper for LineScraper {
    type Payload = String;
    type RawRow = (usize, String);
    type Row = Entry;

    async fn fetch(&self, key: &str) -> Result<String, AppError> {
        tokio::fs::read_to_string(key)
            .await
            .map_err(|e| AppError::Fetch {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    fn extract(&self, payload: String) -> Result<Vec<(usize, String)>, AppError> {
        if payload.contains('\0') {
            return Err(AppError::Generic("binary content".into()));
        }
        Ok(payload
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(i, line)| (i, line.to_string()))
            .collect())
    }

    fn normalize(&self, (line, raw): (usize, String)) -> Result<Entry, AppError> {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| AppError::Generic(format!("line {line}: expected name=value")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Generic(format!("line {line}: empty name")));
        }
        Ok(Entry {
            line,
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }
}
