//! Evaluation job output parsing.

/// Errors from interpreting job output as a replica count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("job output is not valid UTF-8")]
    NotUtf8,

    #[error("job output {output:?} is not a 32-bit integer: {reason}")]
    NotInteger { output: String, reason: String },
}

/// Parse trimmed output as a base-10 `i32`.
pub fn parse_replicas(raw: &[u8]) -> Result<i32, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::NotUtf8)?;
    let trimmed = text.trim();
    trimmed.parse::<i32>().map_err(|e| ParseError::NotInteger {
        output: trimmed.to_string(),
        reason: e.to_string(),
    })
}

/// Last non-empty line of `raw`, or all of `raw` if it has none.
pub fn last_line(raw: &[u8]) -> &[u8] {
    raw.split(|b| *b == b'\n')
        .rev()
        .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .unwrap_or(raw)
}
