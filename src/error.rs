use thiserror::Error;

/// Failures inside the render engine. On the primary routing path these are
/// swallowed and downgraded to the static fallback; only the auxiliary
/// `/render` endpoint surfaces them to the caller.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("render capacity reached ({0} active)")]
    AtCapacity(usize),

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("navigation timed out after {0}ms")]
    NavigationTimeout(u64),

    #[error("page setup failed: {0}")]
    PageSetup(String),

    #[error("content extraction failed: {0}")]
    ContentExtraction(String),
}

/// Cache read/write/parse failures. Never fatal: readers downgrade these to
/// a miss, writers log and move on.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache metadata parse error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("cache directory unavailable: {0}")]
    Directory(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_display_reason() {
        let err = RenderError::NavigationTimeout(20_000);
        assert!(err.to_string().contains("20000"));
        let err = RenderError::LaunchFailed("no chrome".into());
        assert!(err.to_string().contains("no chrome"));
        let err = RenderError::AtCapacity(10);
        assert!(err.to_string().contains("10 active"));
    }
}
