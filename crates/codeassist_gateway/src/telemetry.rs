use tracing_subscriber::EnvFilter;

const DEBUG_DIRECTIVE: &str = "codeassist_gateway=debug,codeassist_wire=debug";
const DEFAULT_DIRECTIVE: &str = "warn";

/// Filter directive for the subscriber. The debug toggle wins over `RUST_LOG`.
pub fn filter_directive(debug: bool, rust_log: Option<&str>) -> String {
    if debug {
        return DEBUG_DIRECTIVE.to_string();
    }
    match rust_log.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => DEFAULT_DIRECTIVE.to_string(),
    }
}

/// Install the global subscriber. `log` records from the wire crate are
/// bridged through `tracing-log`.
pub fn init(debug: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(debug, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Short, non-reversible rendering of a secret for log lines
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() {
        format!("{}...", prefix)
    } else {
        "***".to_string()
    }
}
