//! Host configuration, loaded from environment variables at startup.

/// Runtime configuration for the tether host.
///
/// Every field has a default so the host works out-of-the-box without any
/// environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name advertised to peers in `server_info`.
    pub host_name: String,

    /// Model advertised to peers and requested from the engine.
    pub model: String,

    /// TCP address the transport listener binds.
    pub bind_address: String,

    /// Base URL of the Ollama HTTP API.
    pub ollama_url: String,

    /// Maximum number of simultaneously attached peers.
    pub max_clients: usize,

    /// Filesystem path of the control Unix-domain socket. Also serves as
    /// the single-instance lock.
    pub control_socket_path: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,hyper=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host_name: env_or("TETHER_HOST_NAME", "tether"),
            model: env_or("TETHER_MODEL", "llama3"),
            bind_address: env_or("TETHER_BIND", "0.0.0.0:4070"),
            ollama_url: env_or("TETHER_OLLAMA_URL", "http://127.0.0.1:11434"),
            max_clients: parse_env("TETHER_MAX_CLIENTS", 5),
            control_socket_path: env_or("TETHER_CONTROL_SOCKET", "/tmp/tether-control.sock"),
            log_level: env_or("TETHER_LOG", "info"),
            log_json: std::env::var("TETHER_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
