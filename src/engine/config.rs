use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub workspace_root: PathBuf,
    pub interpreter: InterpreterConfig,
    pub default_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub max_concurrent_runs: usize,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub submissions_dir: PathBuf,
    pub store_path: Option<PathBuf>,
    pub max_body_bytes: usize,
    /// Browser origins allowed to call the API. Empty or `*` allows any.
    pub cors_allowed_origins: Vec<String>,
    pub log_level: String,
}

/// How the external interpreter is launched. Source paths are appended
/// after `args`.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3001))),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("lcc-grader")),
            interpreter: InterpreterConfig {
                command: env::var("INTERPRETER_CMD").unwrap_or_else(|_| "node".to_string()),
                args: parse_csv(
                    &env::var("INTERPRETER_ARGS")
                        .unwrap_or_else(|_| "emulator/src/core/lcc.js".to_string()),
                ),
            },
            default_timeout_ms: clamp_timeout(env_parse("DEFAULT_TIMEOUT_MS", 5_000u64)),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 1024 * 1024usize).max(1024),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", 0usize),
            session_idle_timeout: Duration::from_secs(
                env_parse("SESSION_IDLE_TIMEOUT_SECS", 30 * 60u64).max(1),
            ),
            session_sweep_interval: Duration::from_secs(
                env_parse("SESSION_SWEEP_INTERVAL_SECS", 60u64).max(1),
            ),
            submissions_dir: env::var("SUBMISSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/submissions")),
            store_path: env::var("STORE_PATH").ok().map(PathBuf::from),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 256 * 1024usize),
            cors_allowed_origins: parse_csv(
                &env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

pub fn clamp_timeout(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(50, 120_000)
}

fn parse_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::{clamp_timeout, parse_csv};

    #[test]
    fn splits_interpreter_args_and_drops_blanks() {
        assert_eq!(
            parse_csv(" lcc.js , ,--quiet"),
            vec!["lcc.js".to_string(), "--quiet".to_string()]
        );
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn clamps_timeout_to_safe_bounds() {
        assert_eq!(clamp_timeout(1), 50);
        assert_eq!(clamp_timeout(5_000), 5_000);
        assert_eq!(clamp_timeout(10_000_000), 120_000);
    }
}
