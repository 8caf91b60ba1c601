//! Typed runtime settings read from the environment.
//!
//! Callers run [`crate::load_and_apply`] first so `.env` / XDG values are
//! visible, then build agents from `RuntimeSettings::from_env()`.

/// Runtime knobs for the agent loop, workflow scheduler, and sandbox.
///
/// Every field has a default; unknown or malformed env values fall back to
/// the default rather than failing startup.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeSettings {
    /// Iteration cap for the tool-calling loop (`SKEIN_MAX_ITERATIONS`).
    pub max_iterations: usize,
    /// Concurrent tool dispatches per LLM response (`SKEIN_MAX_PARALLEL_TOOLS`).
    pub max_parallel_tools: usize,
    /// Concurrent steps per workflow run (`SKEIN_WORKFLOW_CONCURRENCY`).
    pub workflow_concurrency: usize,
    /// Sandbox execution timeout in seconds (`SKEIN_SANDBOX_TIMEOUT_SECS`).
    pub sandbox_timeout_secs: u64,
    /// Sandbox output files above this many bytes degrade to metadata-only
    /// (`SKEIN_SANDBOX_MAX_FILE_BYTES`).
    pub sandbox_max_file_bytes: usize,
    /// Provider requests per minute, 0 disables (`SKEIN_PROVIDER_RPM`).
    pub provider_rpm: u32,
    /// Provider tokens per minute, 0 disables (`SKEIN_PROVIDER_TPM`).
    pub provider_tpm: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_parallel_tools: 10,
            workflow_concurrency: 8,
            sandbox_timeout_secs: 60,
            sandbox_max_file_bytes: 2 * 1024 * 1024,
            provider_rpm: 0,
            provider_tpm: 0,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl RuntimeSettings {
    /// Reads settings from the process environment, defaulting per field.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_iterations: parse_env("SKEIN_MAX_ITERATIONS", d.max_iterations),
            max_parallel_tools: parse_env("SKEIN_MAX_PARALLEL_TOOLS", d.max_parallel_tools),
            workflow_concurrency: parse_env("SKEIN_WORKFLOW_CONCURRENCY", d.workflow_concurrency),
            sandbox_timeout_secs: parse_env("SKEIN_SANDBOX_TIMEOUT_SECS", d.sandbox_timeout_secs),
            sandbox_max_file_bytes: parse_env(
                "SKEIN_SANDBOX_MAX_FILE_BYTES",
                d.sandbox_max_file_bytes,
            ),
            provider_rpm: parse_env("SKEIN_PROVIDER_RPM", d.provider_rpm),
            provider_tpm: parse_env("SKEIN_PROVIDER_TPM", d.provider_tpm),
        }
    }
}
