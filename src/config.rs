use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::generator::fallback::FallbackPolicy;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Credential for the completion provider. `None` forces the fallback
    /// path for every request; it is never a startup failure.
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub upstream_timeout_ms: u64,
    /// CORS allow-list. `None` means any origin is allowed.
    pub allowed_origins: Option<Vec<String>>,
    /// Baseline facts merged under the facts supplied per request.
    pub base_facts: serde_json::Map<String, serde_json::Value>,
    pub fallback_policy: FallbackPolicy,
    pub max_request_bytes: Option<usize>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
}

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let model = env::var("PAGEFILL_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let api_base = env::var("PAGEFILL_API_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let upstream_timeout_ms = parse_optional_u64("PAGEFILL_UPSTREAM_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);

        let allowed_origins = parse_allowed_origins(env::var("ALLOWED_ORIGINS").ok().as_deref());

        let base_facts = if let Ok(path) = env::var("PAGEFILL_FACTS_FILE") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read PAGEFILL_FACTS_FILE '{}': file unreadable", path)
            })?;
            serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&content)
                .with_context(|| {
                    format!(
                        "Failed to parse PAGEFILL_FACTS_FILE '{}': expected a JSON object",
                        path
                    )
                })?
        } else {
            serde_json::Map::new()
        };

        let fallback_policy = match env::var("PAGEFILL_FALLBACK_POLICY") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<FallbackPolicy>()
                .map_err(|_| anyhow!("PAGEFILL_FALLBACK_POLICY must be 'empty' or 'first-option'"))?,
            _ => FallbackPolicy::Empty,
        };

        let max_request_bytes =
            parse_optional_u64("PAGEFILL_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let log_file = env::var("LOG_FILE").ok();
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
        };

        Ok(Self {
            api_key,
            model,
            api_base,
            upstream_timeout_ms,
            allowed_origins,
            base_facts,
            fallback_policy,
            max_request_bytes,
            log_file,
            rotation,
        })
    }
}

/// Parse a comma-separated origin allow-list. Unset, empty or `*` all mean
/// "allow any origin" and map to `None`.
fn parse_allowed_origins(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == "*" {
        return None;
    }
    let origins: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if origins.is_empty() {
        None
    } else {
        Some(origins)
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: &[&str] = &[
        "OPENAI_API_KEY",
        "PAGEFILL_MODEL",
        "PAGEFILL_API_BASE",
        "PAGEFILL_UPSTREAM_TIMEOUT_MS",
        "ALLOWED_ORIGINS",
        "PAGEFILL_FACTS_FILE",
        "PAGEFILL_FALLBACK_POLICY",
        "PAGEFILL_MAX_REQUEST_BYTES",
        "LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.api_key.is_none());
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.api_base, "https://api.openai.com/v1");
        assert_eq!(cfg.upstream_timeout_ms, 10_000);
        assert!(cfg.allowed_origins.is_none());
        assert!(cfg.base_facts.is_empty());
        assert_eq!(cfg.fallback_policy, FallbackPolicy::Empty);
        assert!(cfg.log_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let mut temp = NamedTempFile::new().unwrap();
        let facts = serde_json::json!({
            "email": "student@example.com",
            "interests": ["product design", "rowing"]
        });
        use std::io::Write;
        write!(temp, "{}", facts).unwrap();

        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("PAGEFILL_MODEL", "gpt-4.1");
        std::env::set_var("PAGEFILL_API_BASE", "http://127.0.0.1:9/v1/");
        std::env::set_var("PAGEFILL_UPSTREAM_TIMEOUT_MS", "2500");
        std::env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example");
        std::env::set_var("PAGEFILL_FACTS_FILE", temp.path());
        std::env::set_var("PAGEFILL_FALLBACK_POLICY", "first-option");
        std::env::set_var("PAGEFILL_MAX_REQUEST_BYTES", "4096");
        std::env::set_var("LOG_FILE", "/tmp/pagefill.log");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "3");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.model, "gpt-4.1");
        // Trailing slash is stripped so URL joins stay predictable.
        assert_eq!(cfg.api_base, "http://127.0.0.1:9/v1");
        assert_eq!(cfg.upstream_timeout_ms, 2500);
        assert_eq!(
            cfg.allowed_origins,
            Some(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        assert_eq!(
            cfg.base_facts.get("email").and_then(|v| v.as_str()),
            Some("student@example.com")
        );
        assert_eq!(cfg.fallback_policy, FallbackPolicy::FirstOption);
        assert_eq!(cfg.max_request_bytes, Some(4096));
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/pagefill.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 3);

        clear_env();
    }

    #[test]
    fn wildcard_allow_list_means_any_origin() {
        assert!(parse_allowed_origins(None).is_none());
        assert!(parse_allowed_origins(Some("*")).is_none());
        assert!(parse_allowed_origins(Some("  ")).is_none());
        assert_eq!(
            parse_allowed_origins(Some("https://x.example,")),
            Some(vec!["https://x.example".to_string()])
        );
    }

    #[test]
    fn rejects_bad_policy_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("PAGEFILL_FALLBACK_POLICY", "always-guess");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("PAGEFILL_FALLBACK_POLICY");
    }
}
