//! Service configuration.
//!
//! Every knob is read from the environment at startup (a `.env` file is
//! loaded first when present). Missing optional values fall back to
//! defaults; malformed values fail startup rather than being silently
//! replaced.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::core::{PipelineSettings, RetryPolicy};

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Generation Service credentials and routing
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,

    /// Per-call timeout and transient retry bound
    pub call_timeout: Duration,
    pub max_call_attempts: u32,

    /// Outline and fan-out bounds
    pub outline_min_sections: usize,
    pub outline_max_sections: usize,
    pub max_parallel_sections: usize,
    pub section_target_words: u32,

    /// Chunked delivery of the final document
    pub stream_chars_per_event: usize,
    pub stream_delay: Duration,

    /// How long terminal jobs stay queryable
    pub job_ttl: Duration,

    /// HTTP listen address and allowed CORS origins ("*" for any)
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration from an arbitrary key lookup. Keeps parsing
    /// testable without mutating process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .context("OPENAI_API_KEY is required")?;

        let config = Self {
            api_key,
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty()),
            call_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CALL_TIMEOUT_SECONDS",
                120u64,
            )?),
            max_call_attempts: parse_or(&lookup, "MAX_CALL_ATTEMPTS", 3u32)?,
            outline_min_sections: parse_or(&lookup, "OUTLINE_MIN_SECTIONS", 10usize)?,
            outline_max_sections: parse_or(&lookup, "OUTLINE_MAX_SECTIONS", 16usize)?,
            max_parallel_sections: parse_or(&lookup, "MAX_PARALLEL_SECTIONS", 10usize)?,
            section_target_words: parse_or(&lookup, "SECTION_TARGET_WORDS", 600u32)?,
            stream_chars_per_event: parse_or(&lookup, "STREAM_CHARS_PER_EVENT", 512usize)?,
            stream_delay: Duration::from_millis(parse_or(&lookup, "STREAM_DELAY_MS", 0u64)?),
            job_ttl: Duration::from_secs(parse_or(&lookup, "JOB_TTL_SECONDS", 30u64)?),
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            cors_origins: lookup("CORS_ORIGINS")
                .unwrap_or_else(|| "*".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.outline_min_sections == 0 {
            bail!("OUTLINE_MIN_SECTIONS must be at least 1");
        }
        if self.outline_max_sections < self.outline_min_sections {
            bail!(
                "OUTLINE_MAX_SECTIONS ({}) must be >= OUTLINE_MIN_SECTIONS ({})",
                self.outline_max_sections,
                self.outline_min_sections
            );
        }
        if self.max_parallel_sections == 0 {
            bail!("MAX_PARALLEL_SECTIONS must be at least 1");
        }
        if self.max_call_attempts == 0 {
            bail!("MAX_CALL_ATTEMPTS must be at least 1");
        }
        if self.stream_chars_per_event == 0 {
            bail!("STREAM_CHARS_PER_EVENT must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            outline_min_sections: self.outline_min_sections,
            outline_max_sections: self.outline_max_sections,
            max_parallel_sections: self.max_parallel_sections,
            section_target_words: self.section_target_words,
            chunk_chars: self.stream_chars_per_event,
            chunk_delay: self.stream_delay,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_call_attempts,
            ..RetryPolicy::default()
        }
    }
}

/// Display redacts the API key so the resolved config can be logged.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "model: {}", self.model)?;
        writeln!(
            f,
            "base_url: {}",
            self.base_url.as_deref().unwrap_or("(default)")
        )?;
        writeln!(f, "api_key: {}", redact(&self.api_key))?;
        writeln!(f, "call_timeout: {}s", self.call_timeout.as_secs())?;
        writeln!(f, "max_call_attempts: {}", self.max_call_attempts)?;
        writeln!(
            f,
            "outline_sections: {}..={}",
            self.outline_min_sections, self.outline_max_sections
        )?;
        writeln!(f, "max_parallel_sections: {}", self.max_parallel_sections)?;
        writeln!(f, "section_target_words: {}", self.section_target_words)?;
        writeln!(
            f,
            "stream_chars_per_event: {}",
            self.stream_chars_per_event
        )?;
        writeln!(f, "stream_delay: {}ms", self.stream_delay.as_millis())?;
        writeln!(f, "job_ttl: {}s", self.job_ttl.as_secs())?;
        writeln!(f, "bind_addr: {}", self.bind_addr)?;
        write!(f, "cors_origins: {}", self.cors_origins.join(", "))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..4])
    }
}
