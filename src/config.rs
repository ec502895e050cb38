use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// ── Defaults ─────────────────────────────────────────────────────────────────

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "MEDIA_RELAY_CONFIG";
const HOST_ENV: &str = "MEDIA_RELAY_HOST";
const PORT_ENV: &str = "MEDIA_RELAY_PORT";
const YTDLP_ENV: &str = "MEDIA_RELAY_YTDLP";
const FFMPEG_ENV: &str = "MEDIA_RELAY_FFMPEG";

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

// ── Server configuration ─────────────────────────────────────────────────────

/// Process-wide settings. Built once in `main` and shared read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Attach an allow-all CORS layer
    pub cors_enabled: bool,
    /// Extraction tool executable
    pub ytdlp_path: PathBuf,
    /// Arguments placed before every extraction tool invocation
    /// (cookies, proxy, or a script when the tool is an interpreter)
    pub ytdlp_extra_args: Vec<String>,
    /// Directory or binary handed to the tool as `--ffmpeg-location`
    pub ffmpeg_path: Option<PathBuf>,
    /// Wall-clock limit for metadata extraction
    pub analyze_timeout_secs: u64,
    /// Accepted source domains; empty accepts any host
    pub allowed_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_enabled: true,
            ytdlp_path: PathBuf::from("yt-dlp"),
            ytdlp_extra_args: Vec::new(),
            ffmpeg_path: None,
            analyze_timeout_secs: 8,
            allowed_domains: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load the optional TOML file, then apply environment overrides.
    ///
    /// The file is taken from the first CLI argument, `MEDIA_RELAY_CONFIG`,
    /// or `config.toml` in the working directory, in that order. A missing
    /// default file is not an error; a missing explicit file is.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::args()
            .nth(1)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from);

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Only the bind address and tool paths may come from the environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV).filter(|v| !v.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: PORT_ENV,
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup(YTDLP_ENV).filter(|v| !v.trim().is_empty()) {
            self.ytdlp_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(FFMPEG_ENV).filter(|v| !v.trim().is_empty()) {
            self.ffmpeg_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    /// A host matches a domain when it is the domain or one of its subdomains.
    pub fn domain_allowed(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_lowercase();
        self.allowed_domains.iter().any(|domain| {
            let domain = domain.trim().trim_start_matches('.').to_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }
}
