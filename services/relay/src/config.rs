use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// What the relay does with telephony frames while the engine link is down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Frames are discarded and counted.
    Drop,
    /// The most recent `n` frames are held and flushed on reconnect.
    Queue(usize),
}

impl std::str::FromStr for BufferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "drop" {
            return Ok(Self::Drop);
        }
        match s.strip_prefix("queue:") {
            Some(n) => match n.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Self::Queue(n)),
                _ => Err(format!("'{}' is not a positive queue size", n)),
            },
            None => Err(format!("'{}' is not 'drop' or 'queue:<n>'", s)),
        }
    }
}

/// Settings for the offline lip-sync compositor.
#[derive(Clone, Debug)]
pub struct LipSyncConfig {
    pub enabled: bool,
    pub engine: String,
    pub engine_root: PathBuf,
    pub temp_dir: PathBuf,
    pub python: PathBuf,
    pub ffmpeg: PathBuf,
    /// `None` lets the render subprocess run unbounded.
    pub render_timeout: Option<Duration>,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: "none".to_string(),
            engine_root: PathBuf::from("./emore-engine"),
            temp_dir: PathBuf::from("./temp-lipsync"),
            python: PathBuf::from("python"),
            ffmpeg: PathBuf::from("ffmpeg"),
            render_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub avatar_bind_address: SocketAddr,
    pub voice_agent_ws: String,
    pub reconnect_backoff: Duration,
    pub buffer_policy: BufferPolicy,
    pub stream_idle_timeout: Duration,
    pub dialplan_path: PathBuf,
    pub conversation_service_url: Option<String>,
    pub telephony_auth_token: Option<String>,
    pub heygen_api_key: Option<String>,
    pub heygen_stream_api_url: String,
    pub heygen_voice_id: String,
    pub lipsync: LipSyncConfig,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads an optional variable, treating an empty value as unset.
fn var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn parse_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("'{}' is not a boolean", v),
            )),
        },
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:4600")?;
        let avatar_bind_address = parse_var::<SocketAddr>("AVATAR_BIND_ADDRESS", "0.0.0.0:4700")?;

        let voice_agent_ws = var_or("VOICE_AGENT_WS", "ws://localhost:4747");
        if !(voice_agent_ws.starts_with("ws://") || voice_agent_ws.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "VOICE_AGENT_WS".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", voice_agent_ws),
            ));
        }

        let reconnect_backoff =
            Duration::from_millis(parse_var::<u64>("ENGINE_RECONNECT_MS", "3000")?);
        let buffer_policy = parse_var::<BufferPolicy>("RELAY_BUFFER_POLICY", "drop")?;
        let stream_idle_timeout =
            Duration::from_secs(parse_var::<u64>("STREAM_IDLE_TIMEOUT_SECS", "30")?);

        let dialplan_path = PathBuf::from(var_or("DIALPLAN_PATH", "./config/dialplan.json"));

        let render_timeout_secs = parse_var::<u64>("LIPSYNC_RENDER_TIMEOUT_SECS", "600")?;
        let lipsync = LipSyncConfig {
            enabled: parse_bool("LIPSYNC_ENABLED", false)?,
            engine: var_or("LIPSYNC_ENGINE", "none").to_lowercase(),
            engine_root: PathBuf::from(var_or("LIPSYNC_ENGINE_ROOT", "./emore-engine")),
            temp_dir: PathBuf::from(var_or("LIPSYNC_TEMP_DIR", "./temp-lipsync")),
            python: PathBuf::from(var_or("LIPSYNC_PYTHON", "python")),
            ffmpeg: PathBuf::from(var_or("FFMPEG_PATH", "ffmpeg")),
            render_timeout: (render_timeout_secs > 0)
                .then(|| Duration::from_secs(render_timeout_secs)),
        };

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            avatar_bind_address,
            voice_agent_ws,
            reconnect_backoff,
            buffer_policy,
            stream_idle_timeout,
            dialplan_path,
            conversation_service_url: var_opt("CONVERSATION_SERVICE_URL"),
            telephony_auth_token: var_opt("TELEPHONY_AUTH_TOKEN"),
            heygen_api_key: var_opt("HEYGEN_API_KEY"),
            heygen_stream_api_url: var_or(
                "HEYGEN_STREAM_API_URL",
                "https://api.heygen.com/v1/streams",
            ),
            heygen_voice_id: var_or("HEYGEN_VOICE_ID", "a34aec03-0f17-4fff-903f-d9458a8a92a6"),
            lipsync,
            log_level,
        })
    }
}
