//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::{DEFAULT_IDLE_TIMEOUT, DEFAULT_POOL_KEY, RenderSettings};
use crate::domain::viewport::Viewport;
use crate::engine::LaunchProfile;
use crate::engine::chrome::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_LAUNCH_TIMEOUT};
use crate::pool::{DEFAULT_END_OF_LIFE_PAGE_COUNT, ResolverConfig};

pub use cli::{
    CliArgs, Command, EngineOverrides, LoggingOverrides, RenderArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "renderpool";
const ENV_PREFIX: &str = "RENDERPOOL";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BODY_LIMIT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_EXECUTABLE: &str = "chromium";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Headless Chrome or Chromium over the DevTools protocol.
    #[default]
    Chrome,
    /// In-process engine returning placeholder captures.
    Memory,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub kind: EngineKind,
    pub executable: PathBuf,
    pub profile: LaunchProfile,
    pub launch_timeout: Duration,
    pub command_timeout: Duration,
    pub end_of_life_page_count: u32,
}

impl EngineSettings {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            profile: self.profile.clone(),
            end_of_life_page_count: self.end_of_life_page_count,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("render.ignored_url_prefixes")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_engine_overrides(&args.engine);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.server_body_limit_bytes {
            self.server.body_limit_bytes = Some(bytes);
        }
        self.apply_logging_overrides(&overrides.logging);
        self.apply_engine_overrides(&overrides.engine);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(kind) = overrides.engine_kind {
            self.engine.kind = Some(kind);
        }
        if let Some(path) = overrides.engine_executable.as_ref() {
            self.engine.executable = Some(path.clone());
        }
        if let Some(headless) = overrides.engine_headless {
            self.engine.headless = Some(headless);
        }
        if let Some(count) = overrides.engine_end_of_life_page_count {
            self.engine.end_of_life_page_count = Some(count);
        }
        if let Some(key) = overrides.render_pool_key.as_ref() {
            self.render.pool_key = Some(key.clone());
        }
        if let Some(ms) = overrides.render_idle_timeout_ms {
            self.render.idle_timeout_ms = Some(ms);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            engine,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            engine: build_engine_settings(engine)?,
            render: build_render_settings(render)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let body_limit = server.body_limit_bytes.unwrap_or(DEFAULT_BODY_LIMIT_BYTES);
    if body_limit == 0 {
        return Err(LoadError::invalid(
            "server.body_limit_bytes",
            "must be greater than zero",
        ));
    }
    let body_limit_bytes = usize::try_from(body_limit).map_err(|_| {
        LoadError::invalid(
            "server.body_limit_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        body_limit_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let defaults = LaunchProfile::default();

    let executable = engine
        .executable
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));
    if executable.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "engine.executable",
            "path must not be empty",
        ));
    }

    let window_width = positive(
        engine.window_width.unwrap_or(defaults.window_width),
        "engine.window_width",
    )?;
    let window_height = positive(
        engine.window_height.unwrap_or(defaults.window_height),
        "engine.window_height",
    )?;

    let locale = engine.locale.unwrap_or(defaults.locale);
    if locale.trim().is_empty() {
        return Err(LoadError::invalid("engine.locale", "must not be empty"));
    }

    // An empty timezone leaves the inherited TZ untouched.
    let timezone = match engine.timezone {
        Some(timezone) => {
            let trimmed = timezone.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        None => defaults.timezone,
    };

    let launch_timeout = millis(
        engine.launch_timeout_ms,
        DEFAULT_LAUNCH_TIMEOUT,
        "engine.launch_timeout_ms",
    )?;
    let command_timeout = millis(
        engine.command_timeout_ms,
        DEFAULT_COMMAND_TIMEOUT,
        "engine.command_timeout_ms",
    )?;
    let end_of_life_page_count = positive(
        engine
            .end_of_life_page_count
            .unwrap_or(DEFAULT_END_OF_LIFE_PAGE_COUNT),
        "engine.end_of_life_page_count",
    )?;

    Ok(EngineSettings {
        kind: engine.kind.unwrap_or_default(),
        executable,
        profile: LaunchProfile {
            headless: engine.headless.unwrap_or(defaults.headless),
            window_width,
            window_height,
            locale,
            timezone,
        },
        launch_timeout,
        command_timeout,
        end_of_life_page_count,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let pool_key = render
        .pool_key
        .map(|key| key.trim().to_string())
        .unwrap_or_else(|| DEFAULT_POOL_KEY.to_string());
    if pool_key.is_empty() {
        return Err(LoadError::invalid("render.pool_key", "must not be empty"));
    }

    let defaults = Viewport::default();
    let viewport = Viewport::new(
        positive(
            render.viewport_width.unwrap_or(defaults.width),
            "render.viewport_width",
        )?,
        positive(
            render.viewport_height.unwrap_or(defaults.height),
            "render.viewport_height",
        )?,
    )
    .with_touch(render.has_touch.unwrap_or(defaults.has_touch));

    let idle_timeout = millis(
        render.idle_timeout_ms,
        DEFAULT_IDLE_TIMEOUT,
        "render.idle_timeout_ms",
    )?;

    let ignored_url_prefixes = render
        .ignored_url_prefixes
        .unwrap_or_default()
        .into_iter()
        .map(|prefix| prefix.trim().to_string())
        .filter(|prefix| !prefix.is_empty())
        .collect();

    Ok(RenderSettings {
        pool_key,
        viewport,
        idle_timeout,
        ignored_url_prefixes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    body_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    kind: Option<EngineKind>,
    executable: Option<PathBuf>,
    headless: Option<bool>,
    window_width: Option<u32>,
    window_height: Option<u32>,
    locale: Option<String>,
    timezone: Option<String>,
    launch_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    end_of_life_page_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    pool_key: Option<String>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
    has_touch: Option<bool>,
    idle_timeout_ms: Option<u64>,
    ignored_url_prefixes: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive(value: u32, key: &'static str) -> Result<u32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn millis(value: Option<u64>, default: Duration, key: &'static str) -> Result<Duration, LoadError> {
    match value {
        Some(0) => Err(LoadError::invalid(key, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}
