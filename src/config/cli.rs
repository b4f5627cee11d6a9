use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use super::EngineKind;
use crate::application::render::RenderFormat;

/// Command-line arguments for the renderpool binary.
#[derive(Debug, Parser)]
#[command(
    name = "renderpool",
    version,
    about = "Render pages through a pool of recycled headless browsers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RENDERPOOL_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP render service.
    Serve(Box<ServeArgs>),
    /// Capture a single page and exit.
    Render(Box<RenderArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the engine implementation.
    #[arg(long = "engine-kind", value_name = "KIND")]
    pub engine_kind: Option<EngineKind>,

    /// Override the browser executable.
    #[arg(long = "engine-executable", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub engine_executable: Option<PathBuf>,

    /// Toggle headless mode.
    #[arg(
        long = "engine-headless",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub engine_headless: Option<bool>,

    /// Override how many pages a browser process serves before it is retired.
    #[arg(long = "engine-end-of-life-page-count", value_name = "COUNT")]
    pub engine_end_of_life_page_count: Option<u32>,

    /// Override the pool key renders are grouped under.
    #[arg(long = "render-pool-key", value_name = "KEY")]
    pub render_pool_key: Option<String>,

    /// Override how long a render waits for network idle.
    #[arg(long = "render-idle-timeout-ms", value_name = "MS")]
    pub render_idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the maximum request body size in bytes.
    #[arg(long = "server-body-limit-bytes", value_name = "BYTES")]
    pub server_body_limit_bytes: Option<u64>,
}

#[derive(Debug, Args, Clone)]
#[command(group(ArgGroup::new("source").required(true).args(["url", "html_file"])))]
pub struct RenderArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Page to render.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    pub url: Option<String>,

    /// HTML document to render.
    #[arg(long = "html-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub html_file: Option<PathBuf>,

    /// Where to write the capture.
    #[arg(long, short = 'o', value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = RenderFormat::Png)]
    pub format: RenderFormat,

    /// Render in a dedicated browser process.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub isolated: bool,

    /// Capture only the viewport instead of the whole document.
    #[arg(long = "viewport-only", action = clap::ArgAction::SetTrue)]
    pub viewport_only: bool,
}
