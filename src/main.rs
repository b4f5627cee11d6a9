use std::{future::IntoFuture, process, sync::Arc};

use renderpool::{
    application::{
        error::AppError,
        render::{RenderRequest, RenderService},
    },
    config::{self, EngineKind, EngineSettings, RenderArgs},
    engine::{EngineLauncher, chrome::ChromeLauncher, memory::MemoryEngine},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    pool::ResolverRegistry,
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) =
        config::load_with_cli().map_err(|err| AppError::from(InfraError::from(err)))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, *args).await,
    }
}

fn build_launcher(engine: &EngineSettings) -> Arc<dyn EngineLauncher> {
    match engine.kind {
        EngineKind::Chrome => Arc::new(
            ChromeLauncher::new(engine.executable.clone())
                .with_launch_timeout(engine.launch_timeout)
                .with_command_timeout(engine.command_timeout),
        ),
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
    }
}

fn build_render_service(settings: &config::Settings) -> RenderService {
    let registry = Arc::new(ResolverRegistry::new(
        build_launcher(&settings.engine),
        settings.engine.resolver_config(),
    ));
    RenderService::new(registry, settings.render.clone())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let render = build_render_service(&settings);
    let registry = render.registry().clone();
    let router = http::build_router(HttpState { render }, settings.server.body_limit_bytes);

    let addr = settings.server.addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| AppError::from(InfraError::Bind { addr, source }))?;
    info!(
        target = "renderpool::serve",
        addr = %addr,
        engine = ?settings.engine.kind,
        pool_key = %settings.render.pool_key,
        "Listening"
    );

    let stopping = Arc::new(Notify::new());
    let signal = {
        let stopping = stopping.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
                return;
            }
            info!(target = "renderpool::serve", "Shutdown signal received");
            stopping.notify_one();
        }
    };

    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(signal);
    let grace = settings.server.graceful_shutdown;
    let outcome = tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::from(InfraError::Serve(err)))
        }
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                target = "renderpool::serve",
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    };

    let disposed = release_idle(&registry).await;
    info!(
        target = "renderpool::serve",
        disposed,
        remaining = registry.len(),
        "Released idle browser processes"
    );
    outcome
}

async fn release_idle(registry: &ResolverRegistry) -> usize {
    if let Err(err) = registry.wait_until_idle().await {
        debug!(
            target = "renderpool",
            error = %err,
            "Pages still open; sweeping what is idle"
        );
    }
    registry.sweep().await
}

async fn run_render(settings: config::Settings, args: RenderArgs) -> Result<(), AppError> {
    let request = match (args.url, args.html_file) {
        (Some(url), _) => RenderRequest::url(url),
        (None, Some(path)) => {
            let html = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
            RenderRequest::html(html)
        }
        (None, None) => return Err(AppError::validation("either --url or --html-file is required")),
    };
    let mut request = request.with_format(args.format).isolated(args.isolated);
    request.full_page = !args.viewport_only;

    let render = build_render_service(&settings);
    let result = render.capture(request).await;
    release_idle(render.registry()).await;
    let output = result?;

    tokio::fs::write(&args.output, &output.bytes)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "renderpool::render",
        output = %args.output.display(),
        bytes = output.bytes.len(),
        format = ?output.format,
        had_failed_requests = output.had_failed_requests,
        "Wrote capture"
    );
    Ok(())
}
