use std::process::ExitCode;
use std::sync::Arc;

use printd::config::MailbotConfig;
use printd::daemon::{self, Daemon, Shutdown};
use printd::dispatch::{Dispatcher, LogCapture};
use printd::jobs::PrintJobKind;
use printd::transport::{ImapConnector, SmtpSender};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn main() -> ExitCode {
    if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
        // SAFETY: no other threads exist yet.
        unsafe { std::env::set_var("RUST_LIB_BACKTRACE", "1") };
    }

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Console output filtered by RUST_LOG; the capture layer always sees debug
    let capture = LogCapture::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_target(false).with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(capture.layer().with_filter(LevelFilter::DEBUG))
        .init();

    let path = MailbotConfig::path_from_env();
    let config = match MailbotConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), "{}", printd::error::Error::from(e));
            return ExitCode::FAILURE;
        }
    };
    info!(
        path = %path.display(),
        mailaddr = %config.mailaddr,
        users = config.users.len(),
        "Configuration loaded"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(config, capture))
}

/// Wire transport, dispatcher and job kind into a daemon.
fn build(config: MailbotConfig, capture: LogCapture, shutdown: Shutdown) -> printd::error::Result<Daemon> {
    let sender = SmtpSender::from_config(&config)?;
    let identity = sender.identity().clone();
    let kind = PrintJobKind::new(&config.print);
    let dispatcher = Dispatcher::new(identity, config.users, Box::new(kind), Arc::new(sender), capture);
    Ok(Daemon::new(
        Box::new(ImapConnector::new(config.imap)),
        dispatcher,
        config.timing,
        shutdown,
    ))
}

async fn run(config: MailbotConfig, capture: LogCapture) -> ExitCode {
    let shutdown = Shutdown::new();
    let daemon = match build(config, capture, shutdown.clone()) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let handle = daemon::spawn_daemon(daemon);
    match daemon::supervise(handle, tokio::signal::ctrl_c(), &shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Mail loop task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
