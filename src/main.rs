use std::sync::Arc;

use mailgram::config::Config;
use mailgram::mail::Pop3Mailbox;
use mailgram::notify::{Notifier, TelegramNotifier};
use mailgram::poller::spawn_mail_poller;
use mailgram::store::{Ledger, LibSqlLedger};
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Log to stdout and a daily-rotated file
    let file_appender = tracing_appender::rolling::daily("logs", "mailgram.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(file_writer))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("Configuration validated");

    let ledger: Arc<dyn Ledger> = match LibSqlLedger::new_local(&config.database_path).await {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            eprintln!(
                "Error: Failed to open ledger at {}: {e}",
                config.database_path.display()
            );
            std::process::exit(1);
        }
    };
    tracing::info!(path = %config.database_path.display(), "Ledger opened");

    let notifier = Arc::new(TelegramNotifier::new(
        config.telegram_bot_token,
        config.telegram_chat_id.clone(),
        config.max_message_length,
    ));
    if !notifier.test_connection().await {
        eprintln!("Error: Telegram bot connection test failed");
        std::process::exit(1);
    }
    tracing::info!("Telegram bot connection verified");

    let mailbox = Box::new(Pop3Mailbox::new(
        config.pop3_server.clone(),
        config.pop3_port,
        config.pop3_user.clone(),
        config.pop3_password,
    ));

    let poller = spawn_mail_poller(
        mailbox,
        ledger,
        notifier as Arc<dyn Notifier>,
        config.check_interval,
    );
    tracing::info!(
        server = %config.pop3_server,
        interval_secs = config.check_interval.as_secs(),
        "mailgram started"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, waiting for any in-flight cycle");
    poller.stop().await;
    tracing::info!("mailgram stopped");

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
