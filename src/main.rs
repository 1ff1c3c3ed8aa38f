use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use kairos::calendar::GoogleCalendar;
use kairos::config::Config;
use kairos::dispatch::{DispatchWorker, Dispatcher};
use kairos::engine::{Engine, EngineSettings};
use kairos::mailer::{EmailNotifier, EmailSettings};
use kairos::notify::NotifyHub;
use kairos::session::SessionManager;
use kairos::store::{MemoryStore, Stores};
use kairos::{observability, reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    observability::init_logging(config.log_format);
    observability::init(config.metrics_port)?;

    let tls_acceptor = kairos::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(MemoryStore::open(config.wal_path())?);
    let stores = Stores::memory(store.clone());
    let notify = Arc::new(NotifyHub::new());

    let notifier = EmailNotifier::new(EmailSettings {
        api_url: config.email_api_url.clone(),
        api_key: config.email_api_key.clone(),
        from: config.email_from.clone(),
        timezone: config.timezone,
        invite: config.invite(),
    });
    if config.email_api_key.is_none() {
        tracing::warn!("KAIROS_EMAIL_API_KEY not set, notifications will be reported as failed");
    }
    let calendar = GoogleCalendar::new(config.calendar_api_url.clone(), config.timezone);

    let (dispatcher, dispatch_handle) = Dispatcher::spawn(
        DispatchWorker {
            notifier: Arc::new(notifier),
            calendar: Arc::new(calendar),
            users: stores.users.clone(),
            bookings: stores.bookings.clone(),
            notify: notify.clone(),
            skip_privileged: config.skip_privileged_emails,
        },
        config.dispatch_queue,
    );

    let engine = Arc::new(Engine::new(
        stores.clone(),
        dispatcher.clone(),
        notify,
        EngineSettings {
            timezone: config.timezone,
            invite: config.invite(),
        },
    ));
    let sessions = Arc::new(
        SessionManager::open(config.session_path(), stores.users.clone(), config.admin_emails.clone()).await?,
    );

    tokio::spawn(reaper::run_compactor(store, config.compact_threshold));
    if let Some(secs) = config.auto_complete_secs {
        tokio::spawn(reaper::run_completion_sweep(engine.clone(), Duration::from_secs(secs)));
    }

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("kairos listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  timezone: {}", config.timezone);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let sessions = sessions.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, sessions, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // Give queued e-mail and calendar jobs a bounded chance to finish.
    if tokio::time::timeout(Duration::from_secs(5), dispatcher.flush()).await.is_err() {
        tracing::warn!("side-effect queue not drained before exit");
    }
    dispatch_handle.abort();

    info!("kairos stopped");
    Ok(())
}
