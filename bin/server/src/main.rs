use std::sync::Arc;
use thinkone_dispatch::Dispatcher;
use thinkone_governor::RateGovernor;
use thinkone_server::config::ServerConfig;
use thinkone_server::error::StartupError;
use thinkone_server::routes::{self, AppState};
use thinkone_session::SessionManager;
use thinkone_store::{AccountStatus, CredentialCipher, open_store};
use thinkone_telegram::BotApiClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> thinkone_core::Result<(), StartupError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    let default_account = config
        .default_account_key()
        .map_err(|e| StartupError::Config {
            details: e.to_string(),
        })?;
    tracing::info!("Loaded configuration");

    let store = open_store(&config.store_uri)
        .await
        .map_err(|e| StartupError::Store {
            details: e.to_string(),
        })?;
    let cipher = Arc::new(CredentialCipher::from_key_ref(&config.encryption_key_ref).map_err(
        |e| StartupError::EncryptionKey {
            details: e.to_string(),
        },
    )?);
    let client =
        BotApiClient::new(&config.telegram_api_base).map_err(|e| StartupError::TelegramClient {
            details: e.to_string(),
        })?;

    let governor = Arc::new(RateGovernor::new(config.governor()));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&governor),
        Arc::new(client),
        Arc::clone(&cipher),
        config.sessions(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        governor,
        cipher,
        Arc::clone(&sessions),
        config.dispatcher(),
    ));

    if config.eager_connect {
        match store.list().await {
            Ok(accounts) => {
                let keys: Vec<_> = accounts
                    .into_iter()
                    .filter(|account| account.status != AccountStatus::Revoked)
                    .map(|account| account.key)
                    .collect();
                tracing::info!(accounts = keys.len(), "Connecting registered accounts");
                sessions.warm_up(&keys).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list accounts for warm-up"),
        }
    }

    let state = Arc::new(AppState {
        dispatcher,
        default_account,
        default_channels: config.channels(),
    });
    let app = routes::app(state, &config.cors_origin_list());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: addr.clone(),
            details: e.to_string(),
        })?;

    tracing::info!("listening on http://{}", addr);

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Closing sessions");
    sessions.shutdown().await;

    served.map_err(|e| StartupError::Serve {
        details: e.to_string(),
    })?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
