use std::sync::Arc;

use authgate::cli::Args;
use authgate::config::{Config, ProviderConfig};
use authgate::crypto::Keyring;
use authgate::oidc::Issuer;
use authgate::provider::github::GithubProvider;
use authgate::provider::oidc::OidcProvider;
use authgate::provider::IdentityProvider;
use authgate::state::AppState;
use authgate::token::db::TokenDatabase;
use authgate::token::manager::TokenManager;
use authgate::token::store::TokenStore;
use authgate::{logging, web};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}");
        std::process::exit(1);
    });

    logging::setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        port = config.port,
        realm = %config.realm,
        "starting authgate"
    );

    if let Err(e) = run(config).await {
        error!(error = ?e, "authgate exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let keyring = Arc::new(Keyring::load(&config.session_secret_file)?);

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("running database migrations");
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    let db = Arc::new(TokenDatabase::new(db_pool));
    db.bootstrap_admins(&config.initial_admins).await?;

    let store = Arc::new(TokenStore::new(&config.redis_url, keyring.clone()).await?);
    let manager = Arc::new(TokenManager::new(store, db, config.clone()));

    let http = reqwest::Client::builder()
        .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let provider: Arc<dyn IdentityProvider> = match &config.provider {
        ProviderConfig::Github(github) => {
            Arc::new(GithubProvider::new(github.clone(), http.clone()))
        }
        ProviderConfig::Oidc(oidc) => Arc::new(OidcProvider::new(oidc.clone(), http.clone())),
    };

    let issuer = Arc::new(Issuer::load(config.issuer.clone())?);

    let state = AppState {
        config: config.clone(),
        manager,
        keyring,
        provider,
        issuer,
        http,
    };

    let app = web::router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(address = %addr, "authgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("authgate shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl+c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
