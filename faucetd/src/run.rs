//! Wires the configured collaborators into a [`faucet_core::Faucet`] and
//! serves it over HTTP until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use axum::Router;
use faucet_core::{clock::system_clock, Faucet};
use tower_http::cors;

use crate::alerter::ExAlerter;
use crate::config::FaucetdConfig;
use crate::db::Db;
use crate::rpc::RpcClient;
use crate::server::{self, AppState};
use crate::sig_down::SigDown;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcClientError),
    #[error(transparent)]
    Settings(#[from] crate::config::FaucetSettingsError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] faucet_core::StoreError),
    #[error("invalid listen address {0:?}: {1}")]
    InvalidListenAddress(String, std::net::AddrParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn init_logging(cfg: &crate::config::LogConfig) {
    use tracing_subscriber::fmt::time::ChronoLocal;

    let timer_fmt = match (cfg.date, cfg.time) {
        (true, true) if cfg.utc => "%Y-%m-%d %H:%M:%S%.f UTC",
        (true, true) => "%Y-%m-%d %H:%M:%S%.f",
        (true, false) => "%Y-%m-%d",
        (false, true) => "%H:%M:%S%.f",
        (false, false) => "",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

    if timer_fmt.is_empty() {
        builder.without_time().init();
    } else {
        builder.with_timer(ChronoLocal::new(timer_fmt.to_string())).init();
    }
}

pub async fn serve(cfg: FaucetdConfig) -> Result<(), RunError> {
    let faucet_cfg = cfg.faucet.to_core()?;
    let bank = RpcClient::new(cfg.rpc.clone())?;

    let fdb = if cfg.db.configured() {
        Some(Db::connect(&cfg.db).await?)
    } else {
        None
    };

    let alerter: Option<ExAlerter> = if cfg.alerts.configured() {
        Some(ExAlerter::new(&cfg.alerts))
    } else {
        None
    };

    let clock = system_clock();
    let faucet = Faucet::new(faucet_cfg, bank, fdb, alerter, clock).await?;
    let faucet = Arc::new(faucet);

    let state = AppState {
        faucet: faucet.clone(),
        use_fwd_addr: cfg.server.use_fwd_addr,
    };

    let api_prefix = if cfg.server.api_prefix.is_empty() {
        "/".to_string()
    } else {
        cfg.server.api_prefix.clone()
    };

    let mut app: Router = Router::new()
        .nest(&api_prefix, server::routes().with_state(state));

    if !cfg.server.allow_origin.is_empty() {
        let origin: axum::http::HeaderValue = cfg
            .server
            .allow_origin
            .parse()
            .unwrap_or(axum::http::HeaderValue::from_static("*"));
        app = app.layer(
            cors::CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        );
    }

    let addr: SocketAddr = cfg
        .server
        .listen
        .parse()
        .map_err(|e| RunError::InvalidListenAddress(cfg.server.listen.clone(), e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, prefix = %api_prefix, "faucetd listening");

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    let graceful_shutdown = async move { cancellation_token.cancelled().await };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful_shutdown)
    .await?;

    Ok(())
}
