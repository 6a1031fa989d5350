use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::{any::Any, net::SocketAddr, sync::Arc};
use storage::{AzureBlobStore, DocumentLocation, DocumentStore};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Level;
use turnstile::{TokenVerifier, Turnstile};
use utils::{
    app_error::INTERNAL_ERROR_MESSAGE,
    settings::Settings,
    tracing::request_tracing,
};

mod http;
mod storage;
mod turnstile;
mod utils;

type Environment = Arc<EnvironmentInner>;

pub struct EnvironmentInner {
    verifier: Box<dyn TokenVerifier>,
    store: Box<dyn DocumentStore>,
    document: DocumentLocation,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::from_env()?;
    utils::tracing::init(settings.log_level)?;

    let verifier = Turnstile::new(
        settings.verify_url.clone(),
        settings.turnstile_secret.clone(),
        settings.verify_timeout,
    )?;
    if !verifier.is_configured() {
        log::warn!("TURNSTILE_SECRET_KEY is not set, every CV request will fail");
    }

    let store = AzureBlobStore::from_settings(&settings.storage)?;

    let environment: Environment = Arc::new(EnvironmentInner {
        verifier: Box::new(verifier),
        store: Box::new(store),
        document: settings.document.clone(),
    });

    let app = app(environment, settings.log_level);

    // run our app with hyper
    let addr: SocketAddr = ([127, 0, 0, 1], settings.port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn app(environment: Environment, log_level: Level) -> Router {
    Router::new()
        .route("/healthCheck", get(StatusCode::OK))
        .route("/cv", post(http::cv::run))
        .with_state(environment)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(log_level, request_tracing))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Handler panicked: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        INTERNAL_ERROR_MESSAGE,
    )
        .into_response()
}
