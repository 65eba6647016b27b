use crate::auth::TokenRegistry;
use crate::handlers;
use axum::{
    routing::{get, patch, post},
    Router,
};
use spend_recon_engine::ReconService;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReconService>,
    pub tokens: Arc<TokenRegistry>,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    #[must_use]
    pub fn new(service: Arc<ReconService>, tokens: TokenRegistry) -> Self {
        Self {
            state: AppState {
                service,
                tokens: Arc::new(tokens),
            },
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let api = Router::new()
            .route(
                "/ad-spend",
                post(handlers::create_ad_spend).get(handlers::list_ad_spend),
            )
            .route(
                "/ledger",
                post(handlers::create_ledger).get(handlers::list_ledger),
            )
            .route("/reconcile", get(handlers::list_reconciliations))
            .route("/reconcile/run", post(handlers::run_reconciliation))
            .route("/reconcile/:id", patch(handlers::update_reconciliation))
            .route("/reports/monthly", get(handlers::monthly_report));

        Router::new()
            .route("/health", get(handlers::health))
            .nest("/api", api)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Starts the web server listening on the specified address.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            addr,
            tokens = self.state.tokens.len(),
            "Web API listening"
        );

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
