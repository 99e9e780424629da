use crate::config::Config;
use crate::error::StoreError;
use crate::gate::{OncePerVoterGate, OpenGate, VoteGate};
use crate::hub::{HubConfig, TallyHub};
use crate::sse::poll_updates_sse;
use crate::store::{MemoryCounterStore, RedisCounterStore, VoteCounterStore};
use crate::votes::{get_tally, get_total, vote_on_poll};
use crate::ws::poll_results_ws;
use axum::{
    Router,
    extract::Extension,
    http::{
        HeaderValue, Method, StatusCode,
        header::{ACCEPT, CONTENT_TYPE},
    },
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tower_cookies::CookieManagerLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VoteCounterStore>,
    pub hub: TallyHub,
    pub gate: Arc<dyn VoteGate>,
    pub config: Arc<Config>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn VoteCounterStore> = match &config.redis_url {
            Some(redis_url) => {
                info!("Connecting to counter store at {redis_url}");
                Arc::new(
                    RedisCounterStore::connect(
                        redis_url,
                        config.redis_key_prefix.clone(),
                        config.store_timeout,
                    )
                    .await?,
                )
            }
            None => {
                warn!("REDIS_URL not set, counting votes in memory");
                Arc::new(MemoryCounterStore::new())
            }
        };

        let gate: Arc<dyn VoteGate> = if config.one_vote_per_voter {
            Arc::new(OncePerVoterGate::new())
        } else {
            Arc::new(OpenGate)
        };

        Ok(Self::from_parts(config, store, gate))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn VoteCounterStore>,
        gate: Arc<dyn VoteGate>,
    ) -> Self {
        let hub = TallyHub::new(
            store.clone(),
            HubConfig {
                idle_timeout: config.subscriber_idle_timeout,
            },
        );

        AppState {
            store,
            hub,
            gate,
            config: Arc::new(config),
        }
    }
}

pub fn router(app_state: AppState) -> Router {
    let allow_origin = match app_state
        .config
        .cors_origin
        .as_deref()
        .map(HeaderValue::from_str)
    {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(e)) => {
            warn!("Ignoring invalid CORS_ORIGIN: {e}");
            AllowOrigin::mirror_request()
        }
        None => AllowOrigin::mirror_request(),
    };

    Router::new()
        .route("/polls/:poll_id/votes", post(vote_on_poll))
        .route("/polls/:poll_id/tally", get(get_tally))
        .route("/polls/:poll_id/total", get(get_total))
        .route("/polls/:poll_id/updates", get(poll_updates_sse))
        .route("/polls/:poll_id/results", get(poll_results_ws))
        .layer(Extension(app_state))
        .layer(CookieManagerLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(allow_origin)
                .allow_credentials(true)
                .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
                .allow_headers([CONTENT_TYPE, ACCEPT]),
        )
        .layer(TraceLayer::new_for_http())
        .fallback(handler_404)
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "nothing to see here")
}
