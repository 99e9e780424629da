use crate::config::RetryPolicy;
use crate::error::{StoreError, VoteError};
use crate::gate::VoterToken;
use crate::models::{OptionId, PollId, TallySnapshot};
use crate::startup::AppState;
use crate::store::{VoteCounterStore, read_snapshot};
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tower_cookies::{Cookie, Cookies, cookie::time::Duration};
use tracing::{error, info, warn};

pub const VOTER_COOKIE: &str = "voter_id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteRequest {
    pub option_id: OptionId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub option_id: OptionId,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalResponse {
    pub poll_id: PollId,
    pub total: u64,
}

// Reuses the voter's cookie, or mints one on their first vote.
fn voter_token(cookies: &Cookies) -> VoterToken {
    if let Some(cookie) = cookies.get(VOTER_COOKIE).filter(|c| !c.value().is_empty()) {
        return VoterToken::from(cookie.value());
    }

    let token = VoterToken::generate();
    let cookie = Cookie::build((VOTER_COOKIE, token.to_string()))
        .path("/")
        .http_only(true)
        .max_age(Duration::days(30))
        .build();
    cookies.add(cookie);
    token
}

/// Counts one vote, retrying transient store failures with backoff.
pub async fn record_with_retry(
    store: &dyn VoteCounterStore,
    poll_id: &PollId,
    option_id: &OptionId,
    policy: RetryPolicy,
) -> Result<u64, StoreError> {
    let mut retry = 0;
    loop {
        match store.record_vote(poll_id, option_id).await {
            Ok(count) => return Ok(count),
            Err(e) if e.is_transient() && retry < policy.attempts => {
                retry += 1;
                let delay = policy.delay(retry);
                warn!(poll_id = %poll_id, error = %e, retry, ?delay, "retrying vote");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(poll_id = %poll_id, option_id = %option_id, error = %e, "vote not recorded");
                return Err(e);
            }
        }
    }
}

/// Gate, count, then hand the new count to the hub.
///
/// The hub refreshes observers in the background; that never changes the result.
pub async fn submit_vote(
    app_state: &AppState,
    poll_id: &PollId,
    option_id: &OptionId,
    voter: &VoterToken,
) -> Result<u64, VoteError> {
    if !app_state.gate.allow(poll_id, option_id, voter).await {
        info!(poll_id = %poll_id, "duplicate vote rejected");
        return Err(VoteError::Rejected);
    }

    let new_count = match record_with_retry(
        app_state.store.as_ref(),
        poll_id,
        option_id,
        app_state.config.vote_retry,
    )
    .await
    {
        Ok(count) => count,
        Err(e) => {
            app_state.gate.release(poll_id, voter).await;
            return Err(e.into());
        }
    };

    app_state.hub.on_vote_recorded(poll_id, option_id, new_count);
    Ok(new_count)
}

pub async fn vote_on_poll(
    Extension(app_state): Extension<AppState>,
    cookies: Cookies,
    Path(poll_id): Path<PollId>,
    Json(payload): Json<CastVoteRequest>,
) -> Result<impl IntoResponse, VoteError> {
    let voter = voter_token(&cookies);
    let count = submit_vote(&app_state, &poll_id, &payload.option_id, &voter).await?;

    let response = VoteResponse {
        option_id: payload.option_id,
        count,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_tally(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<PollId>,
) -> Result<Json<TallySnapshot>, VoteError> {
    let snapshot = read_snapshot(app_state.store.as_ref(), &poll_id).await?;
    Ok(Json(snapshot))
}

pub async fn get_total(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<PollId>,
) -> Result<Json<TotalResponse>, VoteError> {
    let total = app_state.store.get_total(&poll_id).await?;
    Ok(Json(TotalResponse { poll_id, total }))
}
