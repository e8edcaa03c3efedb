//! The HTTP surface: one endpoint at `/`.
//!
//! `GET /` describes the node (identity, signer group, poly commitments),
//! signed by the node key. `POST /` dispatches on the request action:
//! `SIGN` runs the keeper gauntlet and answers with an encrypted partial,
//! `WATCH` reports the `(genesis, counter)` pair of a watcher key.
//! Successes wrap in `{"data": …}`, failures in `{"error": …}`.

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use tip_core::{SecretKey, hybrid};
use tip_types::{Action, InfoData, InfoSigner, SignData, SignRequest, WatchData};

use crate::AppState;
use crate::api::errors::{ApiError, ApiResult};
use crate::metrics::{METRICS_KEY_SIGN_SUCCESS, METRICS_KEY_WATCH};

pub(crate) mod errors;

pub(crate) fn new_app(state: AppState, max_body_limit: usize) -> Router {
    Router::new()
        .route("/", get(info).post(handle))
        .layer(DefaultBodyLimit::max(max_body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn new_test_app(state: AppState) -> axum_test::TestServer {
    axum_test::TestServer::builder()
        .expect_success_by_default()
        .mock_transport()
        .build(new_app(state, 32 * 1024))
        .unwrap()
}

/// Wraps a payload in the signed response envelope. The signature covers
/// the canonical JSON bytes of the `data` value, which clients can
/// reproduce from the response.
fn signed_envelope<T: Serialize>(secret: &SecretKey, data: T) -> ApiResult<Json<Value>> {
    let value = serde_json::to_value(data).map_err(ApiError::internal)?;
    let payload = serde_json::to_vec(&value).map_err(ApiError::internal)?;
    let signature = secret.sign(&payload);
    Ok(Json(json!({
        "data": value,
        "signature": signature.to_hex(),
    })))
}

#[instrument(level = "debug", skip_all)]
async fn info(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let signers = state
        .signers
        .iter()
        .enumerate()
        .map(|(index, public)| InfoSigner {
            index: index as u32,
            identity: public.to_base58(),
        })
        .collect();
    let commitments = state
        .commitments
        .as_ref()
        .map(|commitments| {
            commitments
                .points()
                .iter()
                .map(|point| point.to_base58())
                .collect()
        })
        .unwrap_or_default();
    let data = InfoData {
        identity: state.identity.to_base58(),
        signers,
        commitments,
    };
    signed_envelope(&state.secret, data)
}

#[instrument(level = "debug", skip_all)]
async fn handle(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request: SignRequest =
        serde_json::from_value(body).map_err(|_| ApiError::bad_request("malformed request"))?;
    match request.action {
        Action::Sign => sign(state, request).await,
        Action::Watch => watch(state, request).await,
    }
}

/// The SIGN path: keeper admission, threshold partial, sign-request
/// recording, and the encrypted response payload
/// `nonce || partial || assignor || genesis || counter`.
async fn sign(state: AppState, request: SignRequest) -> ApiResult<Json<Value>> {
    let admission = state
        .keeper
        .guard(&request.identity, &request.signature, &request.data)?;

    let watcher = hex::decode(&request.watcher).unwrap_or_default();
    if watcher != admission.watcher {
        tracing::debug!(identity = request.identity, "watcher mismatch");
        return Err(ApiError::bad_request("invalid watcher"));
    }

    let share = state
        .share
        .as_ref()
        .ok_or_else(|| ApiError::internal("sign request before the poly share exists"))?;
    let partial = share.partial_sign(&admission.assignor);

    let (genesis, counter) = state
        .storage
        .write_sign_request(&admission.assignor, &admission.watcher)?;

    let mut plain = admission.nonce.to_be_bytes().to_vec();
    plain.extend_from_slice(&partial.to_bytes());
    plain.extend_from_slice(&admission.assignor);
    plain.extend_from_slice(&genesis.to_be_bytes());
    plain.extend_from_slice(&counter.to_be_bytes());
    let cipher = hybrid::encrypt(
        &mut rand::rngs::OsRng,
        &state.secret,
        &admission.identity,
        &plain,
    );

    metrics::counter!(METRICS_KEY_SIGN_SUCCESS).increment(1);
    signed_envelope(
        &state.secret,
        SignData {
            cipher: hex::encode(cipher),
        },
    )
}

/// The WATCH path: a read-only lookup of the watcher's identity state.
async fn watch(state: AppState, request: SignRequest) -> ApiResult<Json<Value>> {
    let watcher = hex::decode(&request.watcher)
        .map_err(|_| ApiError::bad_request("invalid watcher"))?;
    if watcher.len() != 32 {
        return Err(ApiError::bad_request("invalid watcher"));
    }
    let observed = state.storage.watch(&watcher)?;
    let data = observed
        .map(|observed| WatchData {
            genesis: observed.genesis_ns,
            counter: observed.counter,
        })
        .unwrap_or(WatchData {
            genesis: 0,
            counter: 0,
        });
    metrics::counter!(METRICS_KEY_WATCH).increment(1);
    Ok(Json(json!({ "data": data })))
}
