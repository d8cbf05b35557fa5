//! HTTP API
//!
//! Read views over rounds plus bet placement. `user_id` in requests is
//! trusted; authentication sits in front of this service.

use crate::betting::BetService;
use crate::error::GameError;
use crate::query::{RoundQuery, RoundView};
use crate::types::{
    Bet, Card, CardId, LedgerEntry, LedgerEntryKind, RoundId, Statistics, UserId,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared handler state
pub struct ApiState {
    pub bets: BetService,
    pub rounds: RoundQuery,
}

/// `GameError` rendered as a JSON error body
#[derive(Debug)]
pub struct ApiError(pub GameError);

impl From<GameError> for ApiError {
    fn from(e: GameError) -> Self {
        ApiError(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GameError::InvalidAmount(_) | GameError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GameError::NotFound { .. } => StatusCode::NOT_FOUND,
            GameError::RoundClosed(_) | GameError::InsufficientBalance { .. } => {
                StatusCode::CONFLICT
            }
            GameError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct RoundsParams {
    /// Local calendar date; today when absent
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaceBetBody {
    pub user_id: UserId,
    pub card_id: CardId,
    pub round_id: RoundId,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsParams {
    /// Only entries of this kind, e.g. `WITHDRAW`
    pub kind: Option<LedgerEntryKind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawRequestBody {
    pub amount: Decimal,
    /// Where the payout goes, e.g. a UPI id
    pub destination: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceBody {
    pub user_id: UserId,
    pub balance: Decimal,
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_cards(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<Card>> {
    Ok(Json(state.rounds.cards().await?))
}

async fn list_rounds(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<RoundsParams>,
) -> ApiResult<Vec<RoundView>> {
    let rounds = match params.date {
        Some(date) => state.rounds.rounds_for_date(date).await?,
        None => state.rounds.rounds_today().await?,
    };
    Ok(Json(rounds))
}

async fn current_round(State(state): State<Arc<ApiState>>) -> ApiResult<Option<RoundView>> {
    Ok(Json(state.rounds.current_round().await?))
}

async fn previous_round(State(state): State<Arc<ApiState>>) -> ApiResult<Option<RoundView>> {
    Ok(Json(state.rounds.previous_round().await?))
}

async fn round_detail(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<RoundId>,
) -> ApiResult<RoundView> {
    match state.rounds.round(round_id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(GameError::not_found("Round", round_id).into()),
    }
}

async fn place_bet(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PlaceBetBody>,
) -> std::result::Result<(StatusCode, Json<Bet>), ApiError> {
    let bet = state
        .bets
        .place_bet(body.user_id, body.card_id, body.round_id, body.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(bet)))
}

async fn user_bets(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Vec<Bet>> {
    Ok(Json(state.bets.user_bets(user_id).await?))
}

async fn user_balance(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<BalanceBody> {
    let balance = state.bets.balance(user_id).await?;
    Ok(Json(BalanceBody { user_id, balance }))
}

async fn user_transactions(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<UserId>,
    Query(params): Query<TransactionsParams>,
) -> ApiResult<Vec<LedgerEntry>> {
    Ok(Json(state.bets.ledger_entries(user_id, params.kind).await?))
}

async fn request_withdraw(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<UserId>,
    Json(body): Json<WithdrawRequestBody>,
) -> std::result::Result<(StatusCode, Json<LedgerEntry>), ApiError> {
    let entry = state
        .bets
        .request_withdraw(user_id, body.amount, &body.destination)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn pending_withdrawals(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<LedgerEntry>> {
    Ok(Json(state.bets.pending_withdrawals().await?))
}

async fn statistics(State(state): State<Arc<ApiState>>) -> ApiResult<Statistics> {
    Ok(Json(state.rounds.statistics().await?))
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/cards", get(list_cards))
        .route("/api/rounds", get(list_rounds))
        .route("/api/rounds/current", get(current_round))
        .route("/api/rounds/previous", get(previous_round))
        .route("/api/rounds/{id}", get(round_detail))
        .route("/api/bets", post(place_bet))
        .route("/api/users/{id}/bets", get(user_bets))
        .route("/api/users/{id}/balance", get(user_balance))
        .route("/api/users/{id}/transactions", get(user_transactions))
        .route("/api/users/{id}/withdraw-requests", post(request_withdraw))
        .route("/api/withdraw-requests", get(pending_withdrawals))
        .route("/api/stats", get(statistics))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(
    state: Arc<ApiState>,
    bind: &str,
    shutdown: F,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::storage::{Repositories, RoundRepository};
    use crate::testing::{ManualClock, MemoryStore};
    use crate::types::{NewRound, RoundState};
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<ApiState>) {
        let store = Arc::new(MemoryStore::with_cards(&["A", "B", "C"]));
        store
            .insert(NewRound {
                round_id: 1,
                combo: at(10, 0),
                date_bucket: at(10, 0).date_naive(),
                state: RoundState::Open,
                created_at: at(10, 0),
            })
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(at(10, 20)));
        let repos = Repositories::from_store(store.clone());
        let schedule = ScheduleConfig {
            utc_offset: "+00:00".to_string(),
            ..Default::default()
        };
        let state = Arc::new(ApiState {
            bets: BetService::new(repos.clone(), clock.clone()),
            rounds: RoundQuery::new(repos, clock, &schedule).unwrap(),
        });
        (store, state)
    }

    fn body(user_id: UserId, card_id: CardId, amount: Decimal) -> Json<PlaceBetBody> {
        Json(PlaceBetBody {
            user_id,
            card_id,
            round_id: 1,
            amount,
        })
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError(GameError::InvalidAmount("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError(GameError::not_found("User", 1)).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError(GameError::RoundClosed(1)).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError(GameError::InsufficientBalance {
                available: dec!(1),
                required: dec!(2),
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(GameError::NoCards).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_place_bet_and_read_back() {
        let (store, state) = setup().await;
        let user = store.add_user("u", dec!(50));

        let (status, Json(bet)) = place_bet(State(state.clone()), body(user.id, 2, dec!(20)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(bet.card_id, 2);

        let Json(balance) = user_balance(State(state.clone()), Path(user.id)).await.unwrap();
        assert_eq!(balance.balance, dec!(30));

        let Json(bets) = user_bets(State(state.clone()), Path(user.id)).await.unwrap();
        assert_eq!(bets.len(), 1);

        let Json(current) = current_round(State(state.clone())).await.unwrap();
        let current = current.unwrap();
        assert_eq!(current.total_amount, dec!(20));
        assert_eq!(current.cards[1].bet_count, 1);
    }

    #[tokio::test]
    async fn test_place_bet_rejections_map_to_client_errors() {
        let (store, state) = setup().await;
        let user = store.add_user("u", dec!(5));

        let err = place_bet(State(state.clone()), body(user.id, 1, dec!(10)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = place_bet(State(state.clone()), body(user.id, 9, dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = place_bet(State(state.clone()), body(user.id, 1, dec!(-1)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        store.close(1, at(10, 55)).await.unwrap();
        let err = place_bet(State(state), body(user.id, 1, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err.0, GameError::RoundClosed(1)));
    }

    #[tokio::test]
    async fn test_list_rounds_and_stats() {
        let (_store, state) = setup().await;

        let Json(rounds) = list_rounds(State(state.clone()), Query(RoundsParams { date: None }))
            .await
            .unwrap();
        assert_eq!(rounds.len(), 1);

        let Json(rounds) = list_rounds(
            State(state.clone()),
            Query(RoundsParams {
                date: NaiveDate::from_ymd_opt(2025, 5, 31),
            }),
        )
        .await
        .unwrap();
        assert!(rounds.is_empty());

        let Json(previous) = previous_round(State(state.clone())).await.unwrap();
        assert!(previous.is_none());

        let Json(cards) = list_cards(State(state.clone())).await.unwrap();
        assert_eq!(cards.len(), 3);

        let Json(stats) = statistics(State(state)).await.unwrap();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.cards, 3);
    }

    #[tokio::test]
    async fn test_unknown_user_balance_is_404() {
        let (_store, state) = setup().await;
        let err = user_balance(State(state), Path(77)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_round_detail() {
        let (_store, state) = setup().await;
        let Json(view) = round_detail(State(state.clone()), Path(1)).await.unwrap();
        assert_eq!(view.round_id, 1);
        assert_eq!(view.cards.len(), 3);

        let err = round_detail(State(state), Path(42)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_transactions_and_withdraw_requests() {
        let (store, state) = setup().await;
        let user = store.add_user("u", dec!(50));
        place_bet(State(state.clone()), body(user.id, 1, dec!(5)))
            .await
            .unwrap();

        let (status, Json(entry)) = request_withdraw(
            State(state.clone()),
            Path(user.id),
            Json(WithdrawRequestBody {
                amount: dec!(15),
                destination: "player@upi".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry.amount, dec!(-15));

        let Json(all) = user_transactions(
            State(state.clone()),
            Path(user.id),
            Query(TransactionsParams { kind: None }),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 2);

        let Json(withdrawals) = user_transactions(
            State(state.clone()),
            Path(user.id),
            Query(TransactionsParams {
                kind: Some(LedgerEntryKind::Withdraw),
            }),
        )
        .await
        .unwrap();
        assert_eq!(withdrawals, vec![entry.clone()]);

        let Json(pending) = pending_withdrawals(State(state.clone())).await.unwrap();
        assert_eq!(pending, vec![entry]);

        let err = request_withdraw(
            State(state.clone()),
            Path(user.id),
            Json(WithdrawRequestBody {
                amount: dec!(10),
                destination: String::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = user_transactions(
            State(state),
            Path(404),
            Query(TransactionsParams { kind: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let (_store, state) = setup().await;
        let _router = create_router(state);
    }
}
