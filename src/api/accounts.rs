use axum::extract::{Path, State};
use axum::Json;

use crate::api::AppState;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::UserAccount;

/// `GET /accounts/:user_id` returns the balance and applied payment history
pub async fn get_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> PaymentResult<Json<UserAccount>> {
    state
        .store()
        .find_account(&user_id)
        .await?
        .map(Json)
        .ok_or(PaymentError::AccountNotFound(user_id))
}
