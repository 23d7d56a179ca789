//! HTTP boundary for the relay.
//!
//! Every route answers with transport status 200 and an
//! [`ApiResponse`](relay_core::ApiResponse) envelope; the envelope's `code`
//! carries the outcome.
//!
//! | Route | Action |
//! |---|---|
//! | `GET /tasks/{sequence\|latest\|0}` | status query |
//! | `POST /payments` | open a `NewPayment` |
//! | `POST /payments/{sequence}/cancel` | cancel a completed payment |
//! | `POST /shops/actions` | open a `ShopAction` |
//! | `GET /healthz` | liveness |

mod handlers;

pub use handlers::Opened;

use axum::routing::{get, post};
use axum::Router;
use relay_core::TaskStateMachine;

#[derive(Clone)]
pub struct RelayState {
    pub engine: TaskStateMachine,
}

pub fn router(engine: TaskStateMachine) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/tasks/:selector", get(handlers::get_task))
        .route("/payments", post(handlers::create_payment))
        .route("/payments/:sequence/cancel", post(handlers::cancel_payment))
        .route("/shops/actions", post(handlers::shop_action))
        .with_state(RelayState { engine })
}
