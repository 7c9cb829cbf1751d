use axum::{
    extract::{Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Always 200; failures are reported in the body.
pub async fn score(State(st): State<AppState>, request: Request) -> impl IntoResponse {
    let body = st.service.run(request).await;
    (StatusCode::OK, [(CONTENT_TYPE, "application/json")], body)
}
