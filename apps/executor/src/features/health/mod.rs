use axum::{response::IntoResponse, routing::get, Json, Router};

pub fn router() -> Router {
    Router::new().route("/healthz", get(health))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "kvm": std::path::Path::new("/dev/kvm").exists(),
        "cpus": num_cpus::get(),
        "time": chrono::Utc::now(),
    }))
}
