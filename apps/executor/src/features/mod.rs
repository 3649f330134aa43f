use axum::{Extension, Router};

use crate::AppState;

pub mod health;
pub mod images;
pub mod inventory;
pub mod network;
pub mod tasks;
pub mod vms;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/node/v1", tasks::routes::router().merge(inventory::router()))
        .layer(Extension(state))
}
