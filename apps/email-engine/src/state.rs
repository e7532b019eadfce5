use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::provider::EmailProvider;
use crate::store::EmailStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Postgres in production, in-memory when `DATABASE_URL` is unset.
    pub store: Arc<dyn EmailStore>,
    /// Outbound provider. Handlers only use it to cancel provider-side scheduled sends.
    pub provider: Arc<dyn EmailProvider>,
    pub config: Config,
}
