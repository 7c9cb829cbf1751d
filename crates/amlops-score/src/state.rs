use std::sync::Arc;

use crate::metrics::Metrics;
use crate::service::ScoringService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScoringService>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(service: ScoringService) -> Self {
        Self {
            service: Arc::new(service),
            metrics: Arc::new(Metrics::default()),
        }
    }
}
