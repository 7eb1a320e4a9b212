//! Built-in content observer that logs captured transactions

use crate::policy::PatternSet;

use super::dispatcher::{ContentObserver, ObserverError};
use super::snapshot::{CapturedRequest, CapturedResponse};

/// Logs one line per transaction whose path matches the configured patterns
pub struct LoggingObserver {
    paths: PatternSet,
}

impl LoggingObserver {
    /// An empty pattern set logs every transaction
    pub fn new(paths: PatternSet) -> Self {
        Self { paths }
    }
}

impl ContentObserver for LoggingObserver {
    fn name(&self) -> &str {
        "transaction-log"
    }

    fn interested(&self, request: &CapturedRequest) -> bool {
        self.paths.matches(request.path())
    }

    fn accept(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
    ) -> Result<(), ObserverError> {
        tracing::info!(
            method = %request.method(),
            uri = %request.uri(),
            host = request.header("host").unwrap_or("-"),
            status = response.status(),
            request_bytes = request.body().len(),
            response_bytes = response.body().len(),
            content_type = response.content_type().unwrap_or("-"),
            "Captured transaction"
        );
        Ok(())
    }
}
