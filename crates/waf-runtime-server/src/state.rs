//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across the filter middleware and the health handlers.

use std::sync::Arc;

use crate::analyzer::{Classifier, RequestAnalyzer};
use crate::blocked::BlockDelay;
use waf_runtime_common::FilterConfig;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone, Debug)]
pub struct AppState {
    analyzer: Arc<RequestAnalyzer>,
}

impl AppState {
    /// Create state around a classifier and the filter configuration.
    pub fn new(classifier: Arc<dyn Classifier>, config: FilterConfig) -> Self {
        Self::from_analyzer(RequestAnalyzer::new(classifier, config))
    }

    /// Create state around a prepared analyzer.
    pub fn from_analyzer(analyzer: RequestAnalyzer) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
        }
    }

    /// The request analyzer.
    pub fn analyzer(&self) -> &RequestAnalyzer {
        &self.analyzer
    }

    /// The delay applied to blocked responses.
    pub fn block_delay(&self) -> BlockDelay {
        self.analyzer.block_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use waf_runtime_common::FilterError;
    use waf_runtime_core::{AnalyzeRequestInput, Outcome};

    struct AllowAll;

    #[async_trait]
    impl Classifier for AllowAll {
        async fn analyze_request(&self, _input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
            Ok(Outcome::Allowed)
        }
    }

    #[test]
    fn test_state_shares_analyzer() {
        let state = AppState::new(Arc::new(AllowAll), FilterConfig::default());
        let clone = state.clone();

        assert!(std::ptr::eq(state.analyzer(), clone.analyzer()));
        assert_eq!(state.block_delay(), BlockDelay::new(1000, 1500));
        assert!(state.analyzer().classifier().is_ready());
        assert!(state.analyzer().classifier().pool_stats().is_none());
    }
}
