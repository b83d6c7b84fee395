//! Per-request filtering decision.
//!
//! [`RequestAnalyzer`] runs the local pre-filters, consults the verified
//! bot cache and finally asks the guest. Whatever goes wrong on the guest
//! side, the request is forwarded: only a pre-filter rejection or an
//! explicit `blocked` outcome blocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::allowed_bots::AllowedBotIps;
use crate::blocked::BlockDelay;
use crate::prefilter::{self, BlockReason};
use crate::request::RequestSnapshot;
use waf_runtime_common::{FilterConfig, FilterError};
use waf_runtime_core::{AnalyzeRequestInput, Outcome, PoolStats};
use waf_runtime_host::RuntimeHandle;

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the request to the next handler.
    Forward,
    /// Answer with the blocked response.
    Block(BlockReason),
}

/// Source of guest verdicts.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// Classify one request.
    async fn analyze_request(&self, input: &AnalyzeRequestInput) -> Result<Outcome, FilterError>;

    /// Whether requests can currently be classified.
    fn is_ready(&self) -> bool {
        true
    }

    /// Instance pool occupancy, when there is a pool.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl Classifier for RuntimeHandle {
    async fn analyze_request(&self, input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
        RuntimeHandle::analyze_request(self, input).await
    }

    fn is_ready(&self) -> bool {
        !self.pool().is_closed()
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.stats())
    }
}

/// Decides, for every request, whether it is forwarded or blocked.
pub struct RequestAnalyzer {
    classifier: Arc<dyn Classifier>,
    config: FilterConfig,
    allowed_bots: AllowedBotIps,
    block_delay: BlockDelay,
    analysis_timeout: Duration,
}

impl RequestAnalyzer {
    /// Create an analyzer asking `classifier` for verdicts.
    pub fn new(classifier: Arc<dyn Classifier>, config: FilterConfig) -> Self {
        Self {
            classifier,
            allowed_bots: AllowedBotIps::from_config(&config),
            block_delay: BlockDelay::from_config(&config),
            analysis_timeout: config.analysis_timeout(),
            config,
        }
    }

    /// Replace the delay applied to blocked responses.
    #[must_use]
    pub fn with_block_delay(mut self, block_delay: BlockDelay) -> Self {
        self.block_delay = block_delay;
        self
    }

    /// Decide on one request.
    #[instrument(
        skip_all,
        fields(ip_address = %snapshot.client.ip, path = %String::from_utf8_lossy(&snapshot.path))
    )]
    pub async fn analyze(&self, snapshot: &RequestSnapshot) -> Verdict {
        let screened = match prefilter::check(&self.config, snapshot) {
            Ok(screened) => screened,
            Err(reason) => {
                debug!(reason = %reason, country = %snapshot.client.country_code, "Request blocked by pre-filter");
                return Verdict::Block(reason);
            }
        };

        let ip = snapshot.client.ip;
        if self.allowed_bots.contains(&ip) {
            debug!("Verified bot address, skipping guest");
            return Verdict::Forward;
        }

        let input = snapshot.to_input(screened);

        let outcome = match self.classify(&input).await {
            Ok(outcome) => outcome,
            Err(e) => return on_error(&e, &input),
        };
        debug!(outcome = ?outcome, "Guest verdict");

        match outcome {
            Outcome::Allowed => Verdict::Forward,
            Outcome::VerifiedBot => {
                self.allowed_bots.insert(ip);
                info!(user_agent = %input.user_agent, asn = input.asn, "Verified bot address cached");
                Verdict::Forward
            }
            Outcome::Blocked => Verdict::Block(BlockReason::Guest),
            Outcome::Unrecognized => on_error(&FilterError::UnknownOutcome, &input),
        }
    }

    /// Ask the classifier, waiting at most the analysis deadline.
    ///
    /// The call runs on its own task, so a verdict that arrives late is
    /// dropped but the guest call itself still runs to completion.
    async fn classify(&self, input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
        let classifier = Arc::clone(&self.classifier);
        let call_input = input.clone();
        let call = tokio::spawn(async move { classifier.analyze_request(&call_input).await });

        match tokio::time::timeout(self.analysis_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(FilterError::Aborted(e.to_string())),
            Err(_) => Err(FilterError::Timeout(
                u64::try_from(self.analysis_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Delay applied before blocked responses.
    pub fn block_delay(&self) -> BlockDelay {
        self.block_delay
    }

    /// Verified bot addresses.
    pub fn allowed_bots(&self) -> &AllowedBotIps {
        &self.allowed_bots
    }

    /// The verdict source.
    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// The filter configuration.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

impl std::fmt::Debug for RequestAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAnalyzer")
            .field("config", &self.config)
            .field("allowed_bots", &self.allowed_bots.len())
            .field("block_delay", &self.block_delay)
            .field("analysis_timeout", &self.analysis_timeout)
            .finish_non_exhaustive()
    }
}

/// Fail-open policy: log the failure and forward the request.
pub fn on_error(error: &FilterError, input: &AnalyzeRequestInput) -> Verdict {
    error!(
        error = %error,
        user_agent = %input.user_agent,
        ip_address = %input.ip_address,
        asn = input.asn,
        "Request analysis failed, forwarding request"
    );
    Verdict::Forward
}
