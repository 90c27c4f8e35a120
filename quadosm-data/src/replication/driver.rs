//! The replication loop.

use std::{io::Read, time::Duration};

use chrono::Utc;
use flate2::read::MultiGzDecoder;
use log::{debug, info, warn};
use quadosm_core::{EntityStore, ReplicationState, ReplicationStateStore};
use tokio_util::sync::CancellationToken;

use super::{
    Locator, RemoteState, ReplicationError, ReplicationSource, TransportError,
    source::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT},
};
use crate::applier::{ApplierConfig, ApplySummary, apply_change};

/// Path of the feed's head state document.
pub const HEAD_STATE_PATH: &str = "state.txt";

/// How failed fetches are retried.
///
/// The default makes a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times in total, doubling the delay after
    /// each failure.
    #[must_use]
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Upper bound on any single delay.
    #[must_use]
    pub const fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Total attempts per fetch.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the `attempt`-th failure (one-based).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use quadosm_data::RetryPolicy;
    ///
    /// let policy = RetryPolicy::exponential(5)
    ///     .with_initial_backoff(Duration::from_millis(100))
    ///     .with_max_backoff(Duration::from_millis(300));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(2), Duration::from_millis(200));
    /// assert_eq!(policy.backoff(3), Duration::from_millis(300));
    /// ```
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Settings for [`ReplicationDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    applier: ApplierConfig,
    retry: RetryPolicy,
    unit_limit: Option<u64>,
    poll_interval: Duration,
    user_agent: String,
    timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            applier: ApplierConfig::default(),
            retry: RetryPolicy::default(),
            unit_limit: None,
            poll_interval: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ReplicationConfig {
    /// Settings passed to the changeset applier.
    #[must_use]
    pub const fn with_applier(mut self, applier: ApplierConfig) -> Self {
        self.applier = applier;
        self
    }

    /// Retry behaviour for unit fetches.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stop after applying `limit` units.
    #[must_use]
    pub const fn with_unit_limit(mut self, limit: Option<u64>) -> Self {
        self.unit_limit = limit;
        self
    }

    /// Pause between passes in follow mode.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// User agent for HTTP sources.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Request timeout for HTTP sources.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Applier settings.
    #[must_use]
    pub const fn applier(&self) -> ApplierConfig {
        self.applier
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Unit limit per run, if any.
    #[must_use]
    pub const fn unit_limit(&self) -> Option<u64> {
        self.unit_limit
    }

    /// Follow-mode poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// User agent for HTTP sources.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Request timeout for HTTP sources.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Why a replication run stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The next unit could not be fetched. `sequence` is still the
    /// persisted marker, so the next run retries it.
    SourceExhausted {
        /// Unit that could not be fetched.
        sequence: u64,
        /// Last fetch failure.
        error: TransportError,
    },
    /// The cancellation token fired between units.
    Cancelled,
    /// The configured unit limit was reached.
    UnitLimit,
}

impl StopReason {
    /// Whether the run stopped because the feed has nothing newer.
    #[must_use]
    pub const fn caught_up(&self) -> bool {
        matches!(self, Self::SourceExhausted { error, .. } if error.is_not_found())
    }
}

/// Outcome of [`ReplicationDriver::run`] or [`ReplicationDriver::follow`].
#[derive(Debug)]
pub struct ReplicationReport {
    /// Marker when the run started.
    pub first_sequence: u64,
    /// Marker when the run stopped.
    pub next_sequence: u64,
    /// Units applied.
    pub units_applied: u64,
    /// Counts accumulated over all applied units.
    pub summary: ApplySummary,
    /// Why the run stopped.
    pub stop: StopReason,
}

/// Fetches, applies and records change units one at a time.
///
/// The marker persisted in the store is the next sequence to apply. It
/// only moves after a unit has been applied in full, so a crash or fetch
/// failure leaves it on the unit that still needs work.
pub struct ReplicationDriver<S, R> {
    store: S,
    source: R,
    config: ReplicationConfig,
}

impl<S, R> ReplicationDriver<S, R>
where
    S: EntityStore + ReplicationStateStore,
    R: ReplicationSource,
{
    /// Create a driver over an owned store handle and source.
    pub fn new(store: S, source: R, config: ReplicationConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// The store being updated.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The feed being followed.
    pub fn source(&self) -> &R {
        &self.source
    }

    /// Release the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// The currently persisted marker.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Store`] when the marker cannot be read.
    pub fn state(&self) -> Result<Option<ReplicationState>, ReplicationError> {
        Ok(self.store.replication_state()?)
    }

    /// Persist `sequence` as the next unit to apply.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::SequenceOutOfRange`] for unaddressable
    /// sequences and [`ReplicationError::Store`] when saving fails.
    pub fn start_at(&mut self, sequence: u64) -> Result<ReplicationState, ReplicationError> {
        Locator::new(sequence)?;
        let state = ReplicationState {
            sequence,
            updated_at: Some(Utc::now()),
        };
        self.store.save_replication_state(state)?;
        info!("replication will resume at sequence {sequence}");
        Ok(state)
    }

    /// Fetch and parse the feed's head `state.txt`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Fetch`] or
    /// [`ReplicationError::InvalidState`].
    pub async fn remote_head(&self) -> Result<RemoteState, ReplicationError> {
        let bytes = self
            .source
            .fetch(HEAD_STATE_PATH)
            .await
            .map_err(|source| ReplicationError::Fetch {
                path: HEAD_STATE_PATH.to_owned(),
                source,
            })?;
        let location = format!("{}{HEAD_STATE_PATH}", self.source.location());
        RemoteState::parse(&String::from_utf8_lossy(&bytes), &location)
    }

    /// Start after the feed's latest published unit.
    ///
    /// # Errors
    ///
    /// See [`Self::remote_head`] and [`Self::start_at`].
    pub async fn start_at_head(&mut self) -> Result<ReplicationState, ReplicationError> {
        let head = self.remote_head().await?;
        let first = Locator::new(head.sequence)?.next()?;
        self.start_at(first.sequence())
    }

    /// Apply units until the source runs dry, the unit limit is reached or
    /// `cancel` fires. Cancellation is honoured between units only.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotInitialised`] without a marker, and
    /// [`ReplicationError::Apply`] / [`ReplicationError::Decompress`] when
    /// a fetched unit cannot be applied. Fetch failures are not errors;
    /// they end the run with [`StopReason::SourceExhausted`].
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport, ReplicationError> {
        self.run_with_limit(cancel, self.config.unit_limit).await
    }

    /// Keep running, pausing for the poll interval whenever the source is
    /// exhausted, until `cancel` fires or the unit limit is reached.
    ///
    /// # Errors
    ///
    /// As for [`Self::run`].
    pub async fn follow(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport, ReplicationError> {
        let mut report: Option<ReplicationReport> = None;
        loop {
            let remaining = match (self.config.unit_limit, &report) {
                (Some(limit), Some(so_far)) => Some(limit.saturating_sub(so_far.units_applied)),
                (limit, _) => limit,
            };
            let pass = self.run_with_limit(cancel, remaining).await?;
            let mut merged = match report.take() {
                Some(mut so_far) => {
                    so_far.next_sequence = pass.next_sequence;
                    so_far.units_applied += pass.units_applied;
                    so_far.summary.absorb(&pass.summary);
                    so_far.stop = pass.stop;
                    so_far
                }
                None => pass,
            };
            if let StopReason::SourceExhausted { sequence, error } = &merged.stop {
                if merged.stop.caught_up() {
                    debug!("sequence {sequence} not published yet");
                } else {
                    warn!("fetching sequence {sequence} failed: {error}");
                }
            } else {
                return Ok(merged);
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    merged.stop = StopReason::Cancelled;
                    return Ok(merged);
                }
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
            report = Some(merged);
        }
    }

    async fn run_with_limit(
        &mut self,
        cancel: &CancellationToken,
        limit: Option<u64>,
    ) -> Result<ReplicationReport, ReplicationError> {
        let state = self
            .store
            .replication_state()?
            .ok_or(ReplicationError::NotInitialised)?;
        let first_sequence = state.sequence;
        let mut next_sequence = first_sequence;
        let mut units_applied = 0;
        let mut summary = ApplySummary::default();
        let stop = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if limit.is_some_and(|limit| units_applied >= limit) {
                break StopReason::UnitLimit;
            }
            let locator = Locator::new(next_sequence)?;
            let compressed = match self.fetch_with_retry(&locator.change_path(), cancel).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    break StopReason::SourceExhausted {
                        sequence: next_sequence,
                        error,
                    };
                }
            };
            let unit = self.apply_unit(locator, &compressed)?;
            next_sequence = locator.next()?.sequence();
            self.store.save_replication_state(ReplicationState {
                sequence: next_sequence,
                updated_at: Some(Utc::now()),
            })?;
            info!(
                "applied change unit {locator}: {} created, {} modified, {} deleted",
                unit.created, unit.modified, unit.deleted
            );
            units_applied += 1;
            summary.absorb(&unit);
        };
        Ok(ReplicationReport {
            first_sequence,
            next_sequence,
            units_applied,
            summary,
            stop,
        })
    }

    async fn fetch_with_retry(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            match self.source.fetch(path).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) if error.is_not_found() || attempt >= retry.max_attempts() => {
                    return Err(error);
                }
                Err(error) => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        "fetching {path} failed (attempt {attempt} of {}), retrying in {delay:?}: {error}",
                        retry.max_attempts()
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(error),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn apply_unit(
        &mut self,
        locator: Locator,
        compressed: &[u8],
    ) -> Result<ApplySummary, ReplicationError> {
        let sequence = locator.sequence();
        let mut document = Vec::new();
        MultiGzDecoder::new(compressed)
            .read_to_end(&mut document)
            .map_err(|source| ReplicationError::Decompress { sequence, source })?;
        debug!(
            "applying change unit {locator} ({} bytes uncompressed)",
            document.len()
        );
        apply_change(&mut self.store, document.as_slice(), self.config.applier)
            .map_err(|source| ReplicationError::Apply { sequence, source })
    }
}
