//! Push with classified retries.
//!
//! Each attempt hands the whole manifest list to the [`RegistryClient`].
//! Transient failures are retried after a bounded backoff; anything else
//! stops the push at once.

use std::time::Duration;

use manifold_common::{Digest, ImageId};
use manifold_image::{
    ImageReference, ImageStore, PushError, PushOptions, PushRequest, RegistryClient,
    SystemContext,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult, PushFailureKind, Stage};

/// Delay between push attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// The same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// A delay that grows by `multiplier` per attempt, capped at `max_ms`.
    Exponential {
        /// Delay before the first retry, in milliseconds.
        initial_ms: u64,
        /// Growth factor.
        multiplier: f64,
        /// Upper bound on any single delay, in milliseconds.
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let millis = (initial_ms as f64) * multiplier.powi(exponent);
                let capped = if millis.is_finite() {
                    millis.min(max_ms as f64) as u64
                } else {
                    max_ms
                };
                Duration::from_millis(capped)
            }
        }
    }
}

/// Attempt budget and backoff for one push.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Total attempts allowed.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Outcome of one push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The registry accepted the manifest list.
    Success {
        /// Registry digest of the index.
        digest: Digest,
    },
    /// A transient failure.
    Retryable {
        /// Cause.
        cause: PushError,
    },
    /// A failure retrying cannot fix.
    Fatal {
        /// Cause.
        cause: PushError,
    },
}

/// Record of one push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAttempt {
    /// Destination reference.
    pub destination: String,
    /// Attempt number, starting at 1.
    pub number: u32,
    /// What happened.
    pub outcome: AttemptOutcome,
}

/// A successful push.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Registry digest of the pushed index.
    pub digest: Digest,
    /// Every attempt made, the last one successful.
    pub attempts: Vec<PushAttempt>,
}

/// Pushes a stored manifest list with retries.
pub struct PushRetrier<'a> {
    client: &'a dyn RegistryClient,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> PushRetrier<'a> {
    /// Create a retrier.
    #[must_use]
    pub fn new(client: &'a dyn RegistryClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between attempts when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push manifest list `manifest` from `store` to `destination`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Push`] with [`PushFailureKind::Fatal`] if the
    ///   destination does not resolve or an attempt fails fatally.
    /// - [`PipelineError::Push`] with [`PushFailureKind::Retryable`] once
    ///   every attempt has failed transiently.
    /// - [`PipelineError::Store`] if the manifest list cannot be loaded.
    /// - [`PipelineError::Cancelled`] if cancelled between attempts.
    pub async fn push(
        &self,
        store: &dyn ImageStore,
        manifest: &ImageId,
        destination: &str,
        options: &PushOptions,
        system: &SystemContext,
    ) -> PipelineResult<PushOutcome> {
        let reference = ImageReference::parse(destination).map_err(|e| {
            tracing::error!(destination, error = %e, "Push destination does not resolve");
            PipelineError::Push {
                destination: destination.to_string(),
                kind: PushFailureKind::Fatal,
                reason: e.to_string(),
                attempts: Vec::new(),
            }
        })?;

        let index = store.manifest_list(manifest)?;
        let max_attempts = self.policy.max_attempts();
        let mut attempts: Vec<PushAttempt> = Vec::new();

        for number in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage: Stage::Push });
            }

            tracing::info!(
                destination = %reference,
                attempt = number,
                max_attempts,
                "Pushing manifest list"
            );

            let request = PushRequest {
                index: &index,
                destination: &reference,
                store,
                options,
                system,
            };

            let cause = match self.client.push(request).await {
                Ok(digest) => {
                    tracing::info!(destination = %reference, digest = %digest, attempt = number, "Push succeeded");
                    attempts.push(PushAttempt {
                        destination: destination.to_string(),
                        number,
                        outcome: AttemptOutcome::Success {
                            digest: digest.clone(),
                        },
                    });
                    return Ok(PushOutcome { digest, attempts });
                }
                Err(cause) => cause,
            };

            if !cause.is_retryable() {
                tracing::error!(destination = %reference, attempt = number, error = %cause, "Push failed fatally");
                let reason = cause.to_string();
                attempts.push(PushAttempt {
                    destination: destination.to_string(),
                    number,
                    outcome: AttemptOutcome::Fatal { cause },
                });
                return Err(PipelineError::Push {
                    destination: destination.to_string(),
                    kind: PushFailureKind::Fatal,
                    reason,
                    attempts,
                });
            }

            let reason = cause.to_string();
            attempts.push(PushAttempt {
                destination: destination.to_string(),
                number,
                outcome: AttemptOutcome::Retryable { cause },
            });

            if number == max_attempts {
                tracing::error!(destination = %reference, attempts = number, error = %reason, "Push retries exhausted");
                return Err(PipelineError::Push {
                    destination: destination.to_string(),
                    kind: PushFailureKind::Retryable,
                    reason,
                    attempts,
                });
            }

            let delay = self.policy.backoff.delay(number);
            tracing::warn!(
                destination = %reference,
                attempt = number,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Push failed, retrying"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(PipelineError::Cancelled { stage: Stage::Push });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts is at least 1, so the loop always returns
        Err(PipelineError::Push {
            destination: destination.to_string(),
            kind: PushFailureKind::Retryable,
            reason: "no attempts made".to_string(),
            attempts,
        })
    }
}
