use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crossbar_core::config::{TimeoutClass, TimeoutConfig};
use crossbar_core::{GatewayError, Result};

/// Wall-clock deadline enforcement for the four named timeout classes.
///
/// Cancellation is by drop: when the deadline fires the wrapped future is
/// dropped, which aborts any in-flight awaits inside it.
pub struct TimeoutExecutor {
    config: TimeoutConfig,
}

impl TimeoutExecutor {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn duration(&self, class: TimeoutClass) -> Duration {
        self.config.duration(class)
    }

    /// Run `fut` under the configured deadline for `class`.
    pub async fn run<T, Fut>(&self, class: TimeoutClass, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(class, self.config.duration(class), fut).await
    }

    /// Run `fut` under an explicit deadline, still attributed to `class`.
    pub async fn run_with<T, Fut>(
        &self,
        class: TimeoutClass,
        duration: Duration,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed_ms = duration.as_millis() as u64;
                warn!(%class, elapsed_ms, "operation timed out");
                Err(GatewayError::Timeout { class, elapsed_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_core::ErrorCode;

    fn executor() -> TimeoutExecutor {
        TimeoutExecutor::new(TimeoutConfig {
            connection_ms: 10,
            request_ms: 20,
            operation_ms: 50,
            idle_ms: 100,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn passes_through_inside_deadline() {
        let out = executor()
            .run(TimeoutClass::Request, async { Ok::<_, GatewayError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_with_class_and_duration() {
        let err = executor()
            .run(TimeoutClass::Operation, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, GatewayError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(matches!(
            err,
            GatewayError::Timeout {
                class: TimeoutClass::Operation,
                elapsed_ms: 50
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_duration_overrides_class_default() {
        let err = executor()
            .run_with(
                TimeoutClass::Operation,
                Duration::from_millis(5),
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, GatewayError>(())
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { elapsed_ms: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn inner_error_propagates_unchanged() {
        let err = executor()
            .run(TimeoutClass::Request, async {
                Err::<(), _>(GatewayError::NotFound("channel".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
