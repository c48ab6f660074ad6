//! Payment observer that reports retries through `tracing`.

use relay402::payment::BoxFuture;
use relay402::{ObserverError, PaymentEvent, PaymentObserver, RetryOutcome};

/// Logs every [`PaymentEvent`]. The credential and caller token are never
/// written out.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PaymentObserver for TracingObserver {
    fn on_payment_event<'a>(
        &'a self,
        event: &'a PaymentEvent,
    ) -> BoxFuture<'a, Result<(), ObserverError>> {
        Box::pin(async move {
            let method = event
                .original_message
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or("-");
            match event.outcome {
                RetryOutcome::RetriedSuccess | RetryOutcome::Delivered => tracing::info!(
                    outcome = %event.outcome,
                    status = event.result_status,
                    upstream = %event.upstream_url,
                    method,
                    "Paid retry delivered"
                ),
                RetryOutcome::RetriedChallenge => tracing::warn!(
                    outcome = %event.outcome,
                    status = event.result_status,
                    upstream = %event.upstream_url,
                    method,
                    "Paid retry challenged again"
                ),
                RetryOutcome::RetryTransportError => tracing::warn!(
                    outcome = %event.outcome,
                    error = event.result_error.as_deref().unwrap_or("unknown"),
                    upstream = %event.upstream_url,
                    method,
                    "Paid retry failed in transport"
                ),
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(outcome: RetryOutcome) -> PaymentEvent {
        PaymentEvent {
            upstream_url: "https://tools.example.com/mcp".to_owned(),
            caller_token: None,
            original_message: json!({ "method": "tools/call" }),
            credential: "cred".to_owned(),
            challenge_payload: json!({}),
            retry_challenge_payload: None,
            result_status: Some(200),
            result_error: None,
            outcome,
        }
    }

    #[tokio::test]
    async fn accepts_every_outcome() {
        for outcome in [
            RetryOutcome::Delivered,
            RetryOutcome::RetriedSuccess,
            RetryOutcome::RetriedChallenge,
            RetryOutcome::RetryTransportError,
        ] {
            assert!(TracingObserver.on_payment_event(&event(outcome)).await.is_ok());
        }
    }
}
