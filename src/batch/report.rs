//! Delivery of the per-batch summary to the application backend.

use metrics::counter;

use super::{BatchReport, BatchState};
use crate::http::HttpClient;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct ReportDispatcher<H: HttpClient> {
    upstream: UpstreamClient<H>,
}

impl<H: HttpClient> ReportDispatcher<H> {
    pub fn new(upstream: UpstreamClient<H>) -> Self {
        Self { upstream }
    }

    /// Send the report for a completed batch. Delivery failures are logged and
    /// swallowed; the return value says whether the backend accepted it.
    pub async fn dispatch(&self, batch: &BatchState) -> bool {
        let report = BatchReport::from(batch);
        tracing::info!(
            batch_id = %batch.batch_id,
            success = batch.success_count,
            already_processed = batch.already_processed_count,
            failed = batch.failed_count,
            "Sending bulk upload report"
        );

        match self
            .upstream
            .send_report(batch.batch_id.as_str(), &report, batch.auth_token.as_deref())
            .await
        {
            Ok(()) => {
                counter!("courier_reports_total", "outcome" => "sent").increment(1);
                tracing::info!(batch_id = %batch.batch_id, "Report sent");
                true
            }
            Err(e) => {
                counter!("courier_reports_total", "outcome" => "failed").increment(1);
                tracing::error!(batch_id = %batch.batch_id, error = %e, "Failed to send report");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Classification, OutcomeEvent};
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::job::BatchId;
    use crate::upstream::UpstreamConfig;

    const REPORT: &str = "POST /api/report/send-bulk-upload-report";

    fn completed_batch() -> BatchState {
        let event = OutcomeEvent {
            batch_id: BatchId::from("batch_r"),
            file_name: "a.pdf".to_string(),
            classification: Classification::Failed,
            total_in_batch: 1,
            auth_token: Some("session".to_string()),
            user_id: None,
        };
        let mut batch = BatchState::new(&event);
        batch.record(Classification::Failed, "a.pdf");
        batch
    }

    fn dispatcher(mock: &MockHttpClient) -> ReportDispatcher<MockHttpClient> {
        ReportDispatcher::new(UpstreamClient::new(mock.clone(), UpstreamConfig::default()))
    }

    #[tokio::test]
    async fn test_dispatch_sends_token_and_counts() {
        let mock = MockHttpClient::new();
        mock.respond(REPORT, 200, r#"{"ok":true}"#);

        assert!(dispatcher(&mock).dispatch(&completed_batch()).await);

        let call = &mock.get_calls()[0];
        assert_eq!(call.authorization.as_deref(), Some("session"));
        let body = call.json_body().unwrap();
        assert_eq!(body["failedCount"], 1);
        assert_eq!(body["failedFiles"], serde_json::json!(["a.pdf"]));
    }

    #[tokio::test]
    async fn test_dispatch_swallows_transport_errors() {
        let mock = MockHttpClient::new();
        mock.add_response(
            REPORT,
            Err(crate::error::CourierError::Other(anyhow::anyhow!(
                "connection refused"
            ))),
        );
        mock.add_response(
            REPORT,
            Ok(HttpResponse {
                status: 503,
                body: "unavailable".to_string(),
            }),
        );

        let dispatcher = dispatcher(&mock);
        assert!(!dispatcher.dispatch(&completed_batch()).await);
        assert!(!dispatcher.dispatch(&completed_batch()).await);
    }
}
