use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use companion_core::Period;
use companion_scheduler::{DeliveryError, ReportGenerator, ReportPayload, ReportRequest};
use tracing::{debug, warn};

/// Time window a report for `period` covers when generated at `as_of`.
pub fn report_range(period: Period, as_of: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = match period {
        Period::Daily => as_of - Duration::days(1),
        Period::Weekly => as_of - Duration::days(7),
        Period::Monthly => as_of
            .checked_sub_months(Months::new(1))
            .unwrap_or(as_of - Duration::days(30)),
    };
    (start, as_of)
}

/// Fetches computed report payloads from the analytics service.
///
/// `GET {url}?owner=..&period=..&from=..&to=..` must answer with a
/// `ReportPayload` JSON document.
pub struct HttpReportSource {
    client: reqwest::Client,
    url: String,
}

impl HttpReportSource {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ReportGenerator for HttpReportSource {
    async fn generate(&self, req: &ReportRequest) -> Result<ReportPayload, DeliveryError> {
        let (from, to) = report_range(req.period, req.as_of);
        debug!(period = %req.period, url = %self.url, "fetching report payload");

        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("owner", req.owner_id.clone()),
                ("period", req.period.to_string()),
                ("from", from.to_rfc3339()),
                ("to", to.to_rfc3339()),
            ])
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| DeliveryError::Report(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "report source error");
            return Err(DeliveryError::Report(format!("HTTP {status}: {text}")));
        }

        resp.json::<ReportPayload>()
            .await
            .map_err(|e| DeliveryError::Report(format!("unreadable payload: {e}")))
    }
}

/// Used when no analytics service is configured: a payload carrying only the
/// covered range, so the pipeline can be exercised end to end.
pub struct RangeOnlyReportSource;

#[async_trait]
impl ReportGenerator for RangeOnlyReportSource {
    async fn generate(&self, req: &ReportRequest) -> Result<ReportPayload, DeliveryError> {
        let (range_start, range_end) = report_range(req.period, req.as_of);
        Ok(ReportPayload {
            owner_id: req.owner_id.clone(),
            period: req.period,
            range_start,
            range_end,
            generated_at: req.as_of,
            content: serde_json::json!({}),
        })
    }
}
