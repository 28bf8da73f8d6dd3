use async_trait::async_trait;
use companion_scheduler::{DeliveryError, DeliveryTransport, Document, SendReceipt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Resend-compatible HTTP e-mail API (`POST {base_url}/emails`).
pub struct ResendTransport {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl ResendTransport {
    pub fn new(api_key: String, from: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            from,
            base_url: base_url.unwrap_or_else(|| "https://api.resend.com".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: Option<String>,
}

fn build_request<'a>(
    from: &'a str,
    address: &'a str,
    subject: &'a str,
    document: &'a Document,
) -> SendEmailRequest<'a> {
    let is_html = document.content_type.starts_with("text/html");
    SendEmailRequest {
        from,
        to: [address],
        subject,
        html: is_html.then_some(document.body.as_str()),
        text: (!is_html).then_some(document.body.as_str()),
    }
}

#[async_trait]
impl DeliveryTransport for ResendTransport {
    fn name(&self) -> &str {
        "resend"
    }

    async fn send(
        &self,
        address: &str,
        subject: &str,
        document: &Document,
    ) -> Result<SendReceipt, DeliveryError> {
        let url = format!("{}/emails", self.base_url.trim_end_matches('/'));
        let body = build_request(&self.from, address, subject, document);

        debug!(%address, "sending e-mail via Resend");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Resend API error");
            return Err(DeliveryError::Transport(format!("HTTP {status}: {text}")));
        }

        let parsed: SendEmailResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("unreadable response: {e}")))?;
        Ok(SendReceipt {
            message_id: parsed.id,
        })
    }
}

/// Placeholder transport when no e-mail API is configured: logs and succeeds.
pub struct DryRunTransport;

#[async_trait]
impl DeliveryTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(
        &self,
        address: &str,
        subject: &str,
        document: &Document,
    ) -> Result<SendReceipt, DeliveryError> {
        info!(
            %address,
            %subject,
            bytes = document.body.len(),
            "dry run: e-mail not sent"
        );
        Ok(SendReceipt { message_id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content_type: &str) -> Document {
        Document {
            content_type: content_type.into(),
            body: "<p>hi</p>".into(),
        }
    }

    #[test]
    fn html_documents_use_html_field() {
        let d = doc("text/html; charset=utf-8");
        let req = build_request("r@x.io", "a@x.io", "Daily report", &d);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["to"], serde_json::json!(["a@x.io"]));
        assert_eq!(json["html"], "<p>hi</p>");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn other_documents_use_text_field() {
        let d = doc("text/plain");
        let json = serde_json::to_value(build_request("r@x.io", "a@x.io", "s", &d)).unwrap();
        assert!(json.get("html").is_none());
        assert_eq!(json["text"], "<p>hi</p>");
    }

    #[test]
    fn response_id_is_optional() {
        let r: SendEmailResponse = serde_json::from_str(r#"{"id":"abc"}"#).unwrap();
        assert_eq!(r.id.as_deref(), Some("abc"));
        let r: SendEmailResponse = serde_json::from_str("{}").unwrap();
        assert!(r.id.is_none());
    }

    #[tokio::test]
    async fn dry_run_always_succeeds() {
        let receipt = DryRunTransport
            .send("a@x.io", "subject", &doc("text/html"))
            .await
            .unwrap();
        assert_eq!(receipt.message_id, None);
    }
}
