use std::sync::Arc;

use async_trait::async_trait;
use chrono::FixedOffset;
use companion_core::{Period, SystemSettings};
use companion_scheduler::{DeliveryError, Document, ReportPayload, TemplateRenderer};

/// Minimal HTML page: a heading, the covered range and one table row per
/// top-level metric in the payload content.
///
/// Dates are shown in the configured offset, matching the subject line.
pub struct HtmlRenderer {
    settings: Arc<SystemSettings>,
}

impl HtmlRenderer {
    pub fn new(settings: Arc<SystemSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TemplateRenderer for HtmlRenderer {
    async fn render(&self, payload: &ReportPayload) -> Result<Document, DeliveryError> {
        let offset = self
            .settings
            .get()
            .map_err(|e| DeliveryError::Render(e.to_string()))?
            .offset();
        Ok(Document {
            content_type: "text/html; charset=utf-8".to_string(),
            body: render_html(payload, offset),
        })
    }
}

fn render_html(payload: &ReportPayload, offset: FixedOffset) -> String {
    let title = match payload.period {
        Period::Daily => "Daily report",
        Period::Weekly => "Weekly report",
        Period::Monthly => "Monthly report",
    };
    let range = format!(
        "{} to {}",
        payload.range_start.with_timezone(&offset).format("%d/%m/%Y"),
        payload.range_end.with_timezone(&offset).format("%d/%m/%Y")
    );

    let mut rows = String::new();
    match &payload.content {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let shown = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rows.push_str(&format!(
                    "<tr><th>{}</th><td>{}</td></tr>",
                    escape(key),
                    escape(&shown)
                ));
            }
        }
        serde_json::Value::Null => {}
        other => rows.push_str(&format!(
            "<tr><td><pre>{}</pre></td></tr>",
            escape(&other.to_string())
        )),
    }
    if rows.is_empty() {
        rows.push_str("<tr><td>No data recorded for this period.</td></tr>");
    }

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{range}</p><table>{rows}</table></body></html>"
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
