//! Collaborators the inspection tools call out to.

use super::{Anomaly, InspectionResult};
use crate::config::BackendConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Produces the photo for an inspection
#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn capture(&self) -> VoiceResult<Vec<u8>>;
}

/// Reads the photo from a JPEG on disk
#[derive(Debug, Clone)]
pub struct FilePhotoSource {
    path: PathBuf,
}

impl FilePhotoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PhotoSource for FilePhotoSource {
    async fn capture(&self) -> VoiceResult<Vec<u8>> {
        let bytes = tokio::fs::read(&self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "photo loaded");
        Ok(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct InspectionRequest {
    pub image: Vec<u8>,
    pub voice_text: String,
    pub equipment_id: String,
    pub equipment_model: String,
}

/// Findings submitted to the task
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub task_id: i64,
    pub inspection_id: i64,
    pub overall_status: String,
    pub operational_impact: String,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartOrderLine {
    pub part_name: String,
    pub component_tag: String,
    pub quantity: u32,
    pub urgency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartsOrder {
    pub inspection_id: i64,
    pub parts: Vec<PartOrderLine>,
}

/// Vision analysis plus findings/parts submission
#[async_trait]
pub trait InspectionBackend: Send + Sync {
    async fn inspect(&self, request: InspectionRequest) -> VoiceResult<InspectionResult>;
    async fn report_anomalies(&self, report: AnomalyReport) -> VoiceResult<Value>;
    async fn order_parts(&self, order: PartsOrder) -> VoiceResult<Value>;
}

/// Talks to the inspection services over HTTP
pub struct HttpInspectionBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpInspectionBackend {
    pub fn new(config: BackendConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, config })
    }

    /// Inspect endpoints to try, in order, without duplicates.
    pub fn candidate_urls(&self) -> Vec<String> {
        let base = self.config.inspect_base_url.trim_end_matches('/');
        let mut urls = Vec::new();
        if let Some(explicit) = self.config.inspect_url.as_deref() {
            urls.push(explicit.trim().to_string());
        }
        urls.push(format!("{base}/inspect"));
        urls.push(base.to_string());
        urls.push(format!("{base}/api/inspect"));

        let mut unique: Vec<String> = Vec::with_capacity(urls.len());
        for url in urls {
            if !url.is_empty() && !unique.contains(&url) {
                unique.push(url);
            }
        }
        unique
    }

    fn form(request: &InspectionRequest) -> VoiceResult<reqwest::multipart::Form> {
        let image = reqwest::multipart::Part::bytes(request.image.clone())
            .file_name("inspection.jpg")
            .mime_str("image/jpeg")?;
        Ok(reqwest::multipart::Form::new()
            .part("image", image)
            .text("voice_text", request.voice_text.clone())
            .text("equipment_id", request.equipment_id.clone())
            .text("equipment_model", request.equipment_model.clone()))
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> VoiceResult<Value> {
        let url = format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(Duration::from_secs(self.config.submit_timeout_secs))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl InspectionBackend for HttpInspectionBackend {
    async fn inspect(&self, request: InspectionRequest) -> VoiceResult<InspectionResult> {
        info!(
            bytes = request.image.len(),
            equipment = %request.equipment_id,
            "📸 Sending photo for inspection"
        );

        let mut errors = Vec::new();
        for url in self.candidate_urls() {
            let attempt = self
                .client
                .post(&url)
                .multipart(Self::form(&request)?)
                .timeout(Duration::from_secs(self.config.inspect_timeout_secs))
                .send()
                .await;

            let response = match attempt {
                Ok(r) => r,
                Err(e) => {
                    errors.push(format!("{url} -> request failed: {e}"));
                    continue;
                }
            };

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                return serde_json::from_str(&body).map_err(|e| {
                    VoiceError::Http(format!("inspect endpoint returned non-JSON success at {url}: {e}"))
                });
            }

            let snippet: String = body.chars().take(120).collect();
            warn!(%url, %status, "inspect endpoint rejected request");
            errors.push(format!("{url} -> {status}: {snippet}"));
        }

        Err(VoiceError::Http(format!(
            "Inspect endpoint failed. {}",
            errors.iter().take(4).cloned().collect::<Vec<_>>().join(" | ")
        )))
    }

    async fn report_anomalies(&self, report: AnomalyReport) -> VoiceResult<Value> {
        info!(
            task = report.task_id,
            anomalies = report.anomalies.len(),
            "📝 Reporting anomalies"
        );
        self.post_json("report-anomalies", &report).await
    }

    async fn order_parts(&self, order: PartsOrder) -> VoiceResult<Value> {
        info!(parts = order.parts.len(), "📦 Ordering parts");
        self.post_json("order-parts", &order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(inspect_url: Option<&str>, base: &str) -> HttpInspectionBackend {
        HttpInspectionBackend::new(BackendConfig {
            inspect_base_url: base.to_string(),
            inspect_url: inspect_url.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_candidate_urls_order() {
        let b = backend(None, "https://vision.example/");
        assert_eq!(
            b.candidate_urls(),
            vec![
                "https://vision.example/inspect",
                "https://vision.example",
                "https://vision.example/api/inspect",
            ]
        );
    }

    #[test]
    fn test_candidate_urls_dedupe_explicit() {
        let b = backend(Some("https://vision.example/inspect"), "https://vision.example");
        assert_eq!(b.candidate_urls().len(), 3);
        assert_eq!(b.candidate_urls()[0], "https://vision.example/inspect");
    }

    #[tokio::test]
    async fn test_file_photo_source_missing_file() {
        let source = FilePhotoSource::new("/nonexistent/inspection.jpg");
        assert!(matches!(source.capture().await, Err(VoiceError::Io(_))));
    }
}
