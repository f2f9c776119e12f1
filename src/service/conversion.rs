//! HTTP client for the conversion job service.

use super::ConversionService;
use crate::config::TrackerConfig;
use crate::error::ServiceError;
use crate::job::JobSnapshot;
use crate::submit::{Background, DownloadTarget, SubmitRequest};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Submit answers with a list, or a bare record for single uploads.
#[derive(Deserialize)]
#[serde(untagged)]
enum SubmitResponse {
    Many(Vec<JobSnapshot>),
    One(JobSnapshot),
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// [`ConversionService`] over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpConversionService {
    client: Client,
    base_url: String,
    dpi: u32,
    request_timeout_secs: u64,
    download_timeout_secs: u64,
}

impl HttpConversionService {
    pub fn new(config: &TrackerConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            dpi: config.dpi,
            request_timeout_secs: config.request_timeout_secs,
            download_timeout_secs: config.download_timeout_secs,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, timeout_secs: u64) -> Result<Response, ServiceError> {
        let response = request
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, timeout_secs))?;
        check_status(response).await
    }

    fn form(&self, request: &SubmitRequest) -> Result<Form, ServiceError> {
        let mut form = Form::new()
            .text("background_type", request.background.kind())
            .text("dpi", request.dpi.unwrap_or(self.dpi).to_string());
        for doc in &request.documents {
            form = form.part("files", file_part(&doc.name, &doc.bytes)?);
        }
        match request.background {
            Background::None => {}
            Background::Color(ref color) => form = form.text("background_color", color.clone()),
            Background::Image(ref image) => {
                form = form.part("background_image", file_part(&image.name, &image.bytes)?)
            }
        }
        Ok(form)
    }
}

fn file_part(name: &str, bytes: &[u8]) -> Result<Part, ServiceError> {
    let mime = match name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    };
    Part::bytes(bytes.to_vec())
        .file_name(name.to_string())
        .mime_str(mime)
        .map_err(|e| ServiceError::Transport(e.to_string()))
}

/// Map a non-success response to [`ServiceError`].
///
/// 401 is the one status understood as "credential rejected" across every
/// endpoint; everything else carries the body's `detail` when present.
pub(crate) async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ServiceError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| match b.detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("error").to_string());
    Err(ServiceError::Status {
        status: status.as_u16(),
        detail,
    })
}

#[async_trait]
impl ConversionService for HttpConversionService {
    async fn submit(
        &self,
        token: &str,
        request: &SubmitRequest,
    ) -> Result<Vec<JobSnapshot>, ServiceError> {
        let form = self.form(request)?;
        info!(documents = request.documents.len(), background = request.background.kind(), "Submitting documents");
        let response = self
            .send(
                self.client
                    .post(self.url("/tasks"))
                    .bearer_auth(token)
                    .multipart(form),
                self.request_timeout_secs,
            )
            .await?;
        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(match parsed {
            SubmitResponse::Many(jobs) => jobs,
            SubmitResponse::One(job) => vec![job],
        })
    }

    async fn fetch_job(&self, token: &str, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        debug!(job_id, "Fetching job status");
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/tasks/{job_id}")))
                    .bearer_auth(token),
                self.request_timeout_secs,
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }

    async fn download(
        &self,
        token: &str,
        target: &DownloadTarget,
    ) -> Result<Vec<u8>, ServiceError> {
        let path = match target {
            DownloadTarget::Job(id) => format!("/tasks/{id}/download"),
            DownloadTarget::Batch(id) => format!("/batches/{id}/download"),
            DownloadTarget::Original(id) => format!("/tasks/{id}/original"),
        };
        info!("Downloading {}", target);
        let response = self
            .send(
                self.client.get(self.url(&path)).bearer_auth(token),
                self.download_timeout_secs,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, self.download_timeout_secs))?;
        Ok(bytes.to_vec())
    }
}
