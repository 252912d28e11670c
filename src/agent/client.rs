//! HTTP client for the control plane.

use crate::common::{join_path, Error, Result};
use crate::coordinator::http::{UseRequest, VolumeGet, VolumeList, VolumeRequest};
use crate::coordinator::metadata::{RequestCreate, VolumeConfig};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct MasterClient {
    base_url: String,
    http: reqwest::Client,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B, volume: &str) -> Result<Response> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        check(response, volume).await
    }

    pub async fn create(&self, req: &RequestCreate) -> Result<VolumeConfig> {
        let volume = join_path(&req.tenant, &req.volume);
        Ok(self.post("/create", req, &volume).await?.json().await?)
    }

    /// Fetch a volume record. Absent volumes are [`Error::VolumeNotFound`].
    pub async fn request(&self, tenant: &str, volume: &str) -> Result<VolumeConfig> {
        let body = VolumeRequest {
            tenant: tenant.to_string(),
            volume: volume.to_string(),
        };
        let name = join_path(tenant, volume);
        Ok(self.post("/request", &body, &name).await?.json().await?)
    }

    pub async fn mount(&self, req: &UseRequest) -> Result<()> {
        self.post("/mount", req, &join_path(&req.tenant, &req.volume))
            .await?;
        Ok(())
    }

    pub async fn mount_report(&self, req: &UseRequest) -> Result<()> {
        self.post("/mount-report", req, &join_path(&req.tenant, &req.volume))
            .await?;
        Ok(())
    }

    pub async fn unmount(&self, req: &UseRequest) -> Result<()> {
        self.post("/unmount", req, &join_path(&req.tenant, &req.volume))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, tenant: &str, volume: &str) -> Result<()> {
        let body = VolumeRequest {
            tenant: tenant.to_string(),
            volume: volume.to_string(),
        };
        self.post("/remove", &body, &join_path(tenant, volume))
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<VolumeList> {
        let response = self.http.get(self.url("/list")).send().await?;
        Ok(check(response, "").await?.json().await?)
    }

    pub async fn get(&self, tenant: &str, volume: &str) -> Result<VolumeGet> {
        let name = join_path(tenant, volume);
        let response = self
            .http
            .get(self.url(&format!("/get/{}", name)))
            .send()
            .await?;
        Ok(check(response, &name).await?.json().await?)
    }
}

/// Map error statuses back onto [`Error`].
async fn check(response: Response, volume: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(Error::VolumeNotFound(volume.to_string())),
        StatusCode::CONFLICT => Err(Error::LockHeld {
            volume: volume.to_string(),
        }),
        StatusCode::BAD_REQUEST => Err(Error::MalformedRequest(body)),
        StatusCode::REQUEST_TIMEOUT => Err(Error::Timeout(body)),
        _ => Err(Error::Http(format!("{}: {}", status, body))),
    }
}
