//! HTTP client for the remedyd API.

use anyhow::{bail, Context, Result};
use remedy_common::{
    Fault, FaultCategory, FaultDetail, HealingStats, HealthResponse, ManualHealResponse,
    ReportRequest, ReportResponse, ResolveRequest, Severity,
};

pub struct DaemonClient {
    base: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .http
            .get(self.url("/v1/health"))
            .send()
            .await
            .context("Is remedyd running? Could not reach the daemon")?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn list_faults(&self) -> Result<Vec<Fault>> {
        let resp = self.http.get(self.url("/v1/faults")).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn fault_detail(&self, category: &str, resource: &str) -> Result<FaultDetail> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/fault/{}/{}", category, resource)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("no such fault: {}/{}", category, resource);
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn heal(&self, category: &str, resource: &str) -> Result<ManualHealResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/v1/fault/{}/{}/heal", category, resource)))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn reset(&self, category: &str, resource: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/v1/fault/{}/{}/reset", category, resource)))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("reset rejected: {}", resp.text().await.unwrap_or_default());
        }
        Ok(())
    }

    pub async fn stats(&self, window_secs: u64) -> Result<HealingStats> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/stats?window_secs={}", window_secs)))
            .send()
            .await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn report(
        &self,
        category: FaultCategory,
        resource: &str,
        severity: Severity,
        evidence: &str,
    ) -> Result<ReportResponse> {
        let resp = self
            .http
            .post(self.url("/v1/fault/report"))
            .json(&ReportRequest {
                category,
                resource: resource.to_string(),
                severity,
                evidence: evidence.to_string(),
            })
            .send()
            .await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn resolve(&self, category: FaultCategory, resource: &str) -> Result<ReportResponse> {
        let resp = self
            .http
            .post(self.url("/v1/fault/resolved"))
            .json(&ResolveRequest {
                category,
                resource: resource.to_string(),
            })
            .send()
            .await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}
