//! HTTP 远端数据源（reqwest）
//!
//! - GET    /api/contracts?updated_since=T&allow_deleted=1
//! - GET    /api/labels?updated_since=T
//! - PATCH  /api/contracts/{id}          {"refresh_policy": 0|100}
//! - PUT    /api/contracts/{id}/labels   {"labelId": n}
//! - DELETE /api/contracts/{id}/labels   {"labelId": n}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ContractMutation, MutationAck, RemoteSource};
use crate::entity::{DeltaResponse, EntityId, Timestamp};
use crate::error::{CaselySDKError, Result};
use crate::sdk::HttpClientConfig;
use crate::sync::EntityKind;

/// 增量拉取 URL；游标为 0 时不带 updated_since（全量）
pub(crate) fn delta_url(base_url: &str, kind: EntityKind, since: Timestamp) -> String {
    let mut url = format!("{}/api/{}", base_url.trim_end_matches('/'), kind.path());
    let mut query: Vec<String> = Vec::new();
    if since > 0 {
        query.push(format!("updated_since={}", since));
    }
    if kind.requires_allow_deleted() {
        query.push("allow_deleted=1".to_string());
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    url
}

/// 修改请求：方法、URL、请求体
pub(crate) fn mutation_request(
    base_url: &str,
    id: EntityId,
    mutation: &ContractMutation,
) -> (Method, String, Value) {
    let contract_url = format!("{}/api/contracts/{}", base_url.trim_end_matches('/'), id);
    match *mutation {
        ContractMutation::SetRefreshPolicy(policy) => (
            Method::PATCH,
            contract_url,
            json!({ "refresh_policy": policy.as_i64() }),
        ),
        ContractMutation::AddLabel(label_id) => (
            Method::PUT,
            format!("{}/labels", contract_url),
            json!({ "labelId": label_id }),
        ),
        ContractMutation::RemoveLabel(label_id) => (
            Method::DELETE,
            format!("{}/labels", contract_url),
            json!({ "labelId": label_id }),
        ),
    }
}

/// 基于 reqwest 的远端数据源
pub struct HttpRemoteSource {
    client: Client,
    base_url: String,
}

impl HttpRemoteSource {
    pub fn new(config: &HttpClientConfig, base_url: impl Into<String>) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| CaselySDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into();
        info!("✅ HTTP 数据源已创建 (base_url: {})", base_url);

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 非 2xx 转为 Remote 错误
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CaselySDKError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_delta(&self, kind: EntityKind, since: Timestamp) -> Result<DeltaResponse> {
        let url = delta_url(&self.base_url, kind, since);
        debug!("拉取增量: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CaselySDKError::Transport(format!("拉取 {} 失败: {}", kind, e)))?;
        let response = Self::check_status(response).await?;

        let delta = response
            .json::<DeltaResponse>()
            .await
            .map_err(|e| CaselySDKError::Transport(format!("解析 {} 增量失败: {}", kind, e)))?;
        debug!(
            "{} 增量: {} 条, max_updated_at={}",
            kind,
            delta.items.len(),
            delta.max_updated_at
        );
        Ok(delta)
    }

    async fn mutate_contract(&self, id: EntityId, mutation: &ContractMutation) -> Result<MutationAck> {
        let (method, url, body) = mutation_request(&self.base_url, id, mutation);
        debug!("提交合同修改: {} {} {}", method, url, body);

        let response = self
            .client
            .request(method, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaselySDKError::Transport(format!("提交合同 {} 修改失败: {}", id, e)))?;
        let response = Self::check_status(response).await?;

        let text = response
            .text()
            .await
            .map_err(|e| CaselySDKError::Transport(format!("读取响应失败: {}", e)))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok(MutationAck::from_body(body))
    }
}
