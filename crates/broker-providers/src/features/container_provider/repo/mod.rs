use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::http::{build_client, check, json, map_transport};
use crate::ProviderResult;

/// Container creation parameters, serialized in Docker Engine API form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    #[serde(skip)]
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub publish_all_ports: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Access to a Docker-compatible container host. `host` is the base URL of
/// the engine API, e.g. `http://localhost:2375`.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn create(&self, host: &str, spec: &ContainerSpec) -> ProviderResult<String>;
    async fn start(&self, host: &str, id: &str) -> ProviderResult<()>;
    async fn inspect(&self, host: &str, id: &str) -> ProviderResult<ContainerInspect>;
    async fn remove(&self, host: &str, id: &str) -> ProviderResult<()>;
    async fn list(
        &self,
        host: &str,
        label: &str,
        limit: usize,
    ) -> ProviderResult<Vec<ContainerSummary>>;
}

pub struct DockerEngineApi {
    client: Client,
}

impl DockerEngineApi {
    pub fn new(timeout: Option<Duration>) -> ProviderResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

fn endpoint(host: &str, path: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), path)
}

#[async_trait]
impl ContainerApi for DockerEngineApi {
    async fn create(&self, host: &str, spec: &ContainerSpec) -> ProviderResult<String> {
        let response = self
            .client
            .post(endpoint(host, "/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .json(spec)
            .send()
            .await
            .map_err(map_transport)?;
        let created: CreateResponse = json(response).await?;
        Ok(created.id)
    }

    async fn start(&self, host: &str, id: &str) -> ProviderResult<()> {
        let response = self
            .client
            .post(endpoint(host, &format!("/containers/{id}/start")))
            .send()
            .await
            .map_err(map_transport)?;
        // 304: already started
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check(response).await.map(|_| ())
    }

    async fn inspect(&self, host: &str, id: &str) -> ProviderResult<ContainerInspect> {
        let response = self
            .client
            .get(endpoint(host, &format!("/containers/{id}/json")))
            .send()
            .await
            .map_err(map_transport)?;
        json(response).await
    }

    async fn remove(&self, host: &str, id: &str) -> ProviderResult<()> {
        let response = self
            .client
            .delete(endpoint(host, &format!("/containers/{id}")))
            .query(&[("force", "true"), ("v", "true")])
            .send()
            .await
            .map_err(map_transport)?;
        check(response).await.map(|_| ())
    }

    async fn list(
        &self,
        host: &str,
        label: &str,
        limit: usize,
    ) -> ProviderResult<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "label": [label] }).to_string();
        let limit = limit.to_string();
        let response = self
            .client
            .get(endpoint(host, "/containers/json"))
            .query(&[
                ("all", "true"),
                ("limit", limit.as_str()),
                ("filters", filters.as_str()),
            ])
            .send()
            .await
            .map_err(map_transport)?;
        json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serializes_in_engine_api_form() {
        let mut labels = BTreeMap::new();
        labels.insert("broker.managed".to_string(), "true".to_string());
        let spec = ContainerSpec {
            name: "broker-1".to_string(),
            image: "ubi9:latest".to_string(),
            env: vec!["A=1".to_string()],
            labels,
            host_config: HostConfig {
                publish_all_ports: true,
                network_mode: None,
            },
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["Image"], "ubi9:latest");
        assert_eq!(value["Labels"]["broker.managed"], "true");
        assert_eq!(value["HostConfig"]["PublishAllPorts"], true);
        assert!(value.get("Name").is_none());
        assert!(value["HostConfig"].get("NetworkMode").is_none());
    }

    #[test]
    fn test_inspect_payload_parses() {
        let inspect: ContainerInspect = serde_json::from_value(serde_json::json!({
            "Id": "abc",
            "Name": "/broker-1",
            "State": {"Status": "running", "Running": true, "Pid": 42}
        }))
        .unwrap();
        assert!(inspect.state.running);
        assert_eq!(inspect.name, "/broker-1");
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://localhost:2375/", "/containers/json"),
            "http://localhost:2375/containers/json"
        );
    }
}
