use async_trait::async_trait;
use broker_core::InstanceConfig;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::http::{build_client, json, map_transport};
use crate::{ProviderError, ProviderResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TowerAuth {
    Token(String),
    Basic { username: String, password: String },
}

/// Where and as whom to talk to one AWX/Tower instance.
#[derive(Debug, Clone, PartialEq)]
pub struct TowerTarget {
    pub base_url: String,
    pub auth: TowerAuth,
    /// Inventory whose hosts are the broker's resources.
    pub inventory: Option<u64>,
}

impl TowerTarget {
    pub fn from_instance(instance: &InstanceConfig) -> ProviderResult<Self> {
        let base_url = instance
            .require_str("base_url")?
            .trim_end_matches('/')
            .to_string();

        let auth = match (
            instance.str_setting("token"),
            instance.str_setting("username"),
            instance.str_setting("password"),
        ) {
            (Some(token), _, _) => TowerAuth::Token(token.to_string()),
            (None, Some(username), Some(password)) => TowerAuth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            },
            _ => {
                return Err(ProviderError::InvalidParameters(format!(
                    "instance '{}' needs either 'token' or 'username' and 'password'",
                    instance.name
                )))
            }
        };

        let inventory = match instance.setting("inventory") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                ProviderError::InvalidParameters(format!(
                    "instance '{}' inventory must be a numeric id, got {value}",
                    instance.name
                ))
            })?),
        };

        Ok(Self {
            base_url,
            auth,
            inventory,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2{}", self.base_url, path)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TowerJob {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub failed: bool,
}

impl TowerJob {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status.as_str(),
            "successful" | "failed" | "error" | "canceled"
        )
    }

    pub fn succeeded(&self) -> bool {
        self.status == "successful" && !self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TowerHost {
    pub id: u64,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<TowerHost>,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Template {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Launched {
    #[serde(default)]
    workflow_job: Option<u64>,
    #[serde(default)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WorkflowNode {
    #[serde(default)]
    job: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JobArtifacts {
    #[serde(default)]
    artifacts: Map<String, Value>,
}

/// The slice of the AWX/Tower REST API the broker needs.
#[async_trait]
pub trait TowerApi: Send + Sync {
    async fn find_workflow(&self, target: &TowerTarget, name: &str) -> ProviderResult<Option<u64>>;
    async fn launch_workflow(
        &self,
        target: &TowerTarget,
        template_id: u64,
        extra_vars: &Map<String, Value>,
    ) -> ProviderResult<u64>;
    async fn workflow_job(&self, target: &TowerTarget, job_id: u64) -> ProviderResult<TowerJob>;
    /// Artifacts of every job node of a workflow job, later nodes winning.
    async fn artifacts(&self, target: &TowerTarget, job_id: u64)
        -> ProviderResult<Map<String, Value>>;
    async fn find_host(&self, target: &TowerTarget, name: &str)
        -> ProviderResult<Option<TowerHost>>;
    /// One page of hosts, numbered from 1.
    async fn list_hosts(
        &self,
        target: &TowerTarget,
        page_size: usize,
        page: u64,
    ) -> ProviderResult<HostPage>;
}

pub struct ReqwestTowerApi {
    client: Client,
}

impl ReqwestTowerApi {
    pub fn new(timeout: Option<Duration>) -> ProviderResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    fn authorize(&self, builder: RequestBuilder, target: &TowerTarget) -> RequestBuilder {
        match &target.auth {
            TowerAuth::Token(token) => builder.bearer_auth(token),
            TowerAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        target: &TowerTarget,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let response = self
            .authorize(self.client.get(target.url(path)), target)
            .query(query)
            .send()
            .await
            .map_err(map_transport)?;
        json(response).await
    }

    fn hosts_path(target: &TowerTarget) -> String {
        match target.inventory {
            Some(inventory) => format!("/inventories/{inventory}/hosts/"),
            None => "/hosts/".to_string(),
        }
    }
}

#[async_trait]
impl TowerApi for ReqwestTowerApi {
    async fn find_workflow(&self, target: &TowerTarget, name: &str) -> ProviderResult<Option<u64>> {
        let listing: Listing<Template> = self
            .get(
                target,
                "/workflow_job_templates/",
                &[("name", name.to_string())],
            )
            .await?;
        Ok(listing.results.first().map(|t| t.id))
    }

    async fn launch_workflow(
        &self,
        target: &TowerTarget,
        template_id: u64,
        extra_vars: &Map<String, Value>,
    ) -> ProviderResult<u64> {
        let response = self
            .authorize(
                self.client
                    .post(target.url(&format!("/workflow_job_templates/{template_id}/launch/"))),
                target,
            )
            .json(&json!({ "extra_vars": extra_vars }))
            .send()
            .await
            .map_err(map_transport)?;
        let launched: Launched = json(response).await?;
        launched.workflow_job.or(launched.id).ok_or_else(|| {
            ProviderError::Backend(format!("launch of template {template_id} returned no job id"))
        })
    }

    async fn workflow_job(&self, target: &TowerTarget, job_id: u64) -> ProviderResult<TowerJob> {
        self.get(target, &format!("/workflow_jobs/{job_id}/"), &[])
            .await
    }

    async fn artifacts(
        &self,
        target: &TowerTarget,
        job_id: u64,
    ) -> ProviderResult<Map<String, Value>> {
        let nodes: Listing<WorkflowNode> = self
            .get(
                target,
                &format!("/workflow_jobs/{job_id}/workflow_nodes/"),
                &[("page_size", "200".to_string())],
            )
            .await?;

        let mut merged = Map::new();
        for job in nodes.results.iter().filter_map(|node| node.job) {
            let job: JobArtifacts = self.get(target, &format!("/jobs/{job}/"), &[]).await?;
            merged.extend(job.artifacts);
        }
        Ok(merged)
    }

    async fn find_host(
        &self,
        target: &TowerTarget,
        name: &str,
    ) -> ProviderResult<Option<TowerHost>> {
        let listing: Listing<TowerHost> = self
            .get(target, &Self::hosts_path(target), &[("name", name.to_string())])
            .await?;
        Ok(listing.results.into_iter().find(|host| host.name == name))
    }

    async fn list_hosts(
        &self,
        target: &TowerTarget,
        page_size: usize,
        page: u64,
    ) -> ProviderResult<HostPage> {
        self.get(
            target,
            &Self::hosts_path(target),
            &[
                ("page_size", page_size.to_string()),
                ("page", page.to_string()),
                ("order_by", "name".to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_prefers_token() {
        let instance = InstanceConfig::new("production")
            .with_setting("base_url", "https://tower.example.com/")
            .with_setting("token", "abc")
            .with_setting("username", "admin")
            .with_setting("password", "secret")
            .with_setting("inventory", 7);

        let target = TowerTarget::from_instance(&instance).unwrap();
        assert_eq!(target.auth, TowerAuth::Token("abc".to_string()));
        assert_eq!(target.inventory, Some(7));
        assert_eq!(
            target.url("/hosts/"),
            "https://tower.example.com/api/v2/hosts/"
        );
        assert_eq!(ReqwestTowerApi::hosts_path(&target), "/inventories/7/hosts/");
    }

    #[test]
    fn test_target_requires_credentials() {
        let instance = InstanceConfig::new("staging")
            .with_setting("base_url", "https://tower")
            .with_setting("username", "admin");
        let err = TowerTarget::from_instance(&instance).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidParameters(_)));
    }

    #[test]
    fn test_non_numeric_inventory_rejected() {
        let instance = InstanceConfig::new("staging")
            .with_setting("base_url", "https://tower")
            .with_setting("token", "t")
            .with_setting("inventory", "lab");
        assert!(TowerTarget::from_instance(&instance).is_err());
    }

    #[test]
    fn test_job_terminal_states() {
        let job = |status: &str, failed| TowerJob {
            id: 1,
            status: status.to_string(),
            failed,
        };
        assert!(!job("running", false).is_finished());
        assert!(job("successful", false).succeeded());
        assert!(job("failed", true).is_finished());
        assert!(!job("failed", true).succeeded());
    }

    #[test]
    fn test_host_page_parses() {
        let page: HostPage = serde_json::from_value(serde_json::json!({
            "count": 3,
            "next": "/api/v2/hosts/?page=2",
            "results": [{"id": 1, "name": "vm-1"}, {"id": 2, "name": "vm-2", "enabled": false}]
        }))
        .unwrap();
        assert_eq!(page.results.len(), 2);
        assert!(page.results[0].enabled);
        assert!(!page.results[1].enabled);
    }
}
