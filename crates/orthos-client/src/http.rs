//! HTTP client for the orthos daemon

use orthos_api::requests::{
    ActionRequest, EnqueueTaskRequest, RegisterMachineRequest, UpdateSystemRequest,
    ValidateConfigurationRequest,
};
use orthos_api::responses::{
    ArchitectureEntry, CancelTaskResponse, EnqueueTaskResponse, ErrorResponse, HealthResponse,
    MachineResponse, PaginatedResponse, ReservationRecordResponse, StatisticsResponse,
    TaskResponse, ValidationResponse,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// HTTP client for communicating with the orthos daemon
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: Url,
}

impl HttpClient {
    /// Create a new HTTP client
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new HTTP client with a custom `reqwest::Client`
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn with_client(base_url: impl AsRef<str>, client: Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with the scheme switched to `ws`/`wss` and `path` appended
    ///
    /// # Errors
    /// Returns an error if the path cannot be joined.
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::WebSocket(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(ClientError::Url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(error) => (error.code, error.message),
            Err(_) => (String::from("UNKNOWN"), body),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)?).send().await?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: impl serde::Serialize,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path)?)
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: impl serde::Serialize) -> Result<T> {
        let response = self
            .client
            .put(self.url(path)?)
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    // System endpoints

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    /// Check an architecture/system pair without touching any machine
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn validate(&self, architecture: &str, system: &str) -> Result<ValidationResponse> {
        let request = ValidateConfigurationRequest {
            architecture: architecture.to_string(),
            system: system.to_string(),
        };
        self.post("/validate", request).await
    }

    /// Full compatibility map
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn architectures(&self) -> Result<Vec<ArchitectureEntry>> {
        self.get("/architectures").await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn statistics(&self) -> Result<StatisticsResponse> {
        self.get("/statistics").await
    }

    // Machine endpoints

    #[must_use]
    pub fn list_machines(&self) -> ListMachinesBuilder {
        ListMachinesBuilder::new(self.clone())
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn get_machine(&self, id: &str) -> Result<MachineResponse> {
        self.get(&format!("/machines/{id}")).await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon rejects the record.
    pub async fn register_machine(
        &self,
        request: RegisterMachineRequest,
    ) -> Result<MachineResponse> {
        self.post("/machines", request).await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon rejects the system.
    pub async fn update_system(&self, id: &str, system: &str) -> Result<MachineResponse> {
        let request = UpdateSystemRequest {
            system: system.to_string(),
        };
        self.put(&format!("/machines/{id}/system"), request).await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn reservation_history(&self, id: &str) -> Result<Vec<ReservationRecordResponse>> {
        self.get(&format!("/machines/{id}/history")).await
    }

    // Task endpoints

    /// Queue an action against a machine
    ///
    /// # Errors
    /// Returns `ClientError::Api` with status 422 for validation failures and
    /// 409 for reservation conflicts.
    pub async fn enqueue_task(
        &self,
        machine_id: &str,
        action: ActionRequest,
        requested_by: &str,
    ) -> Result<EnqueueTaskResponse> {
        let request = EnqueueTaskRequest {
            action,
            requested_by: requested_by.to_string(),
        };
        self.post(&format!("/machines/{machine_id}/tasks"), request)
            .await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn get_task(&self, id: Uuid) -> Result<TaskResponse> {
        self.get(&format!("/tasks/{id}")).await
    }

    /// Tasks, optionally narrowed to one machine and/or state
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn list_tasks(
        &self,
        machine: Option<&str>,
        state: Option<&str>,
    ) -> Result<Vec<TaskResponse>> {
        let mut url = self.url("/tasks")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(machine) = machine {
                query.append_pair("machine", machine);
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn cancel_task(&self, id: Uuid) -> Result<CancelTaskResponse> {
        self.post(&format!("/tasks/{id}/cancel"), serde_json::json!({}))
            .await
    }
}

/// Builder for listing machines with filters
#[derive(Debug, Clone)]
pub struct ListMachinesBuilder {
    client: HttpClient,
    page: Option<u64>,
    per_page: Option<u64>,
    architecture: Option<String>,
    status: Option<String>,
    reserved_by: Option<String>,
    free: bool,
    query: Option<String>,
}

impl ListMachinesBuilder {
    fn new(client: HttpClient) -> Self {
        Self {
            client,
            page: None,
            per_page: None,
            architecture: None,
            status: None,
            reserved_by: None,
            free: false,
            query: None,
        }
    }

    #[must_use]
    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    #[must_use]
    pub fn per_page(mut self, per_page: u64) -> Self {
        self.per_page = Some(per_page);
        self
    }

    #[must_use]
    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    /// Effective status, e.g. `reachable` or `reserved`
    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn reserved_by(mut self, owner: impl Into<String>) -> Self {
        self.reserved_by = Some(owner.into());
        self
    }

    /// Only unreserved machines outside maintenance
    #[must_use]
    pub fn free(mut self) -> Self {
        self.free = true;
        self
    }

    /// Case-insensitive fqdn substring
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    fn build_url(&self) -> Result<Url> {
        let mut url = self.client.url("/machines")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(page) = self.page {
                query.append_pair("page", &page.to_string());
            }
            if let Some(per_page) = self.per_page {
                query.append_pair("per_page", &per_page.to_string());
            }
            if let Some(architecture) = &self.architecture {
                query.append_pair("arch", architecture);
            }
            if let Some(status) = &self.status {
                query.append_pair("status", status);
            }
            if let Some(owner) = &self.reserved_by {
                query.append_pair("reserved_by", owner);
            }
            if self.free {
                query.append_pair("free", "true");
            }
            if let Some(q) = &self.query {
                query.append_pair("q", q);
            }
        }
        Ok(url)
    }

    /// Execute the request
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn send(self) -> Result<PaginatedResponse<MachineResponse>> {
        let url = self.build_url()?;
        let response = self.client.client.get(url).send().await?;
        HttpClient::decode(response).await
    }
}
