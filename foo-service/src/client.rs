use async_trait::async_trait;
use health::{CheckError, Checkable};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::error::ClientError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub id: u64,
    pub value: i64,
}

/// The upstream service the foo DAL reads bars from.
#[async_trait]
pub trait FooApi: Send + Sync {
    async fn get_bar(&self, id: u64) -> Result<Bar, ClientError>;
}

/// Client for the foo API. Requests are stubbed out: every bar comes back
/// with its default value.
pub struct FooClient {
    host: Url,
    service_name: String,
}

impl FooClient {
    pub fn new(host: &str, service_name: &str) -> Result<Self, ClientError> {
        let host = Url::parse(host).map_err(|error| ClientError::InvalidHost {
            host: host.to_owned(),
            error,
        })?;
        if !matches!(host.scheme(), "http" | "https") {
            return Err(ClientError::UnsupportedScheme(host.to_string()));
        }

        Ok(Self {
            host,
            service_name: service_name.to_owned(),
        })
    }

    pub fn host(&self) -> &Url {
        &self.host
    }
}

#[async_trait]
impl FooApi for FooClient {
    async fn get_bar(&self, id: u64) -> Result<Bar, ClientError> {
        debug!(host = %self.host, caller = %self.service_name, id, "fetching bar");
        Ok(Bar { id, value: 0 })
    }
}

#[async_trait]
impl Checkable for FooClient {
    async fn status(&self) -> Result<Value, CheckError> {
        Ok(json!({"status": "ok", "host": self.host.as_str()}))
    }
}
