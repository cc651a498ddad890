use serde::{Deserialize, Serialize};

use crate::client::RankedCandidate;

#[derive(Debug, Serialize)]
pub struct ProxyListResponse {
    pub proxies: Vec<RankedCandidate>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyFailureRequest {
    pub base_url: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyFailureResponse {
    pub base_url: String,
    pub label: String,
    pub failed_at_epoch_ms: i64,
}
