use serde::{Deserialize, Serialize};

use crate::portal::StreamFormat;

#[derive(Debug, Default, Deserialize)]
pub struct PortalQuery {
    pub action: Option<String>,
    pub cmd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalAction {
    Channels,
    Stream,
}

impl PortalAction {
    pub fn parse(action: Option<&str>) -> Option<Self> {
        match action? {
            "channels" => Some(Self::Channels),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub url: String,
    pub manifest_kind: StreamFormat,
}
