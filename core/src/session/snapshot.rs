use serde::Serialize;

/// Point-in-time view of a session, as served by the REST API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub address: String,
    pub port: u16,
    pub local_port: u16,
    pub app_type: String,
    pub app_version: String,
    pub client_class: Option<u8>,
    pub connected_at: String,
    pub connected_secs: u64,
    pub idle_secs: u64,
    pub busy: bool,
    pub requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_skew_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}
