//! Lookup service wire format

use serde::Deserialize;

use crate::types::{GeoInfo, STATUS_SUCCESS};

/// Fields requested from the lookup service
pub const REQUESTED_FIELDS: &str = "status,message,continent,country,countryCode,region,regionName,\
city,district,zip,lat,lon,timezone,currency,isp,org,as,mobile,proxy,hosting,query";

/// One lookup response
#[derive(Debug, Clone, Deserialize)]
pub struct LookupResponse {
    pub status: String,

    /// Failure reason when `status` is not `success`
    #[serde(default)]
    pub message: Option<String>,

    #[serde(flatten)]
    pub geo: GeoInfo,
}

impl LookupResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Whether a failed response is the service refusing for quota reasons
    pub fn is_quota_exhausted(&self) -> bool {
        match &self.message {
            Some(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("quota") || message.contains("rate limit")
            }
            None => false,
        }
    }
}
