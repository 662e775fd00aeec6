//! Binary payload stored under each cache key
//!
//! Protobuf message, wire compatible with:
//!
//! ```text
//! message UserApps {
//!     repeated uint64 apps = 1 [packed=true];
//!     optional double lat = 2;
//!     optional double lon = 3;
//! }
//! ```

use prost::Message;

use crate::record::AppsInstalled;

#[derive(Clone, PartialEq, Message)]
pub struct UserApps {
    #[prost(uint64, repeated, tag = "1")]
    pub apps: Vec<u64>,
    #[prost(double, optional, tag = "2")]
    pub lat: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub lon: Option<f64>,
}

impl UserApps {
    /// Serialize to protobuf bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    /// App ids joined by spaces, as written to the dry-run log
    pub fn apps_display(&self) -> String {
        self.apps
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<&AppsInstalled> for UserApps {
    fn from(event: &AppsInstalled) -> Self {
        Self {
            apps: event.apps.clone(),
            lat: Some(event.lat),
            lon: Some(event.lon),
        }
    }
}
