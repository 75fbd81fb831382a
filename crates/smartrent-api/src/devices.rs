// REST device discovery
//
// Used when no explicit device ids are configured: walk every hub on the
// account and collect the locks and thermostats attached to it.

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::auth::AccessToken;
use crate::client::ApiClient;
use crate::error::Error;

/// Device type strings the service uses for the kinds we support.
pub const LOCK_TYPE: &str = "entry_control";
pub const THERMOSTAT_TYPE: &str = "thermostat";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hub {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub online: Option<bool>,
}

/// A device as reported by the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDevice {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub online: Option<bool>,
}

impl RemoteDevice {
    pub fn is_supported(&self) -> bool {
        matches!(self.device_type.as_str(), LOCK_TYPE | THERMOSTAT_TYPE)
    }
}

impl ApiClient {
    pub async fn list_hubs(&self, token: &AccessToken) -> Result<Vec<Hub>, Error> {
        self.get("/api/v2/hubs", token.secret()).await
    }

    pub async fn list_hub_devices(
        &self,
        token: &AccessToken,
        hub_id: &str,
    ) -> Result<Vec<RemoteDevice>, Error> {
        self.get(&format!("/api/v2/hubs/{hub_id}/devices"), token.secret())
            .await
    }

    /// Every supported device across all hubs, in hub order.
    pub async fn discover_devices(&self, token: &AccessToken) -> Result<Vec<RemoteDevice>, Error> {
        let hubs = self.list_hubs(token).await?;
        let mut devices = Vec::new();
        for hub in &hubs {
            let all = self.list_hub_devices(token, &hub.id).await?;
            let total = all.len();
            devices.extend(all.into_iter().filter(RemoteDevice::is_supported));
            debug!(hub = %hub.id, total, "listed hub devices");
        }
        debug!(hubs = hubs.len(), supported = devices.len(), "discovery complete");
        Ok(devices)
    }
}

/// Ids arrive as JSON numbers from some endpoints and strings from others.
pub(crate) fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Num(u64),
        Str(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Num(n) => n.to_string(),
        Id::Str(s) => s,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_accept_numbers_and_strings() {
        let a: RemoteDevice =
            serde_json::from_str(r#"{"id": 42, "name": "Front Door", "type": "entry_control"}"#)
                .unwrap();
        let b: RemoteDevice =
            serde_json::from_str(r#"{"id": "t-1", "type": "thermostat", "online": true}"#).unwrap();
        assert_eq!(a.id, "42");
        assert_eq!(b.id, "t-1");
        assert!(a.is_supported() && b.is_supported());
    }

    #[test]
    fn other_types_are_unsupported() {
        let d: RemoteDevice =
            serde_json::from_str(r#"{"id": 7, "type": "switch_binary"}"#).unwrap();
        assert!(!d.is_supported());
    }
}
