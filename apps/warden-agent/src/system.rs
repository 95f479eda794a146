//! Host identity probe: MAC address of the active interface plus an
//! IP-geolocation lookup.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

const DEFAULT_GEO_URL: &str = "http://ip-api.com/json/";

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
    pub zipcode: Option<String>,
    pub isp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    zip: Option<String>,
    #[serde(default)]
    isp: Option<String>,
}

pub struct SystemProbe {
    client: reqwest::Client,
    geo_url: String,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::with_geo_url(DEFAULT_GEO_URL)
    }

    pub fn with_geo_url(geo_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            geo_url: geo_url.into(),
        }
    }

    /// MAC address of the first non-loopback interface, or the original
    /// protocol's `"Unknown MAC Address"` placeholder when none is found.
    pub fn mac_address(&self) -> String {
        let Ok(interfaces) = if_addrs::get_if_addrs() else {
            return "Error".to_string();
        };
        interfaces
            .iter()
            .find(|iface| !iface.is_loopback())
            .and_then(|iface| read_hardware_address(&iface.name))
            .unwrap_or_else(|| "Unknown MAC Address".to_string())
    }

    /// Geolocation of the agent's public address via the configured lookup
    /// service. Failures come back as an error object, not a transport
    /// error, matching the controller's expectations.
    pub async fn location(&self) -> serde_json::Value {
        match self.fetch_location().await {
            Ok(location) => serde_json::to_value(&location)
                .unwrap_or_else(|_| json!({ "error": "Failed to retrieve location" })),
            Err(err) => {
                warn!(error = %err, "geolocation lookup failed");
                json!({ "error": err })
            }
        }
    }

    async fn fetch_location(&self) -> Result<Location, String> {
        let response = self
            .client
            .get(&self.geo_url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err("Failed to retrieve location".to_string());
        }
        let body: GeoApiResponse = response.json().await.map_err(|err| err.to_string())?;
        if body.status != "success" {
            return Err("Failed to retrieve location".to_string());
        }
        Ok(Location {
            country: body.country,
            city: body.city,
            zipcode: body.zip,
            isp: body.isp,
        })
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn read_hardware_address(interface: &str) -> Option<String> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{interface}/address")).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(not(target_os = "linux"))]
fn read_hardware_address(_interface: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_never_panics() {
        let probe = SystemProbe::new();
        assert!(!probe.mac_address().is_empty());
    }
}
