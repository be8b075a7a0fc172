//! Service Profiles
//!
//! Static per-service knowledge: how the downloader reports a track identifier and a
//! progress percentage, and how the metadata script's JSON is shaped for the UI and
//! for the downloads database.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{Result, SupervisorError};

/// Streaming services the supervisor knows how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Qobuz,
    Deezer,
    Tidal,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Qobuz, Service::Deezer, Service::Tidal];

    /// Key used by callers, the script map and the persisted `service` column.
    pub fn key(self) -> &'static str {
        match self {
            Service::Qobuz => "qobuz",
            Service::Deezer => "deezer",
            Service::Tidal => "tidal",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Service::Qobuz => "Qobuz",
            Service::Deezer => "Deezer",
            Service::Tidal => "Tidal",
        }
    }

    /// UI channel the per-track details are sent on.
    pub fn details_channel(self) -> &'static str {
        match self {
            Service::Qobuz => "qobuz-details",
            Service::Deezer => "deezer-details",
            Service::Tidal => "tidal-details",
        }
    }

    fn track_id_pattern(self) -> &'static str {
        match self {
            Service::Qobuz | Service::Deezer | Service::Tidal => r"track-id=(\d+)",
        }
    }

    fn progress_pattern(self) -> &'static str {
        match self {
            Service::Qobuz | Service::Deezer | Service::Tidal => r"(\d+\.\d+)%",
        }
    }
}

/// The persistence shape extracted from a metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub download_name: String,
    pub download_artist_or_uploader: String,
    pub download_thumbnail: Option<String>,
}

/// Compiled matchers plus the shaping rules of one service.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    service: Service,
    track_id_re: Regex,
    progress_re: Regex,
}

impl ServiceProfile {
    pub fn new(service: Service) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            service,
            track_id_re: Regex::new(service.track_id_pattern())?,
            progress_re: Regex::new(service.progress_pattern())?,
        })
    }

    pub fn key(&self) -> &'static str {
        self.service.key()
    }

    pub fn display_name(&self) -> &'static str {
        self.service.display_name()
    }

    pub fn details_channel(&self) -> &'static str {
        self.service.details_channel()
    }

    /// Captured track identifier, if the line carries one.
    pub fn match_track_id<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.track_id_re
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Progress percentage, if the line carries one.
    pub fn match_progress(&self, text: &str) -> Option<f64> {
        self.progress_re
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    }

    /// Shape a metadata document into the record stored after a completed download.
    pub fn to_download_info(&self, details: &Value) -> Result<DownloadInfo> {
        let (name, artist, thumbnail) = match self.service {
            Service::Qobuz => ("/title", "/album/artist/name", "/album/image/small"),
            Service::Deezer => ("/title", "/artist/name", "/album/cover_medium"),
            Service::Tidal => ("/title", "/artist", "/thumbnail"),
        };

        Ok(DownloadInfo {
            download_name: required_str(details, name)?,
            download_artist_or_uploader: required_str(details, artist)?,
            download_thumbnail: optional_str(details, thumbnail),
        })
    }

    /// Shape a metadata document into the payload of the `<service>-details` event.
    pub fn to_details_event(&self, details: &Value, order: u64) -> Value {
        match self.service {
            Service::Qobuz => json!({
                "order": order,
                "album": {
                    "maximum_bit_depth": field(details, "/album/maximum_bit_depth"),
                    "image": { "small": field(details, "/album/image/small") },
                    "artist": { "name": field(details, "/album/artist/name") },
                    "maximum_sampling_rate": field(details, "/album/maximum_sampling_rate"),
                },
                "title": field(details, "/title"),
            }),
            Service::Deezer | Service::Tidal => {
                let mut payload = Map::new();
                payload.insert("order".to_string(), json!(order));
                if let Value::Object(fields) = details {
                    payload.extend(fields.clone());
                }
                Value::Object(payload)
            }
        }
    }
}

fn field(details: &Value, pointer: &str) -> Value {
    details.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn optional_str(details: &Value, pointer: &str) -> Option<String> {
    details
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn required_str(details: &Value, pointer: &str) -> Result<String> {
    optional_str(details, pointer).ok_or_else(|| SupervisorError::MetadataParseFailed {
        reason: format!("missing string field {}", pointer),
        raw_output: details.to_string(),
    })
}

/// Read-only lookup table of service profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    profiles: HashMap<&'static str, ServiceProfile>,
}

impl ServiceRegistry {
    pub fn builtin() -> std::result::Result<Self, regex::Error> {
        let mut profiles = HashMap::new();
        for service in Service::ALL {
            profiles.insert(service.key(), ServiceProfile::new(service)?);
        }
        Ok(Self { profiles })
    }

    pub fn profile_for(&self, key: &str) -> Result<&ServiceProfile> {
        self.profiles
            .get(key)
            .ok_or_else(|| SupervisorError::UnsupportedService(key.to_string()))
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.profiles.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::builtin().unwrap()
    }

    #[test]
    fn test_profile_lookup() {
        let reg = registry();
        assert_eq!(reg.profile_for("qobuz").unwrap().display_name(), "Qobuz");
        assert_eq!(reg.keys(), vec!["deezer", "qobuz", "tidal"]);
        assert!(matches!(
            reg.profile_for("napster"),
            Err(SupervisorError::UnsupportedService(key)) if key == "napster"
        ));
    }

    #[test]
    fn test_match_track_id_and_progress() {
        let reg = registry();
        let profile = reg.profile_for("deezer").unwrap();
        assert_eq!(
            profile.match_track_id("Downloading track-id=12345 (1/10)"),
            Some("12345")
        );
        assert_eq!(profile.match_track_id("track-id=abc"), None);
        assert_eq!(profile.match_progress("[#####     ] 45.0%"), Some(45.0));
        // integer percentages are not reported by the downloader's progress bar
        assert_eq!(profile.match_progress("100%"), None);
    }

    #[test]
    fn test_qobuz_shapes() {
        let reg = registry();
        let profile = reg.profile_for("qobuz").unwrap();
        let details = json!({
            "title": "So What",
            "album": {
                "artist": { "name": "Miles Davis" },
                "image": { "small": "https://img/small.jpg", "large": "https://img/large.jpg" },
                "maximum_bit_depth": 24,
                "maximum_sampling_rate": 96.0
            }
        });

        let info = profile.to_download_info(&details).unwrap();
        assert_eq!(info.download_name, "So What");
        assert_eq!(info.download_artist_or_uploader, "Miles Davis");
        assert_eq!(info.download_thumbnail.as_deref(), Some("https://img/small.jpg"));

        let event = profile.to_details_event(&details, 7);
        assert_eq!(event["order"], 7);
        assert_eq!(event["album"]["maximum_bit_depth"], 24);
        assert_eq!(event["album"]["artist"]["name"], "Miles Davis");
        assert!(event["album"]["image"].get("large").is_none());
    }

    #[test]
    fn test_deezer_and_tidal_spread_details() {
        let reg = registry();
        let deezer = reg.profile_for("deezer").unwrap();
        let details = json!({
            "title": "Windowlicker",
            "artist": { "name": "Aphex Twin" },
            "album": { "cover_medium": "https://cover" }
        });
        let info = deezer.to_download_info(&details).unwrap();
        assert_eq!(info.download_artist_or_uploader, "Aphex Twin");
        assert_eq!(info.download_thumbnail.as_deref(), Some("https://cover"));
        let event = deezer.to_details_event(&details, 3);
        assert_eq!(event["order"], 3);
        assert_eq!(event["title"], "Windowlicker");

        let tidal = reg.profile_for("tidal").unwrap();
        let details = json!({ "title": "Teardrop", "artist": "Massive Attack", "thumbnail": "t.jpg" });
        let info = tidal.to_download_info(&details).unwrap();
        assert_eq!(info.download_artist_or_uploader, "Massive Attack");
        assert_eq!(tidal.to_details_event(&details, 1)["thumbnail"], "t.jpg");
    }

    #[test]
    fn test_missing_required_field() {
        let reg = registry();
        let profile = reg.profile_for("tidal").unwrap();
        let err = profile
            .to_download_info(&json!({ "title": "No artist" }))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::MetadataParseFailed { .. }));
    }
}
