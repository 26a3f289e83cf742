//! Engine and application versions a session reports on start.

use std::fmt;

use serde::Serialize;

pub const REQLET_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub reqlet: &'static str,
    /// Name and version of the application driving the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            reqlet: REQLET_VERSION,
            application: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }
}

/// Renders as a user agent, application first: `render-farm/2.3 reqlet/0.4.0`.
impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(application) = &self.application {
            write!(f, "{application} ")?;
        }
        write!(f, "reqlet/{}", self.reqlet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.reqlet, REQLET_VERSION);
        assert_eq!(info.to_string(), format!("reqlet/{REQLET_VERSION}"));
    }

    #[test]
    fn application_leads_the_user_agent() {
        let info = VersionInfo {
            reqlet: "0.1.0",
            application: None,
        }
        .with_application("render-farm/2.3");
        assert_eq!(info.to_string(), "render-farm/2.3 reqlet/0.1.0");
    }

    #[test]
    fn version_info_serializes() {
        let minimal = VersionInfo {
            reqlet: "0.1.0",
            application: None,
        };
        insta::assert_json_snapshot!("version_minimal", minimal);

        let full = minimal.with_application("render-farm/2.3");
        insta::assert_json_snapshot!("version_full", full);
    }
}
