use std::fmt;

use serde::Serialize;

/// Name stamped into every export manifest.
pub const TOOL_NAME: &str = "atvault";

/// Compile time build information, filled in by `build.rs`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub build_profile: &'static str,
    pub build_features: &'static str,
    pub build_timestamp: &'static str,
    pub rust_version: &'static str,
    pub version: &'static str,
    pub package_version: &'static str,
}

impl BuildInfo {
    pub fn new() -> Self {
        Self {
            build_profile: env!("ATVAULT_BUILD_PROFILE"),
            build_features: env!("ATVAULT_BUILD_FEATURES"),
            build_timestamp: env!("ATVAULT_BUILD_TIMESTAMP"),
            rust_version: env!("ATVAULT_RUST_VERSION"),
            version: env!("ATVAULT_REPO_VERSION"),
            package_version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Short `tool/version` string recorded in manifests.
    pub fn tool_version(&self) -> String {
        format!("{}/{}", TOOL_NAME, self.package_version)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, profile={}, features={}, built {}, {})",
            TOOL_NAME,
            self.package_version,
            self.version,
            self.build_profile,
            self.build_features,
            self.build_timestamp,
            self.rust_version
        )
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::new()
}

#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo::new()
    };
}
