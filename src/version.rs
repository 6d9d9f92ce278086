// Version and build information

use std::env;

/// Build information structure
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub build_date: String,
    pub build_hash: String,
    pub target_triple: String,
    pub profile: String,
    pub optimized: bool,
}

/// Crate version baked in at compile time
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// One-line banner logged at startup
pub fn format_header() -> String {
    let build = build_info();
    format!(
        "Procvisor v{} - Process Orchestrator [{}]",
        build.version,
        if build.optimized { "release" } else { "debug" }
    )
}

/// Get current build information
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: version(),
        build_date: option_env!("BUILD_DATE").unwrap_or("unknown").to_string(),
        build_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        target_triple: option_env!("BUILD_TARGET").unwrap_or("unknown").to_string(),
        profile: option_env!("BUILD_PROFILE").unwrap_or("unknown").to_string(),
        optimized: cfg!(not(debug_assertions)),
    }
}

impl BuildInfo {
    pub fn format_display(&self) -> String {
        let mut result = format!("procvisor v{}", self.version);

        if self.build_hash != "unknown" {
            result.push_str(&format!(" (commit {})", self.build_hash));
            if option_env!("GIT_CLEAN") == Some("false") {
                result.push_str(" [dirty]");
            }
        }

        result
    }

    pub fn format_build_info(&self) -> String {
        format!(
            "Build: {}\nTarget: {}\nProfile: {}\nGit: {}\nClean: {}",
            self.build_date,
            self.target_triple,
            self.profile,
            self.build_hash,
            option_env!("GIT_CLEAN").unwrap_or("unknown")
        )
    }
}
