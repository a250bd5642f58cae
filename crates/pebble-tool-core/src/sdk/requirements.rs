//! Declared-requirement checking for SDK bundles.
//!
//! An SDK manifest declares requirements like `qemu>=2.5.0`: a component
//! name followed by a semver constraint. Before an install is allowed to
//! touch the disk, every requirement is checked against what is discoverable
//! on the local machine; anything unmet (or unrecognized) aborts the
//! install.

use crate::config::EnvVars;
use crate::{Result, ToolError};
use regex::Regex;
use semver::{Version, VersionReq};
use std::env;
use std::process::Command;
use tracing::debug;

/// One declared requirement: a component name and a version constraint.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub component: String,
    pub constraint: VersionReq,
    raw: String,
}

impl Requirement {
    /// Parse a requirement string such as `phonesim>=1.0.6`.
    pub fn parse(raw: &str) -> Result<Self> {
        let split_at = raw
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(raw.len());
        let (component, spec) = raw.split_at(split_at);
        if component.is_empty() {
            return Err(ToolError::SdkInstall(format!(
                "Malformed SDK requirement: {}",
                raw
            )));
        }
        let spec = spec.trim();
        let constraint = if spec.is_empty() {
            VersionReq::STAR
        } else {
            VersionReq::parse(spec).map_err(|e| {
                ToolError::SdkInstall(format!("Malformed SDK requirement {}: {}", raw, e))
            })?
        };
        Ok(Self {
            component: component.to_string(),
            constraint,
            raw: raw.to_string(),
        })
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// The set of requirements from one manifest.
pub struct Requirements {
    requirements: Vec<Requirement>,
}

impl Requirements {
    pub fn parse(raw: &[String]) -> Result<Self> {
        let requirements = raw
            .iter()
            .map(|r| Requirement::parse(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { requirements })
    }

    /// Every requirement whose component is missing, too old, or unknown.
    pub fn unsatisfied(&self) -> Vec<&Requirement> {
        self.requirements
            .iter()
            .filter(|req| !self.is_satisfied(req))
            .collect()
    }

    /// Abort with a single readable error if anything is unmet.
    pub fn ensure_satisfied(&self) -> Result<()> {
        let unsatisfied = self.unsatisfied();
        if unsatisfied.is_empty() {
            return Ok(());
        }
        let listing = unsatisfied
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ToolError::SdkInstall(format!(
            "This SDK has the following unmet requirements: {}\n\
             Try updating the pebble tool.",
            listing
        )))
    }

    fn is_satisfied(&self, req: &Requirement) -> bool {
        let version = match req.component.as_str() {
            "pebble-tool" => Some(env!("CARGO_PKG_VERSION").to_string()),
            "qemu" => qemu_version(),
            "phonesim" | "pypkjs" => phonesim_version(),
            other => {
                debug!("Unknown SDK requirement component: {}", other);
                None
            }
        };
        match version.as_deref().map(parse_loose_version) {
            Some(Some(v)) => req.constraint.matches(&v),
            _ => false,
        }
    }
}

/// Parse a version that may omit minor/patch components or carry extra
/// trailing ones (qemu's `2.5.0-pebble4` normalizes to `2.5.0.4`).
fn parse_loose_version(s: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let mut parts: Vec<&str> = s.split('.').take(3).collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

/// Version of the local qemu build, if one is runnable.
fn qemu_version() -> Option<String> {
    let qemu = env::var(EnvVars::QEMU_PATH).unwrap_or_else(|_| "qemu-pebble".to_string());
    let output = Command::new(&qemu).arg("--version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let re = Regex::new(r"version ([^\s,]+)").expect("qemu version regex is valid");
    let version = re.captures(&text)?.get(1)?.as_str();
    // Our qemu builds report e.g. 2.5.0-pebble4.
    Some(version.replace("-pebble", "."))
}

/// Version of the local companion simulator, if one is runnable.
fn phonesim_version() -> Option<String> {
    let phonesim = env::var(EnvVars::PHONESIM_PATH).unwrap_or_else(|_| "phonesim".to_string());
    let output = Command::new(&phonesim).arg("--version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let re = Regex::new(r"v([^\s]+)").expect("phonesim version regex is valid");
    Some(re.captures(&text)?.get(1)?.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirement() {
        let req = Requirement::parse("qemu>=2.5.0").unwrap();
        assert_eq!(req.component, "qemu");
        assert!(req.constraint.matches(&Version::parse("2.6.0").unwrap()));
        assert!(!req.constraint.matches(&Version::parse("2.4.0").unwrap()));
    }

    #[test]
    fn test_parse_bare_component() {
        let req = Requirement::parse("pebble-tool").unwrap();
        assert_eq!(req.component, "pebble-tool");
        assert!(req.constraint.matches(&Version::parse("0.0.1").unwrap()));
    }

    #[test]
    fn test_malformed_requirement() {
        assert!(Requirement::parse(">=1.0").is_err());
        assert!(Requirement::parse("qemu>>1").is_err());
    }

    #[test]
    fn test_own_version_satisfiable() {
        // The tool always knows its own version.
        let reqs = Requirements::parse(&["pebble-tool>=0.1".to_string()]).unwrap();
        assert!(reqs.ensure_satisfied().is_ok());
    }

    #[test]
    fn test_unknown_component_is_unsatisfied() {
        let reqs = Requirements::parse(&["flux-capacitor>=1.21".to_string()]).unwrap();
        let err = reqs.ensure_satisfied().unwrap_err();
        assert!(err.to_string().contains("flux-capacitor"));
    }

    #[test]
    fn test_loose_version_padding() {
        assert_eq!(
            parse_loose_version("2.5"),
            Some(Version::parse("2.5.0").unwrap())
        );
        assert_eq!(
            parse_loose_version("2"),
            Some(Version::parse("2.0.0").unwrap())
        );
        assert_eq!(
            parse_loose_version("2.5.0.4"),
            Some(Version::parse("2.5.0").unwrap())
        );
        assert!(parse_loose_version("nope").is_none());
    }
}
