//! Worker templates: everything needed to create one disposable worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// When to pull the template's image before creating a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Never pull; the image must already be present on the engine host.
    Never,
    /// Pull before every provision.
    Always,
    /// Pull when the image is absent, or whenever the tag is mutable
    /// (`latest`-style tags are always re-checked).
    IfMissing,
}

impl PullPolicy {
    /// Decide whether to pull given the image reference and its presence.
    pub fn should_pull(self, image: &str, present: bool) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::IfMissing => !present || tag_is_mutable(image),
        }
    }
}

impl FromStr for PullPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "if_missing" | "if-missing" | "ifmissing" => Ok(Self::IfMissing),
            other => Err(ConfigError::ParseError(format!(
                "unknown pull policy '{other}' (expected never, always, or if_missing)"
            ))),
        }
    }
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Always => write!(f, "always"),
            Self::IfMissing => write!(f, "if_missing"),
        }
    }
}

/// Whether an image reference uses a mutable tag.
///
/// A reference pinned by digest is immutable. A missing tag or a `latest`
/// tag is mutable and must be re-checked against the registry even when a
/// local copy exists.
pub(crate) fn tag_is_mutable(image: &str) -> bool {
    if image.contains('@') {
        return false;
    }
    // Split on the last ':' that is part of a tag, not a registry port.
    match image.rsplit_once(':') {
        Some((_, tag)) if !tag.contains('/') => tag == "latest",
        _ => true, // no tag at all implies :latest
    }
}

/// The worker runtime payload copied into each container.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RuntimeSpec {
    /// Local path of the runtime binary to copy in. `None` means the image
    /// already ships the runtime and injection is skipped.
    pub local_binary: Option<PathBuf>,
    /// Directory inside the container the runtime is unpacked into.
    pub remote_dir: String,
    /// Command that starts the runtime inside the container.
    pub command: String,
    /// Extra arguments appended to every runtime invocation.
    pub args: Vec<String>,
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            local_binary: None,
            remote_dir: "/usr/local/bin".to_string(),
            command: "/usr/local/bin/kindling-agent".to_string(),
            args: Vec::new(),
        }
    }
}

/// Template describing one class of disposable workers.
///
/// A template is configuration only; it is shared across many worker
/// instances and never mutated by a provision attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkerTemplate {
    /// Image reference, e.g. `registry.example.com/build:2024.1`.
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Container command. Empty means the connector's default blocking
    /// command is substituted so the container does not exit immediately.
    pub cmd: Vec<String>,
    /// `NAME=value` environment entries.
    pub env: Vec<String>,
    /// Working directory for builds inside the container.
    pub working_dir: String,
    /// Extra labels merged into the fleet's own tagging labels.
    pub labels: HashMap<String, String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
    pub network_mode: Option<String>,
    /// Remove anonymous volumes together with the container at teardown.
    pub remove_volumes: bool,
    pub runtime: RuntimeSpec,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            image: String::new(),
            pull_policy: PullPolicy::IfMissing,
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: "/home/build".to_string(),
            labels: HashMap::new(),
            memory_limit_mb: None,
            cpu_shares: None,
            network_mode: None,
            remove_volumes: true,
            runtime: RuntimeSpec::default(),
        }
    }
}

impl WorkerTemplate {
    /// Minimal template for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Parse a template from its JSON representation, then validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let template: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    /// Validate the template before any engine call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::Missing("template image".into()));
        }
        if !self.working_dir.starts_with('/') {
            return Err(ConfigError::ParseError(format!(
                "working_dir must be absolute, got '{}'",
                self.working_dir
            )));
        }
        if self.runtime.command.trim().is_empty() {
            return Err(ConfigError::Missing("runtime command".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_parses() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!(
            "if-missing".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfMissing
        );
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn mutable_tags_are_repulled_even_when_present() {
        assert!(PullPolicy::IfMissing.should_pull("build:latest", true));
        assert!(PullPolicy::IfMissing.should_pull("build", true));
        assert!(!PullPolicy::IfMissing.should_pull("build:2024.1", true));
        assert!(PullPolicy::IfMissing.should_pull("build:2024.1", false));
        assert!(!PullPolicy::Never.should_pull("build:latest", false));
        assert!(PullPolicy::Always.should_pull("build:2024.1", true));
    }

    #[test]
    fn registry_ports_are_not_tags() {
        // The ':5000' here is a registry port; the reference has no tag.
        assert!(tag_is_mutable("registry.local:5000/build"));
        assert!(!tag_is_mutable("registry.local:5000/build:2024.1"));
        assert!(!tag_is_mutable("build@sha256:deadbeef"));
    }

    #[test]
    fn templates_load_from_json() {
        let t = WorkerTemplate::from_json(
            r#"{
                "image": "registry.local:5000/build:2024.1",
                "pull_policy": "always",
                "memory_limit_mb": 2048,
                "labels": {"team": "ci"}
            }"#,
        )
        .unwrap();
        assert_eq!(t.image, "registry.local:5000/build:2024.1");
        assert_eq!(t.pull_policy, PullPolicy::Always);
        assert_eq!(t.memory_limit_mb, Some(2048));
        assert_eq!(t.working_dir, "/home/build");

        // Missing image fails validation, not just deserialization.
        assert!(WorkerTemplate::from_json("{}").is_err());
        assert!(WorkerTemplate::from_json("not json").is_err());
    }

    #[test]
    fn template_validation() {
        assert!(WorkerTemplate::new("build:2024.1").validate().is_ok());
        assert!(WorkerTemplate::new("").validate().is_err());

        let mut t = WorkerTemplate::new("build:2024.1");
        t.working_dir = "relative/path".into();
        assert!(t.validate().is_err());
    }
}
