/// Runtime specs of the form `name[@semver]`
///
/// A runtime names the language environment a server package needs. The
/// version suffix is optional; when present it must be a strict semantic
/// version (`20.11.1`, not `20` or `v20.11.1`).

use std::fmt;
use std::str::FromStr;

use semver::Version;
use thiserror::Error;

/// Errors produced while parsing a runtime spec
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unsupported runtime: {0:?}")]
    UnsupportedRuntime(String),

    #[error("Invalid runtime version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        source: semver::Error,
    },
}

/// Language environments servers can run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Node,
    Python,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Node => "node",
            RuntimeKind::Python => "python",
        }
    }

    /// Unprivileged identity the server process runs as inside its image
    pub fn user(&self) -> &'static str {
        match self {
            RuntimeKind::Node => "node",
            RuntimeKind::Python => "1000:1000",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(RuntimeKind::Node),
            "python" => Ok(RuntimeKind::Python),
            other => Err(RuntimeError::UnsupportedRuntime(other.to_string())),
        }
    }
}

/// A parsed runtime spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    pub kind: RuntimeKind,
    pub version: Option<Version>,
}

impl Runtime {
    pub fn parse(spec: &str) -> Result<Self, RuntimeError> {
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (spec, None),
        };

        let kind = name.parse()?;
        let version = version
            .map(|v| {
                Version::parse(v).map_err(|source| RuntimeError::InvalidVersion {
                    version: v.to_string(),
                    source,
                })
            })
            .transpose()?;

        Ok(Self { kind, version })
    }

    /// Container image reference for this runtime, e.g. `node:20.11.1`
    pub fn image(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}", self.kind.as_str(), version),
            None => format!("{}:latest", self.kind.as_str()),
        }
    }
}

impl FromStr for Runtime {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Runtime::parse(s)
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.kind.as_str(), version),
            None => f.write_str(self.kind.as_str()),
        }
    }
}
