use crate::errors::DriverError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type EnvMap = BTreeMap<String, String>;

pub fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    NotStarted,
    Launching,
    WaitingForMarker,
    Ready,
    Failed,
}

impl ReadinessState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Launching => "launching",
            Self::WaitingForMarker => "waiting_for_marker",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn advance(&mut self, next: ReadinessState) -> Result<(), DriverError> {
        validate_transition(*self, next)?;
        *self = next;
        Ok(())
    }
}

pub fn validate_transition(from: ReadinessState, to: ReadinessState) -> Result<(), DriverError> {
    use ReadinessState as S;

    let allowed = match from {
        S::NotStarted => matches!(to, S::Launching),
        S::Launching => matches!(to, S::WaitingForMarker | S::Failed),
        S::WaitingForMarker => matches!(to, S::Ready | S::Failed),
        // A caller may decide to keep waiting after a timed-out wait.
        S::Failed => matches!(to, S::WaitingForMarker),
        S::Ready => false,
    };

    if !allowed {
        return Err(DriverError::Process(format!(
            "illegal readiness transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}
