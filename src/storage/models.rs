use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// An enrolled person. `label` is the permanent identity the recognizer reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub label: i64,
    pub name: String,
    pub image_path: PathBuf,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Admitted,
    Denied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Admitted => "admitted",
            Outcome::Denied => "denied",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admitted" => Ok(Outcome::Admitted),
            "denied" => Ok(Outcome::Denied),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// What triggered a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Recognition,
    Remote,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Recognition => "recognition",
            EventSource::Remote => "remote",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recognition" => Ok(EventSource::Recognition),
            "remote" => Ok(EventSource::Remote),
            other => Err(format!("unknown event source '{}'", other)),
        }
    }
}

/// One admission decision. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    /// Row id, assigned by the store.
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub matched_label: Option<i64>,
    pub confidence: f32,
    pub captured_image_path: Option<PathBuf>,
    pub outcome: Outcome,
    pub source: EventSource,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub image_persist_failed: bool,
    #[serde(default)]
    pub degraded: bool,
}

impl AccessEvent {
    pub fn new(
        outcome: Outcome,
        matched_label: Option<i64>,
        confidence: f32,
        source: EventSource,
    ) -> Self {
        Self {
            id: None,
            // storage keeps microseconds
            timestamp: Utc::now().trunc_subsecs(6),
            matched_label,
            confidence,
            captured_image_path: None,
            outcome,
            source,
            error: None,
            image_persist_failed: false,
            degraded: false,
        }
    }

    pub fn admitted(matched_label: Option<i64>, confidence: f32, source: EventSource) -> Self {
        Self::new(Outcome::Admitted, matched_label, confidence, source)
    }

    pub fn denied(matched_label: Option<i64>, confidence: f32, source: EventSource) -> Self {
        Self::new(Outcome::Denied, matched_label, confidence, source)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Single-line rendering used by the flat-text access log.
    pub fn to_log_line(&self) -> String {
        let label = self
            .matched_label
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        let image = self
            .captured_image_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut line = format!(
            "{} {} source={} label={} confidence={:.3} image={}",
            self.timestamp.to_rfc3339(),
            self.outcome,
            self.source,
            label,
            self.confidence,
            image
        );
        if self.image_persist_failed {
            line.push_str(" image_persist_failed");
        }
        if self.degraded {
            line.push_str(" degraded");
        }
        if let Some(ref error) = self.error {
            line.push_str(&format!(" error=\"{}\"", error.replace('"', "'")));
        }
        line
    }
}

/// Query over the access log. All fields are optional conjunctive constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub label: Option<i64>,
    pub outcome: Option<Outcome>,
    pub source: Option<EventSource>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}
