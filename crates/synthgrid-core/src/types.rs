//! Shared types used across synthgrid crates.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque identifier assigned to a request when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

// ── Generation parameters ──────────────────────────────────────────

/// What kind of generation the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationMode {
    TextToImage,
    /// Image-to-image runs only `ceil(steps * strength)` denoising steps.
    ImageToImage { strength: f32 },
}

/// Parameters handed to the generation engine. Only `width`, `height`,
/// `steps` and `mode` influence cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
    pub mode: GenerationMode,
}

impl GenerationParams {
    pub fn text_to_image(prompt: impl Into<String>, width: u32, height: u32, steps: u32) -> Self {
        Self {
            prompt: prompt.into(),
            width,
            height,
            steps,
            guidance_scale: 7.5,
            seed: None,
            mode: GenerationMode::TextToImage,
        }
    }

    pub fn image_to_image(
        prompt: impl Into<String>,
        width: u32,
        height: u32,
        steps: u32,
        strength: f32,
    ) -> Self {
        Self {
            mode: GenerationMode::ImageToImage { strength },
            ..Self::text_to_image(prompt, width, height, steps)
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }

    pub fn with_guidance_scale(self, guidance_scale: f32) -> Self {
        Self {
            guidance_scale,
            ..self
        }
    }

    /// Output pixel count.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Number of denoising steps the engine will actually run.
    ///
    /// Non-decreasing in `steps`. Strength is clamped to `[0, 1]`.
    pub fn effective_steps(&self) -> u32 {
        match self.mode {
            GenerationMode::TextToImage => self.steps,
            GenerationMode::ImageToImage { strength } => {
                let strength = f64::from(strength.clamp(0.0, 1.0));
                (f64::from(self.steps) * strength).ceil().max(1.0) as u32
            }
        }
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// Lifecycle state of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Admitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded
                | RequestState::Failed
                | RequestState::TimedOut
                | RequestState::Cancelled
                | RequestState::Rejected
        )
    }

    /// Whether `next` is a legal successor of `self`. States are never
    /// revisited and terminal states have no successors.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Queued, Admitted | Rejected | TimedOut | Cancelled)
                | (Admitted, Running | TimedOut | Cancelled)
                | (Running, Succeeded | Failed | TimedOut | Cancelled)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestState::Queued => "queued",
            RequestState::Admitted => "admitted",
            RequestState::Running => "running",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::TimedOut => "timed_out",
            RequestState::Cancelled => "cancelled",
            RequestState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Error taxonomy ─────────────────────────────────────────────────

/// Classification carried by every non-successful terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Client exhausted its token bucket.
    RateLimitExceeded,
    /// Wait queue was full at submission.
    Overloaded,
    /// Queue deadline passed before admission.
    QueueTimeout,
    /// Execution deadline passed while running.
    ExecutionTimeout,
    /// Caller-initiated cancellation.
    Cancelled,
    /// Engine reported a retryable failure (e.g. out of device memory).
    EngineTransientFailure,
    /// Engine reported a non-retryable failure.
    EngineFatalFailure,
    /// Parameters exceed the bounds the cost model accepts.
    InvalidParameters,
    /// Scheduler is shutting down.
    ShuttingDown,
}

impl ErrorKind {
    /// Stable code for the serving layer to map onto a transport status.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::Overloaded => "SERVICE_OVERLOADED",
            ErrorKind::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorKind::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::EngineTransientFailure => "ENGINE_TRANSIENT_FAILURE",
            ErrorKind::EngineFatalFailure => "ENGINE_FATAL_FAILURE",
            ErrorKind::InvalidParameters => "INVALID_PARAMETERS",
            ErrorKind::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::Overloaded
                | ErrorKind::QueueTimeout
                | ErrorKind::EngineTransientFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ── Outcome ────────────────────────────────────────────────────────

/// The single terminal result delivered for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(Bytes),
    Failed(ErrorKind),
    /// Carries `QueueTimeout` or `ExecutionTimeout`.
    TimedOut(ErrorKind),
    Cancelled,
    Rejected(ErrorKind),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    /// Error kind of a non-successful outcome.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Succeeded(_) => None,
            Outcome::Failed(kind) | Outcome::TimedOut(kind) | Outcome::Rejected(kind) => {
                Some(*kind)
            }
            Outcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().map_or("SUCCEEDED", |kind| kind.code())
    }

    /// Terminal lifecycle state matching this outcome.
    pub fn state(&self) -> RequestState {
        match self {
            Outcome::Succeeded(_) => RequestState::Succeeded,
            Outcome::Failed(_) => RequestState::Failed,
            Outcome::TimedOut(_) => RequestState::TimedOut,
            Outcome::Cancelled => RequestState::Cancelled,
            Outcome::Rejected(_) => RequestState::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId(42).to_string(), "req-42");
    }

    #[test]
    fn image_to_image_scales_steps_by_strength() {
        let params = GenerationParams::image_to_image("a fox", 512, 512, 50, 0.5);
        assert_eq!(params.effective_steps(), 25);

        let params = GenerationParams::image_to_image("a fox", 512, 512, 3, 0.1);
        assert_eq!(params.effective_steps(), 1);

        let params = GenerationParams::image_to_image("a fox", 512, 512, 10, 7.0);
        assert_eq!(params.effective_steps(), 10);
    }

    #[test]
    fn effective_steps_never_decrease_with_steps() {
        for strength in [0.1_f32, 0.33, 0.75, 1.0] {
            let mut last = 0;
            for steps in 0..=100 {
                let current =
                    GenerationParams::image_to_image("p", 256, 256, steps, strength).effective_steps();
                assert!(current >= last, "steps={steps} strength={strength}");
                last = current;
            }
        }
    }

    #[test]
    fn builders_set_optional_fields() {
        let params = GenerationParams::text_to_image("a lighthouse", 768, 512, 30)
            .with_seed(7)
            .with_guidance_scale(4.0);
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.guidance_scale, 4.0);
        assert_eq!(params.pixels(), 768 * 512);
    }

    #[test]
    fn lifecycle_allows_only_forward_transitions() {
        use RequestState::*;

        assert!(Queued.can_transition_to(Admitted));
        assert!(Queued.can_transition_to(Rejected));
        assert!(Queued.can_transition_to(TimedOut));
        assert!(Admitted.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Running));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Admitted.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Rejected));
        for terminal in [Succeeded, Failed, TimedOut, Cancelled, Rejected] {
            assert!(terminal.is_terminal());
            for next in [Queued, Admitted, Running, Succeeded, Failed, TimedOut, Cancelled, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::Overloaded.code(), "SERVICE_OVERLOADED");
        assert_eq!(ErrorKind::RateLimitExceeded.to_string(), "RATE_LIMIT_EXCEEDED");
        assert!(ErrorKind::EngineTransientFailure.is_retryable());
        assert!(!ErrorKind::EngineFatalFailure.is_retryable());

        let json = serde_json::to_string(&ErrorKind::QueueTimeout).unwrap();
        assert_eq!(json, "\"QUEUE_TIMEOUT\"");
    }

    #[test]
    fn outcome_maps_to_kind_and_state() {
        let ok = Outcome::Succeeded(Bytes::from_static(b"png"));
        assert!(ok.is_success());
        assert_eq!(ok.kind(), None);
        assert_eq!(ok.code(), "SUCCEEDED");
        assert_eq!(ok.state(), RequestState::Succeeded);

        let timed_out = Outcome::TimedOut(ErrorKind::ExecutionTimeout);
        assert_eq!(timed_out.kind(), Some(ErrorKind::ExecutionTimeout));
        assert_eq!(timed_out.state(), RequestState::TimedOut);

        assert_eq!(Outcome::Cancelled.code(), "CANCELLED");
        assert_eq!(
            Outcome::Rejected(ErrorKind::Overloaded).state(),
            RequestState::Rejected
        );
    }
}
