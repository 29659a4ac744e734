//! Task model.
//!
//! A task is one queued unit of work: an image scan or a spectroscopy
//! acquisition. Its step list is derived from its parameters once, when the
//! task is created, and never regenerated. Execution only ever advances a
//! cursor through that fixed list.

use crate::sweep::MAX_SWEEP_POINTS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spm_core::{ArgValue, CommandArgs, FailureReason, TaskError, TaskId};
use spm_protocol::Operation;
use std::collections::BTreeMap;
use std::time::Duration;

/// What kind of acquisition a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Topographic image
    ImageScan,
    /// Bias spectroscopy
    Spectroscopy,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::ImageScan => write!(f, "image scan"),
            TaskKind::Spectroscopy => write!(f, "spectroscopy"),
        }
    }
}

/// Lifecycle of a task.
///
/// ```text
/// Queued ──▶ Running ──▶ Completed
///    │          ├──────▶ Failed{reason}
///    └──────────┴──────▶ Cancelled
/// ```
///
/// Terminal states are sticky.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to start
    Queued,
    /// Owned by the executor
    Running,
    /// Every step succeeded
    Completed,
    /// Stopped on an error
    Failed {
        /// What went wrong
        reason: FailureReason,
    },
    /// Cancelled before or while running
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Queued, TaskStatus::Running | TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { reason } => write!(f, "failed ({})", reason),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One logical controller call with bound arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Controller operation to call
    pub operation: Operation,
    /// Arguments bound into the command template
    #[serde(default)]
    pub args: CommandArgs,
}

impl Step {
    /// Step calling `operation` with `args`.
    pub fn new(operation: Operation, args: CommandArgs) -> Self {
        Self { operation, args }
    }

    /// Step without arguments.
    pub fn bare(operation: Operation) -> Self {
        Self::new(operation, CommandArgs::new())
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.operation)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self
                .args
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

/// Image scan settings. Lengths in metres, bias in volts, setpoint in amperes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageScanParams {
    /// Edge length of the square frame
    pub size: f64,
    /// Frame centre, x
    pub x_offset: f64,
    /// Frame centre, y
    pub y_offset: f64,
    /// Sample bias
    pub bias: f64,
    /// Tunnelling current setpoint
    pub set_point: f64,
    /// Seconds per scan line
    pub line_time: f64,
    /// Lines per frame
    pub lines_per_frame: u32,
    /// Frames to acquire
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
}

fn default_repetitions() -> u32 {
    1
}

impl ImageScanParams {
    /// Reject settings no controller could execute.
    pub fn validate(&self) -> Result<(), TaskError> {
        for (name, value) in [
            ("size", self.size),
            ("x_offset", self.x_offset),
            ("y_offset", self.y_offset),
            ("bias", self.bias),
            ("set_point", self.set_point),
            ("line_time", self.line_time),
        ] {
            require_finite(name, value)?;
        }
        require_positive("size", self.size)?;
        require_positive("line_time", self.line_time)?;
        if self.lines_per_frame == 0 {
            return Err(invalid("lines_per_frame", "must be at least 1"));
        }
        if self.repetitions == 0 {
            return Err(invalid("repetitions", "must be at least 1"));
        }
        Ok(())
    }

    fn expand(&self) -> Vec<Step> {
        let mut steps = vec![
            Step::new(Operation::SetBias, CommandArgs::new().with("bias", self.bias)),
            Step::new(
                Operation::SetSetpoint,
                CommandArgs::new().with("current", self.set_point),
            ),
            Step::new(
                Operation::SetScanFrame,
                CommandArgs::new()
                    .with("x", self.x_offset)
                    .with("y", self.y_offset)
                    .with("width", self.size)
                    .with("height", self.size),
            ),
            Step::new(
                Operation::SetScanSpeed,
                CommandArgs::new().with("line_time", self.line_time),
            ),
            Step::new(
                Operation::SetScanPixels,
                CommandArgs::new().with("lines", self.lines_per_frame),
            ),
        ];
        for repetition in 0..self.repetitions {
            steps.push(Step::bare(Operation::StartScan));
            steps.push(Step::bare(Operation::PollStatus));
            steps.push(Step::new(
                Operation::ReadImage,
                CommandArgs::new().with("repetition", repetition),
            ));
        }
        steps
    }

    /// Forward and backward pass of every line, for every repetition.
    /// Saturates at [`Duration::MAX`].
    pub fn estimated_duration(&self) -> Duration {
        let seconds =
            2.0 * self.line_time * f64::from(self.lines_per_frame) * f64::from(self.repetitions);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Spectroscopy acquisition pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecMode {
    /// Single position
    Point,
    /// Along a line
    Line,
    /// Over a grid
    Region,
}

/// Bias spectroscopy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectroscopyParams {
    /// Acquisition pattern
    pub mode: SpecMode,
    /// Tip position (m)
    pub x: f64,
    /// Tip position (m)
    pub y: f64,
    /// Sweep start (V)
    pub start: f64,
    /// Sweep stop (V), inclusive
    pub stop: f64,
    /// Sweep increment (V), signed toward `stop`
    pub step: f64,
    /// Settling time per point (s)
    pub delay_time: f64,
}

impl SpectroscopyParams {
    /// Reject sweeps that cannot reach `stop`.
    pub fn validate(&self) -> Result<(), TaskError> {
        for (name, value) in [
            ("x", self.x),
            ("y", self.y),
            ("start", self.start),
            ("stop", self.stop),
            ("step", self.step),
            ("delay_time", self.delay_time),
        ] {
            require_finite(name, value)?;
        }
        if self.step == 0.0 {
            return Err(invalid("step", "must not be zero"));
        }
        if (self.stop - self.start) * self.step < 0.0 {
            return Err(invalid("step", "points away from stop"));
        }
        if self.delay_time < 0.0 {
            return Err(invalid("delay_time", "must not be negative"));
        }
        if self.intervals() >= MAX_SWEEP_POINTS as f64 {
            return Err(invalid("step", "sweep has too many points"));
        }
        Ok(())
    }

    /// Whole steps between `start` and `stop`.
    fn intervals(&self) -> f64 {
        let span = ((self.stop - self.start) / self.step).abs();
        // Tolerate rounding noise such as 0.3 / 0.1 = 2.9999999999999996
        (span + 1e-9).floor()
    }

    /// Number of sweep points, both ends included. Saturates for sweeps that
    /// would not pass [`validate`](Self::validate).
    pub fn points(&self) -> u32 {
        let intervals = self.intervals();
        if intervals >= f64::from(u32::MAX) {
            return u32::MAX;
        }
        (intervals as u32).saturating_add(1)
    }

    fn expand(&self) -> Vec<Step> {
        vec![
            Step::new(
                Operation::SetTipPosition,
                CommandArgs::new().with("x", self.x).with("y", self.y),
            ),
            Step::new(
                Operation::SetSpecSweep,
                CommandArgs::new()
                    .with("start", self.start)
                    .with("stop", self.stop)
                    .with("points", self.points()),
            ),
            Step::new(
                Operation::SetSpecDelay,
                CommandArgs::new().with("delay", self.delay_time),
            ),
            Step::bare(Operation::StartSpectrum),
            Step::bare(Operation::PollStatus),
            Step::new(Operation::ReadSpectrum, CommandArgs::new().with("point", 0u32)),
        ]
    }

    /// Settling time summed over every point.
    pub fn estimated_duration(&self) -> Duration {
        let seconds = f64::from(self.points()) * self.delay_time;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Parameters of either task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParams {
    /// Image scan settings
    ImageScan(ImageScanParams),
    /// Spectroscopy settings
    Spectroscopy(SpectroscopyParams),
}

impl TaskParams {
    /// Task kind these parameters describe.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::ImageScan(_) => TaskKind::ImageScan,
            TaskParams::Spectroscopy(_) => TaskKind::Spectroscopy,
        }
    }

    /// Validate the inner parameter set.
    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            TaskParams::ImageScan(p) => p.validate(),
            TaskParams::Spectroscopy(p) => p.validate(),
        }
    }

    /// The ordered controller calls these parameters stand for. Pure.
    pub fn expand(&self) -> Vec<Step> {
        match self {
            TaskParams::ImageScan(p) => p.expand(),
            TaskParams::Spectroscopy(p) => p.expand(),
        }
    }

    /// Named settings, for display and reporting.
    pub fn to_map(&self) -> BTreeMap<String, ArgValue> {
        let mut map = BTreeMap::new();
        let mut put = |name: &str, value: ArgValue| {
            map.insert(name.to_string(), value);
        };
        match self {
            TaskParams::ImageScan(p) => {
                put("size", p.size.into());
                put("x_offset", p.x_offset.into());
                put("y_offset", p.y_offset.into());
                put("bias", p.bias.into());
                put("set_point", p.set_point.into());
                put("line_time", p.line_time.into());
                put("lines_per_frame", p.lines_per_frame.into());
                put("repetitions", p.repetitions.into());
            }
            TaskParams::Spectroscopy(p) => {
                put("mode", format!("{:?}", p.mode).into());
                put("x", p.x.into());
                put("y", p.y.into());
                put("start", p.start.into());
                put("stop", p.stop.into());
                put("step", p.step.into());
                put("delay_time", p.delay_time.into());
            }
        }
        map
    }

    /// Rough acquisition time, ignoring communication overhead.
    pub fn estimated_duration(&self) -> Duration {
        match self {
            TaskParams::ImageScan(p) => p.estimated_duration(),
            TaskParams::Spectroscopy(p) => p.estimated_duration(),
        }
    }
}

/// A unit of work with a fixed step list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    id: TaskId,
    name: String,
    kind: TaskKind,
    params: Option<TaskParams>,
    steps: Vec<Step>,
    status: TaskStatus,
    created_at: DateTime<Utc>,
}

impl Task {
    /// Validate `params` and derive the step list.
    pub fn new(name: impl Into<String>, params: TaskParams) -> Result<Self, TaskError> {
        params.validate()?;
        let steps = params.expand();
        Ok(Self::build(name.into(), params.kind(), Some(params), steps))
    }

    /// Image scan task. Fails when `params` do not validate.
    pub fn image_scan(name: impl Into<String>, params: ImageScanParams) -> Result<Self, TaskError> {
        Self::new(name, TaskParams::ImageScan(params))
    }

    /// Spectroscopy task. Fails when `params` do not validate.
    pub fn spectroscopy(
        name: impl Into<String>,
        params: SpectroscopyParams,
    ) -> Result<Self, TaskError> {
        Self::new(name, TaskParams::Spectroscopy(params))
    }

    /// A task with a hand-composed step list and no parameter set.
    pub fn from_steps(name: impl Into<String>, kind: TaskKind, steps: Vec<Step>) -> Self {
        Self::build(name.into(), kind, None, steps)
    }

    fn build(name: String, kind: TaskKind, params: Option<TaskParams>, steps: Vec<Step>) -> Self {
        Self {
            id: TaskId::new(),
            name,
            kind,
            params,
            steps,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
        }
    }

    /// Identifier assigned at creation.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of acquisition.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Parameter set, `None` for hand-composed tasks.
    pub fn params(&self) -> Option<&TaskParams> {
        self.params.as_ref()
    }

    /// Named settings (empty for hand-composed tasks).
    pub fn parameters(&self) -> BTreeMap<String, ArgValue> {
        self.params.as_ref().map(TaskParams::to_map).unwrap_or_default()
    }

    /// The fixed step list.
    pub fn expand(&self) -> &[Step] {
        &self.steps
    }

    /// Current lifecycle state.
    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// When the task was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Estimate from the parameter set, zero for hand-composed tasks.
    pub fn estimated_duration(&self) -> Duration {
        self.params
            .as_ref()
            .map(TaskParams::estimated_duration)
            .unwrap_or(Duration::ZERO)
    }

    /// Apply a status transition. Illegal transitions are refused and leave
    /// the status unchanged.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition_to(&next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Render a duration the way the status line shows it: `1d 2h 3m 4s`, or
/// `2h 3m 4s` when under a day.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total / 3_600) % 24;
    let mins = (total / 60) % 60;
    let secs = total % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else {
        format!("{}h {}m {}s", hours, mins, secs)
    }
}

fn invalid(name: &str, reason: &str) -> TaskError {
    TaskError::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn require_finite(name: &str, value: f64) -> Result<(), TaskError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(name, "must be finite"))
    }
}

fn require_positive(name: &str, value: f64) -> Result<(), TaskError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, "must be positive"))
    }
}
