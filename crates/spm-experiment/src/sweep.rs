//! Task sets: one image task per value of a swept parameter.
//!
//! A plan file is a JSON array of [`TaskSpec`]:
//!
//! ```json
//! [
//!   {
//!     "kind": "image_scan",
//!     "name": "bias series",
//!     "params": { "size": 1e-7, "x_offset": 0, "y_offset": 0, "bias": 0.1,
//!                 "set_point": 1e-10, "line_time": 0.1, "lines_per_frame": 256 },
//!     "sweep": { "parameter": "bias", "start": 0.1, "stop": 0.5, "step": 0.1 }
//!   },
//!   {
//!     "kind": "spectroscopy",
//!     "name": "iv",
//!     "params": { "mode": "Point", "x": 0, "y": 0, "start": -1, "stop": 1,
//!                 "step": 0.01, "delay_time": 0.005 }
//!   }
//! ]
//! ```

use crate::task::{ImageScanParams, SpectroscopyParams, Task};
use serde::{Deserialize, Serialize};
use spm_core::{AppResult, TaskError};
use std::time::Duration;

/// Upper bound on the number of tasks a single sweep may produce.
pub const MAX_SWEEP_POINTS: usize = 10_000;

/// Which image parameter a task set varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepParameter {
    /// No sweep, a single task
    #[default]
    None,
    /// Sample bias
    Bias,
    /// Current setpoint
    SetPoint,
    /// Frame edge length
    Size,
    /// Frame centre, x
    XOffset,
    /// Frame centre, y
    YOffset,
}

impl SweepParameter {
    fn apply(self, params: &mut ImageScanParams, value: f64) {
        match self {
            SweepParameter::None => {}
            SweepParameter::Bias => params.bias = value,
            SweepParameter::SetPoint => params.set_point = value,
            SweepParameter::Size => params.size = value,
            SweepParameter::XOffset => params.x_offset = value,
            SweepParameter::YOffset => params.y_offset = value,
        }
    }
}

/// Inclusive range `start, start + step, ...` up to and including `stop`.
pub fn sweep_values(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, TaskError> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(TaskError::InvalidSweep("bounds must be finite".into()));
    }
    if step == 0.0 {
        return Err(TaskError::InvalidSweep("step must not be zero".into()));
    }
    if (stop - start) * step < 0.0 {
        return Err(TaskError::InvalidSweep(format!(
            "step {} never reaches {} from {}",
            step, stop, start
        )));
    }

    let intervals = ((stop - start) / step + 1e-9).floor();
    if intervals >= MAX_SWEEP_POINTS as f64 {
        return Err(TaskError::InvalidSweep(format!(
            "more than {} points",
            MAX_SWEEP_POINTS
        )));
    }
    let count = intervals as usize + 1;
    Ok((0..count).map(|i| start + i as f64 * step).collect())
}

/// Range part of a task set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    /// Setting that varies between tasks
    pub parameter: SweepParameter,
    /// First value
    pub start: f64,
    /// Last value, inclusive
    pub stop: f64,
    /// Increment, signed toward `stop`
    pub step: f64,
}

/// An image scan repeated over a parameter range.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSweep {
    /// Prefix of the generated task names
    pub name: String,
    /// Settings shared by every task of the set
    pub base: ImageScanParams,
    /// Setting overridden per task
    pub parameter: SweepParameter,
    /// First value
    pub start: f64,
    /// Last value, inclusive
    pub stop: f64,
    /// Increment, signed toward `stop`
    pub step: f64,
}

impl ImageSweep {
    /// Sweep of `base` over `range`.
    pub fn new(name: impl Into<String>, base: ImageScanParams, range: SweepRange) -> Self {
        Self {
            name: name.into(),
            base,
            parameter: range.parameter,
            start: range.start,
            stop: range.stop,
            step: range.step,
        }
    }

    /// Values the swept parameter takes. A `None` sweep yields no values.
    pub fn values(&self) -> Result<Vec<f64>, TaskError> {
        if self.parameter == SweepParameter::None {
            return Ok(Vec::new());
        }
        sweep_values(self.start, self.stop, self.step)
    }

    /// Build one task per value, named `name[i]`. A `None` sweep is the base
    /// task, unsuffixed.
    pub fn tasks(&self) -> Result<Vec<Task>, TaskError> {
        if self.parameter == SweepParameter::None {
            return Ok(vec![Task::image_scan(self.name.clone(), self.base.clone())?]);
        }
        self.values()?
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let mut params = self.base.clone();
                self.parameter.apply(&mut params, value);
                Task::image_scan(format!("{}[{}]", self.name, i), params)
            })
            .collect()
    }

    /// Sum over all tasks of the set, saturating at [`Duration::MAX`].
    pub fn estimated_duration(&self) -> Result<Duration, TaskError> {
        let count = if self.parameter == SweepParameter::None {
            1
        } else {
            self.values()?.len().max(1) as u32
        };
        Ok(self
            .base
            .estimated_duration()
            .checked_mul(count)
            .unwrap_or(Duration::MAX))
    }
}

/// Serializable task description, as found in plan files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    /// One image scan, or a set of them when `sweep` is given.
    ImageScan {
        /// Task name, or name prefix for a sweep
        name: String,
        /// Scan settings
        params: ImageScanParams,
        /// Optional parameter range
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sweep: Option<SweepRange>,
    },
    /// One spectroscopy acquisition.
    #[allow(missing_docs)]
    Spectroscopy {
        name: String,
        params: SpectroscopyParams,
    },
}

impl TaskSpec {
    /// Validate and build the task(s) this spec describes.
    pub fn into_tasks(self) -> Result<Vec<Task>, TaskError> {
        match self {
            TaskSpec::ImageScan {
                name,
                params,
                sweep: Some(range),
            } => ImageSweep::new(name, params, range).tasks(),
            TaskSpec::ImageScan {
                name,
                params,
                sweep: None,
            } => Ok(vec![Task::image_scan(name, params)?]),
            TaskSpec::Spectroscopy { name, params } => Ok(vec![Task::spectroscopy(name, params)?]),
        }
    }
}

/// Parse a plan file (JSON array of task specs) into tasks, in order.
pub fn load_plan(json: &str) -> AppResult<Vec<Task>> {
    let specs: Vec<TaskSpec> = serde_json::from_str(json)?;
    let mut tasks = Vec::new();
    for spec in specs {
        tasks.extend(spec.into_tasks()?);
    }
    Ok(tasks)
}
