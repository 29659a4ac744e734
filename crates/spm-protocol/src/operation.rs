//! The fixed set of logical controller operations.

use crate::reply::ReplyGrammar;
use serde::{Deserialize, Serialize};

/// A protocol-agnostic controller action.
///
/// Each operation is resolved through the template registry under
/// [`Operation::name`] and its reply is checked against [`Operation::grammar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Set the sample bias
    SetBias,
    /// Set the tunnelling current setpoint
    SetSetpoint,
    /// Set scan frame position and size
    SetScanFrame,
    /// Set the time per scan line
    SetScanSpeed,
    /// Set the number of lines per frame
    SetScanPixels,
    /// Start an image scan
    StartScan,
    /// Abort the current scan
    StopScan,
    /// Ask whether the controller is busy
    PollStatus,
    /// Read back the last frame
    ReadImage,
    /// Move the tip
    SetTipPosition,
    /// Set the spectroscopy sweep range
    SetSpecSweep,
    /// Set the settling time per spectroscopy point
    SetSpecDelay,
    /// Start a spectrum
    StartSpectrum,
    /// Read back the last spectrum
    ReadSpectrum,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Operation; 14] = [
        Operation::SetBias,
        Operation::SetSetpoint,
        Operation::SetScanFrame,
        Operation::SetScanSpeed,
        Operation::SetScanPixels,
        Operation::StartScan,
        Operation::StopScan,
        Operation::PollStatus,
        Operation::ReadImage,
        Operation::SetTipPosition,
        Operation::SetSpecSweep,
        Operation::SetSpecDelay,
        Operation::StartSpectrum,
        Operation::ReadSpectrum,
    ];

    /// Template key.
    pub fn name(self) -> &'static str {
        match self {
            Operation::SetBias => "set_bias",
            Operation::SetSetpoint => "set_setpoint",
            Operation::SetScanFrame => "set_scan_frame",
            Operation::SetScanSpeed => "set_scan_speed",
            Operation::SetScanPixels => "set_scan_pixels",
            Operation::StartScan => "start_scan",
            Operation::StopScan => "stop_scan",
            Operation::PollStatus => "poll_status",
            Operation::ReadImage => "read_image",
            Operation::SetTipPosition => "set_tip_position",
            Operation::SetSpecSweep => "set_spec_sweep",
            Operation::SetSpecDelay => "set_spec_delay",
            Operation::StartSpectrum => "start_spectrum",
            Operation::ReadSpectrum => "read_spectrum",
        }
    }

    /// Reply grammar the controller must answer with.
    pub fn grammar(self) -> ReplyGrammar {
        match self {
            Operation::StartScan | Operation::StopScan | Operation::StartSpectrum => {
                ReplyGrammar::Echo
            }
            Operation::PollStatus => ReplyGrammar::StatusToken,
            Operation::ReadImage | Operation::ReadSpectrum => ReplyGrammar::Payload,
            _ => ReplyGrammar::NumericAck,
        }
    }

    /// True when the reply carries measurement data for preview/export.
    pub fn is_measurement(self) -> bool {
        self.grammar() == ReplyGrammar::Payload
    }

    /// Look up by template key.
    pub fn from_name(name: &str) -> Option<Operation> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// All template keys.
    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::ALL.into_iter().map(Operation::name)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_and_match_serde() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(op));
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.name()));
        }
        assert_eq!(Operation::from_name("launch"), None);
    }

    #[test]
    fn measurement_operations() {
        let measuring: Vec<_> = Operation::ALL
            .into_iter()
            .filter(|op| op.is_measurement())
            .collect();
        assert_eq!(measuring, vec![Operation::ReadImage, Operation::ReadSpectrum]);
    }
}
