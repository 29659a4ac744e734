//! Protocol Client.
//!
//! Composes the template registry and a transport into typed controller
//! operations. The client reports failures with their [`FailureClass`]
//! attached (via [`ClientError::class`]) but never retries on its own; that
//! decision belongs to the executor.
//!
//! [`FailureClass`]: spm_core::FailureClass

use crate::operation::Operation;
use crate::reply::{parse_reply, ControllerStatus, Reply};
use crate::template::TemplateRegistry;
use crate::transport::Transport;
use spm_core::{ClientError, CommandArgs, TransportError};
use std::sync::Arc;
use tracing::instrument;

/// Typed access to the controller over a single owned connection.
pub struct ProtocolClient<T: Transport> {
    templates: Arc<TemplateRegistry>,
    transport: T,
}

impl<T: Transport> ProtocolClient<T> {
    /// Build a client owning `transport`.
    pub fn new(templates: Arc<TemplateRegistry>, transport: T) -> Self {
        Self {
            templates,
            transport,
        }
    }

    /// The template registry in use.
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// The owned transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the owned transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give up the client, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Resolve, send and parse one logical operation.
    #[instrument(skip(self, args), fields(operation = %operation))]
    pub async fn call(&self, operation: Operation, args: &CommandArgs) -> Result<Reply, ClientError> {
        let command = self.templates.resolve(operation.name(), args)?;
        let raw = self.transport.send(&command).await?;
        parse_reply(operation, command.as_str(), &raw)
    }

    async fn ack(&self, operation: Operation, args: CommandArgs) -> Result<f64, ClientError> {
        match self.call(operation, &args).await? {
            Reply::Ack(value) => Ok(value),
            other => Err(unexpected(operation, other)),
        }
    }

    async fn echo(&self, operation: Operation) -> Result<(), ClientError> {
        match self.call(operation, &CommandArgs::new()).await? {
            Reply::Echo => Ok(()),
            other => Err(unexpected(operation, other)),
        }
    }

    async fn data(&self, operation: Operation, args: CommandArgs) -> Result<Vec<f64>, ClientError> {
        match self.call(operation, &args).await? {
            Reply::Data(values) => Ok(values),
            other => Err(unexpected(operation, other)),
        }
    }

    /// Set the tip-sample bias (V). Returns the acknowledged value.
    pub async fn set_bias(&self, bias: f64) -> Result<f64, ClientError> {
        self.ack(Operation::SetBias, CommandArgs::new().with("bias", bias))
            .await
    }

    /// Set the tunnelling current setpoint (A).
    pub async fn set_setpoint(&self, current: f64) -> Result<f64, ClientError> {
        self.ack(
            Operation::SetSetpoint,
            CommandArgs::new().with("current", current),
        )
        .await
    }

    /// Set the scan frame origin and size (m).
    pub async fn set_scan_frame(
        &self,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<f64, ClientError> {
        let args = CommandArgs::new()
            .with("x", x)
            .with("y", y)
            .with("width", width)
            .with("height", height);
        self.ack(Operation::SetScanFrame, args).await
    }

    /// Set the time per scan line (s).
    pub async fn set_scan_speed(&self, line_time: f64) -> Result<f64, ClientError> {
        self.ack(
            Operation::SetScanSpeed,
            CommandArgs::new().with("line_time", line_time),
        )
        .await
    }

    /// Set the number of lines per frame.
    pub async fn set_scan_pixels(&self, lines: u32) -> Result<f64, ClientError> {
        self.ack(
            Operation::SetScanPixels,
            CommandArgs::new().with("lines", lines),
        )
        .await
    }

    /// Start a frame.
    pub async fn start_scan(&self) -> Result<(), ClientError> {
        self.echo(Operation::StartScan).await
    }

    /// Abort the current frame.
    pub async fn stop_scan(&self) -> Result<(), ClientError> {
        self.echo(Operation::StopScan).await
    }

    /// Query the controller state. `ERROR` is returned as `ControllerFault`.
    pub async fn poll_status(&self) -> Result<ControllerStatus, ClientError> {
        match self.call(Operation::PollStatus, &CommandArgs::new()).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(Operation::PollStatus, other)),
        }
    }

    /// Read the image data of one repetition.
    pub async fn read_image(&self, repetition: u32) -> Result<Vec<f64>, ClientError> {
        self.data(
            Operation::ReadImage,
            CommandArgs::new().with("repetition", repetition),
        )
        .await
    }

    /// Move the tip to `(x, y)` (m).
    pub async fn set_tip_position(&self, x: f64, y: f64) -> Result<f64, ClientError> {
        self.ack(
            Operation::SetTipPosition,
            CommandArgs::new().with("x", x).with("y", y),
        )
        .await
    }

    /// Configure the bias sweep of a spectrum.
    pub async fn set_spec_sweep(
        &self,
        start: f64,
        stop: f64,
        points: u32,
    ) -> Result<f64, ClientError> {
        let args = CommandArgs::new()
            .with("start", start)
            .with("stop", stop)
            .with("points", points);
        self.ack(Operation::SetSpecSweep, args).await
    }

    /// Set the settling delay per spectrum point (s).
    pub async fn set_spec_delay(&self, delay: f64) -> Result<f64, ClientError> {
        self.ack(
            Operation::SetSpecDelay,
            CommandArgs::new().with("delay", delay),
        )
        .await
    }

    /// Start a spectrum acquisition.
    pub async fn start_spectrum(&self) -> Result<(), ClientError> {
        self.echo(Operation::StartSpectrum).await
    }

    /// Read the data of one spectrum point.
    pub async fn read_spectrum(&self, point: u32) -> Result<Vec<f64>, ClientError> {
        self.data(
            Operation::ReadSpectrum,
            CommandArgs::new().with("point", point),
        )
        .await
    }

    /// Reconnect the owned transport.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.transport.reconnect().await
    }

    /// Close the owned transport. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

fn unexpected(operation: Operation, reply: Reply) -> ClientError {
    ClientError::Protocol {
        operation: operation.name().to_string(),
        expected: operation.grammar().describe().to_string(),
        got: format!("{:?}", reply),
    }
}
