//! Command set of the capture protocol
//!
//! Mirrors the device's ioctl-style contract: each `Command` maps to one
//! session operation and yields one `Response` shape.

use tracing::{debug, warn};

use super::format::{FormatDescriptor, FormatRequest, PixFormat};
use super::pool::BufferInfo;
use super::session::{BufferRequest, Capability, CaptureSession};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryCapability,
    EnumFormat { index: u32 },
    GetFormat,
    TryFormat(FormatRequest),
    SetFormat(FormatRequest),
    RequestBuffers(BufferRequest),
    QueryBuffer { index: u32 },
    PrepareBuffer { index: u32 },
    EnqueueBuffer { index: u32 },
    DequeueBuffer { non_blocking: bool },
    StreamOn,
    StreamOff,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryCapability => "query-capability",
            Self::EnumFormat { .. } => "enumerate-format",
            Self::GetFormat => "get-format",
            Self::TryFormat(_) => "try-format",
            Self::SetFormat(_) => "set-format",
            Self::RequestBuffers(_) => "request-buffers",
            Self::QueryBuffer { .. } => "query-buffer",
            Self::PrepareBuffer { .. } => "prepare-buffer",
            Self::EnqueueBuffer { .. } => "enqueue-buffer",
            Self::DequeueBuffer { .. } => "dequeue-buffer",
            Self::StreamOn => "start-stream",
            Self::StreamOff => "stop-stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Capability(Capability),
    FormatDescriptor(FormatDescriptor),
    Format(PixFormat),
    BufferCount(u32),
    Buffer(BufferInfo),
    Done,
}

impl CaptureSession {
    /// Dispatch one command.
    pub fn execute(&self, command: Command) -> Result<Response> {
        let name = command.name();
        debug!("{}: {:?}", name, command);

        let result = match command {
            Command::QueryCapability => Ok(Response::Capability(self.query_capability())),
            Command::EnumFormat { index } => self.enum_format(index).map(Response::FormatDescriptor),
            Command::GetFormat => Ok(Response::Format(self.get_format())),
            Command::TryFormat(request) => self.try_format(&request).map(Response::Format),
            Command::SetFormat(request) => self.set_format(&request).map(Response::Format),
            Command::RequestBuffers(request) => {
                self.request_buffers(&request).map(Response::BufferCount)
            }
            Command::QueryBuffer { index } => self.query_buffer(index).map(Response::Buffer),
            Command::PrepareBuffer { index } => self.prepare_buffer(index).map(|()| Response::Done),
            Command::EnqueueBuffer { index } => self.enqueue_buffer(index).map(|()| Response::Done),
            Command::DequeueBuffer { non_blocking } => {
                self.dequeue_buffer(non_blocking).map(Response::Buffer)
            }
            Command::StreamOn => self.start_streaming().map(|()| Response::Done),
            Command::StreamOff => {
                self.stop_streaming();
                Ok(Response::Done)
            }
        };

        if let Err(e) = &result {
            warn!("{} failed: {}", name, e);
        }
        result
    }
}
