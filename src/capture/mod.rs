pub mod command;
pub mod format;
pub mod frame;
pub mod pool;
pub mod producer;
pub mod session;

pub use command::{Command, Response};
pub use format::{FormatRequest, FourCC, PixFormat, PixelFormat};
pub use frame::Frame;
pub use pool::{BufferInfo, BufferState, MemoryType};
pub use producer::{ManualScheduler, ProducerStats, TickScheduler, TokioScheduler};
pub use session::{
    BufferMapping, BufferRequest, BufferType, Capability, CapabilityFlags, CaptureSession,
    VirtualDevice,
};
