use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::capture::{CapabilityFlags, CaptureSession};

/// Install the fmt subscriber; `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// Names of the capability bits that are set
pub fn capability_names(flags: CapabilityFlags) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

/// Log what a probing client would print: identity, capabilities, formats.
pub fn log_device_info(session: &CaptureSession) {
    let caps = session.query_capability();
    info!("driver: {}", caps.driver);
    info!("card: {}", caps.card);
    info!("bus_info: {}", caps.bus_info);
    info!("version: {}", caps.version);
    info!(
        "capabilities: {:#010x} [{}]",
        caps.capabilities.bits(),
        capability_names(caps.capabilities).join(", ")
    );

    info!("Supported formats:");
    for desc in (0..).map_while(|index| session.enum_format(index).ok()) {
        info!("\t{}.{} ({})", desc.index + 1, desc.description, desc.fourcc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_lists_set_bits() {
        let flags = CapabilityFlags::VIDEO_CAPTURE | CapabilityFlags::STREAMING;
        assert_eq!(capability_names(flags), vec!["VIDEO_CAPTURE", "STREAMING"]);
        assert!(capability_names(CapabilityFlags::empty()).is_empty());
    }
}
