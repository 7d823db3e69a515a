//! Virtual video demo client: drives the full capture protocol against the emulated device

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use virtual_video::capture::{BufferRequest, FormatRequest, FourCC, Frame};
use virtual_video::pipeline::snapshot;
use virtual_video::{utils, Config, DeviceError, VirtualDevice};

#[derive(Debug, Parser)]
#[command(name = "virtual-video", about = "Capture frames from the virtual video device")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames to capture
    #[arg(long)]
    frames: Option<u32>,

    /// Directory for BMP snapshots
    #[arg(long)]
    output: Option<PathBuf>,

    /// Capture without writing snapshots
    #[arg(long)]
    no_snapshots: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing("virtual_video=info");

    info!("Virtual video launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(frames) = args.frames {
        config.demo.frame_count = frames;
    }
    if let Some(output) = &args.output {
        config.demo.output_dir = output.display().to_string();
    }
    if args.no_snapshots {
        config.demo.write_snapshots = false;
    }
    let demo = config.demo.clone();

    let device = VirtualDevice::new(&config, Handle::current())?;
    let session = Arc::new(device.open()?);
    utils::log_device_info(&session);

    match session.try_format(&FormatRequest::new(FourCC::YUYV, demo.width, demo.height)) {
        Ok(_) => info!("Support format YUYV"),
        Err(_) => info!("Not support format YUYV!"),
    }

    let fourcc: FourCC = demo.format.parse()?;
    let pix = session.set_format(&FormatRequest::new(fourcc, demo.width, demo.height))?;
    info!(
        "Format: {}x{} {} ({} bytes per line, {} bytes)",
        pix.width, pix.height, pix.fourcc, pix.bytes_per_line, pix.size_image
    );

    let count = session.request_buffers(&BufferRequest::capture(demo.buffer_count))?;
    info!("req.count={}", count);

    let mut mappings = Vec::with_capacity(count as usize);
    for index in 0..count {
        let buffer = session.query_buffer(index)?;
        let mapping = session.map_offset(buffer.offset)?;
        info!(
            "Buffer {} mapped: offset {}, {} bytes",
            mapping.index(),
            mapping.offset(),
            mapping.len()
        );
        mappings.push(mapping);
        session.enqueue_buffer(index)?;
    }

    session.start_streaming()?;

    // Capture thread -> snapshot writer
    let (tx, rx) = bounded::<Frame>(count as usize);
    let frame_count = demo.frame_count;
    let capture_session = Arc::clone(&session);
    let capture_handle = tokio::task::spawn_blocking(move || -> Result<u32> {
        let mut captured = 0;
        while captured < frame_count {
            let buffer = match capture_session.dequeue_buffer(false) {
                Ok(buffer) => buffer,
                Err(DeviceError::StreamStopped) => {
                    warn!("Stream stopped after {} frames", captured);
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let frame = capture_session.snapshot(&buffer)?;
            capture_session.enqueue_buffer(buffer.index)?;
            captured += 1;

            if tx.send(frame).is_err() {
                break;
            }
        }
        Ok(captured)
    });

    let output_dir = PathBuf::from(&demo.output_dir);
    let writer = async {
        while let Ok(frame) = rx.recv_async().await {
            info!(
                "Frame {} from buffer {}: {} bytes at {:?}",
                frame.meta.sequence,
                frame.meta.buffer_index,
                frame.data.len(),
                frame.meta.device_timestamp
            );
            if demo.write_snapshots {
                let path = snapshot::frame_path(&output_dir, frame.meta.sequence);
                if let Err(e) = snapshot::write_frame(&frame, &path) {
                    error!("Failed to write {}: {}", path.display(), e);
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping stream");
            session.stop_streaming();
        }
    }

    let captured = capture_handle
        .await
        .map_err(|e| eyre!("capture task failed: {}", e))??;
    session.stop_streaming();

    let stats = session.producer_stats();
    info!(
        "Captured {} frames ({} produced, {} idle ticks)",
        captured, stats.frames_produced, stats.idle_ticks
    );

    // Mappings read the same memory the producer filled
    if let Some(first) = mappings.first() {
        match first.read(|data| data.iter().take(4).copied().collect::<Vec<_>>()) {
            Ok(head) => info!("Buffer {} starts with {:02x?}", first.index(), head),
            Err(e) => warn!("Buffer {} not readable: {}", first.index(), e),
        }
    }
    drop(mappings);
    Arc::try_unwrap(session)
        .map_err(|_| eyre!("session still shared"))?
        .close();

    info!("Virtual video shutting down");
    Ok(())
}
