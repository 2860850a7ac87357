use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use env_logger::Env;
use hwcodec::component::CompletedCommand;
use hwcodec::utils::format_timestamp;
use hwcodec::{
    BufferFlags, BufferRef, CodecFamily, Command, Component, ComponentCallbacks, ComponentEvent,
    ComponentState, Config, LoopbackDriver, PipelineStats, ProcessType,
};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// hwcodec - run a synthetic stream through the codec component pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames to feed
    #[arg(short, long, default_value = "120")]
    frames: u32,

    /// Buffer exchange mode for both ports
    #[arg(short, long, value_enum, default_value = "share")]
    mode: Mode,

    /// Frames the loopback codec holds back before emitting in timestamp order
    #[arg(long, default_value = "2")]
    reorder_depth: usize,

    /// Codec family to announce
    #[arg(long, default_value = "h264")]
    codec: String,

    /// Configuration file (defaults to the layered system/user configuration)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Share,
    Copy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.frames == 0 {
        bail!("--frames must be at least 1");
    }

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting hwcodec v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => hwcodec::utils::load_config()?,
    };
    config.pipeline.codec_family = parse_family(&args.codec)?;
    if args.mode == Mode::Copy {
        config.input_port.process_type = ProcessType::Copy;
        config.output_port.process_type = ProcessType::Copy;
    }
    config.validate()?;

    let cancel = Arc::new(AtomicBool::new(false));
    let session_cancel = Arc::clone(&cancel);
    let frames = args.frames;
    let reorder_depth = args.reorder_depth;
    let mut session =
        tokio::task::spawn_blocking(move || run_session(config, frames, reorder_depth, &session_cancel));

    let stats = tokio::select! {
        joined = &mut session => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            cancel.store(true, Ordering::SeqCst);
            session.await??
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

fn parse_family(name: &str) -> Result<CodecFamily> {
    serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
        .map_err(|_| anyhow!("Unknown codec family '{}'", name))
}

fn print_stats(stats: &PipelineStats) {
    println!("frames submitted:    {}", stats.frames_submitted);
    println!("frames delivered:    {}", stats.frames_delivered);
    println!("frames dropped:      {}", stats.frames_dropped);
    println!("frames corrupted:    {}", stats.frames_corrupted);
    println!("buffers returned:    {}", stats.buffers_returned());
    println!("timestamp warnings:  {}", stats.timestamp_warnings);
    println!("eos bypassed:        {}", stats.eos_bypassed);
    println!("flushes:             {}", stats.flushes);
}

/// Callback notification forwarded to the session thread
enum Notice {
    Event(ComponentEvent),
    InputDone(BufferRef),
    OutputDone(BufferRef),
}

struct ChannelCallbacks {
    tx: Sender<Notice>,
}

impl ComponentCallbacks for ChannelCallbacks {
    fn event(&self, event: ComponentEvent) {
        let _ = self.tx.send(Notice::Event(event));
    }

    fn empty_buffer_done(&self, buffer: BufferRef) {
        let _ = self.tx.send(Notice::InputDone(buffer));
    }

    fn fill_buffer_done(&self, buffer: BufferRef) {
        let _ = self.tx.send(Notice::OutputDone(buffer));
    }
}

struct Session<'a> {
    component: Component,
    notices: Receiver<Notice>,
    cancel: &'a AtomicBool,
    free_inputs: Vec<BufferRef>,
    all_buffers: Vec<BufferRef>,
    recycle_outputs: bool,
    end_of_stream: bool,
    delivered: u32,
}

impl Session<'_> {
    /// Handle one notification. Returns events the caller may be waiting for.
    fn pump(&mut self, timeout: Duration) -> Result<Option<ComponentEvent>> {
        let notice = match self.notices.recv_timeout(timeout) {
            Ok(notice) => notice,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("component callbacks disconnected"),
        };

        match notice {
            Notice::InputDone(buffer) => self.free_inputs.push(buffer),
            Notice::OutputDone(buffer) => {
                if buffer.filled_len() > 0 {
                    self.delivered += 1;
                    debug!(
                        "Frame {} at {} ({} bytes)",
                        self.delivered,
                        format_timestamp(buffer.timestamp()),
                        buffer.filled_len()
                    );
                }
                if buffer.flags().contains(BufferFlags::EOS) {
                    self.end_of_stream = true;
                    self.recycle_outputs = false;
                }
                if self.recycle_outputs {
                    self.component.fill_this_buffer(&buffer)?;
                }
            }
            Notice::Event(event) => {
                if let ComponentEvent::Error(code) = event {
                    error!("Component error: {:?}", code);
                }
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn wait_for_state(&mut self, target: ComponentState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.pump(Duration::from_millis(50))? {
                Some(ComponentEvent::CommandComplete(CompletedCommand::StateSet(state))) if state == target => {
                    return Ok(());
                }
                Some(ComponentEvent::Error(code)) => bail!("transition to {} failed: {:?}", target, code),
                _ => {}
            }
        }
        bail!("timed out waiting for {}", target)
    }
}

fn run_session(config: Config, frames: u32, reorder_depth: usize, cancel: &AtomicBool) -> Result<PipelineStats> {
    let (tx, notices) = unbounded();
    let driver = LoopbackDriver::new(config.pipeline.codec_family, config.input_port.buffer_count)
        .with_reorder_depth(reorder_depth);
    let rendezvous = config.pipeline.rendezvous_timeout();

    let component = Component::builder()
        .with_config(config.clone())
        .with_driver(Arc::new(driver))
        .with_callbacks(Arc::new(ChannelCallbacks { tx }))
        .build()
        .context("Failed to create component")?;

    let mut session = Session {
        component,
        notices,
        cancel,
        free_inputs: Vec::new(),
        all_buffers: Vec::new(),
        recycle_outputs: true,
        end_of_stream: false,
        delivered: 0,
    };

    session.component.send_command(Command::StateSet(ComponentState::Idle))?;
    for (port, port_config) in [(0, &config.input_port), (1, &config.output_port)] {
        for _ in 0..port_config.buffer_count {
            let buffer = session.component.allocate_buffer(port, port_config.buffer_size)?;
            if port == 0 {
                session.free_inputs.push(buffer.clone());
            }
            session.all_buffers.push(buffer);
        }
    }
    session.wait_for_state(ComponentState::Idle, rendezvous)?;

    session.component.send_command(Command::StateSet(ComponentState::Executing))?;
    session.wait_for_state(ComponentState::Executing, rendezvous)?;

    for buffer in session.all_buffers.iter().filter(|b| b.port_index() == 1) {
        session.component.fill_this_buffer(buffer)?;
    }

    let frame_interval = 33_333;
    let mut next_frame = 0;
    while !session.end_of_stream && !session.cancel.load(Ordering::SeqCst) {
        while next_frame < frames {
            let Some(buffer) = session.free_inputs.pop() else {
                break;
            };
            let payload = format!("frame-{:06}", next_frame);
            buffer.write(payload.as_bytes())?;
            buffer.set_timestamp(i64::from(next_frame) * frame_interval);

            let mut flags = BufferFlags::END_OF_FRAME;
            if next_frame % 30 == 0 {
                flags |= BufferFlags::SYNC_FRAME;
            }
            if next_frame + 1 == frames {
                flags |= BufferFlags::EOS;
            }
            buffer.set_flags(flags);
            session.component.empty_this_buffer(&buffer)?;
            next_frame += 1;
        }
        session.pump(Duration::from_millis(100))?;
    }

    info!("Delivered {} frames, returning to Loaded", session.delivered);
    session.recycle_outputs = false;
    session.component.send_command(Command::StateSet(ComponentState::Idle))?;
    session.wait_for_state(ComponentState::Idle, rendezvous)?;

    session.component.send_command(Command::StateSet(ComponentState::Loaded))?;
    for buffer in std::mem::take(&mut session.all_buffers) {
        session.component.free_buffer(&buffer)?;
    }
    session.wait_for_state(ComponentState::Loaded, rendezvous)?;

    Ok(session.component.stats())
}
