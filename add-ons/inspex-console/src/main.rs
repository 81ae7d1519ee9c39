//! Inspex console: drive one live inspection session from the terminal.
//!
//! Usage:
//!   cargo run -p inspex-console -- --input question.wav [--output reply.wav] [--photo rim.jpg] [--equipment CAT-320-002]
//!   cargo run -p inspex-console --features device -- --mic [--photo rim.jpg]
//!
//! Streams the WAV in 20 ms frames at real-time pace, writes the assistant's
//! speech to the output WAV and prints commands, transcripts and tool calls.
//! Stops once the input has ended and the model finished its turn, or on Ctrl+C.

use inspex_voice::{
    register_inspection_tools, CommandEvent, EngineEvent, FilePhotoSource, FindingsStore,
    HttpInspectionBackend, LiveConfig, LiveEngine, LiveSession, PlayableFrame, PlaybackSink,
    PlaybackTicket, RawFrame, SessionHandle, ToolCallDispatcher, TurnEvent, VoiceError,
    VoiceResult, WebSocketConnector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Capture frame length
const FRAME_MS: u64 = 20;

/// How long to wait for a reply after the input has ended
const REPLY_GRACE: Duration = Duration::from_secs(30);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Args {
    input: Option<PathBuf>,
    output: PathBuf,
    photo: Option<PathBuf>,
    equipment: Option<String>,
    mic: bool,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        input: None,
        output: PathBuf::from("inspex-reply.wav"),
        photo: None,
        equipment: None,
        mic: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--input" => parsed.input = args.next().map(PathBuf::from),
            "--output" => {
                if let Some(path) = args.next() {
                    parsed.output = PathBuf::from(path);
                }
            }
            "--photo" => parsed.photo = args.next().map(PathBuf::from),
            "--equipment" => parsed.equipment = args.next(),
            "--mic" => parsed.mic = true,
            other => warn!("ignoring unknown argument {}", other),
        }
    }
    parsed
}

fn print_usage() {
    eprintln!("Inspex console: live voice inspection session");
    eprintln!("  --input <wav>        Stream this recording as the inspector's voice");
    eprintln!("  --output <wav>       Where to write the assistant's speech (default inspex-reply.wav)");
    eprintln!("  --photo <jpeg>       Photo used for run_inspection and capture_photo");
    eprintln!("  --equipment <id>     Equipment id (default from config, CAT-320-002)");
    eprintln!("  --mic                Use the default microphone and speaker (needs --features device)");
    eprintln!();
    eprintln!("Requires GEMINI_API_KEY. Config: INSPEX_CONFIG or config/inspex.toml, env INSPEX__*");
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    if args.input.is_none() && !args.mic {
        print_usage();
        return Ok(());
    }

    let mut config = LiveConfig::load()?;
    if let Some(id) = args.equipment.clone() {
        config.equipment.equipment_id = id;
    }
    if config.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; the endpoint must not need a key");
    }

    let photo_path = args
        .photo
        .clone()
        .unwrap_or_else(|| PathBuf::from("inspection.jpg"));
    let mut tools = ToolCallDispatcher::new(config.tool_response_max_bytes);
    register_inspection_tools(
        &mut tools,
        Arc::new(FilePhotoSource::new(photo_path)),
        Arc::new(HttpInspectionBackend::new(config.backend.clone())?),
        FindingsStore::new(),
        config.equipment.clone(),
    );

    let correlation = [
        format!("task-{}", config.equipment.task_id),
        format!("inspection-{}", config.equipment.inspection_id),
    ];
    let mut engine = LiveEngine::new(config, Arc::new(WebSocketConnector), tools);

    let sink = open_sink(&args)?;
    let LiveSession { handle, mut events } = match engine
        .start(&[correlation[0].as_str(), correlation[1].as_str()], sink)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            eprintln!("⚠️ {}", e.user_message());
            return Err(e.into());
        }
    };

    #[cfg(feature = "device")]
    let _mic = if args.mic {
        Some(inspex_voice::MicCapture::start(handle.clone())?)
    } else {
        None
    };

    let mut feeder: Option<JoinHandle<()>> = match &args.input {
        Some(path) if !args.mic => Some(spawn_wav_feeder(path, handle.clone())?),
        _ => None,
    };

    info!("🎙️ Live. Speak (or let the recording play); Ctrl+C to stop");
    let mut reply_deadline: Option<Instant> = None;
    let mut assistant_text = String::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let turn_done = matches!(event, EngineEvent::Turn(TurnEvent::TurnCompleted { .. }));
                on_event(event, &handle, args.photo.as_deref(), &mut assistant_text).await;
                if turn_done && reply_deadline.is_some() {
                    info!("input finished and the model replied, stopping");
                    break;
                }
            }
            Some(_) = async {
                match feeder.as_mut() {
                    Some(f) => Some(f.await),
                    None => None,
                }
            }, if feeder.is_some() => {
                feeder = None;
                reply_deadline = Some(Instant::now() + REPLY_GRACE);
                info!("input finished, waiting for the reply");
            }
            _ = tokio::time::sleep_until(reply_deadline.unwrap_or_else(Instant::now)), if reply_deadline.is_some() => {
                warn!("no reply within {:?}, stopping", REPLY_GRACE);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C, stopping");
                break;
            }
        }
    }

    engine.stop().await;
    info!("👋 Done");
    Ok(())
}

fn open_sink(args: &Args) -> VoiceResult<Box<dyn PlaybackSink>> {
    if args.mic {
        return open_speaker();
    }
    Ok(Box::new(WavSink::create(&args.output)?))
}

#[cfg(feature = "device")]
fn open_speaker() -> VoiceResult<Box<dyn PlaybackSink>> {
    Ok(Box::new(inspex_voice::SpeakerOutput::open()?))
}

#[cfg(not(feature = "device"))]
fn open_speaker() -> VoiceResult<Box<dyn PlaybackSink>> {
    Err(VoiceError::AudioHardwareUnavailable(
        "built without the `device` feature".to_string(),
    ))
}

async fn on_event(
    event: EngineEvent,
    handle: &SessionHandle,
    photo: Option<&Path>,
    assistant_text: &mut String,
) {
    match event {
        EngineEvent::UserTranscript(text) => println!("🧑 {}", text),
        EngineEvent::Command(CommandEvent::AssistantText(text)) => *assistant_text = text,
        EngineEvent::Command(CommandEvent::CapturePhoto) => send_photo(handle, photo, None).await,
        EngineEvent::Command(CommandEvent::CapturePhotoWithContext(context)) => {
            send_photo(handle, photo, Some(context)).await
        }
        EngineEvent::Command(CommandEvent::SubmitTask) => println!("✅ submit_task"),
        EngineEvent::Command(CommandEvent::ImageFeedback(findings)) => {
            println!("📝 image feedback:");
            for finding in findings {
                println!("   - {}", finding);
            }
        }
        EngineEvent::Command(CommandEvent::Action { name, argument }) => {
            println!("🏷️ {} {}", name, argument.unwrap_or_default())
        }
        EngineEvent::Turn(TurnEvent::TurnCompleted { .. }) => {
            if !assistant_text.is_empty() {
                println!("🤖 {}", assistant_text);
                assistant_text.clear();
            }
        }
        EngineEvent::Turn(TurnEvent::Interruption { .. }) => {
            assistant_text.clear();
            println!("⚡ interrupted");
        }
        EngineEvent::ToolStarted { name, .. } => println!("🔧 {} ...", name),
        EngineEvent::ToolFinished { name, ok, .. } => {
            println!("🔧 {} {}", name, if ok { "done" } else { "failed" })
        }
        EngineEvent::Status(message) => eprintln!("⚠️ {}", message),
        EngineEvent::SessionStateChanged { to, .. } => info!("session {}", to.as_str()),
        EngineEvent::Turn(_) => {}
    }
}

async fn send_photo(handle: &SessionHandle, photo: Option<&Path>, context: Option<String>) {
    let Some(path) = photo else {
        println!("📸 capture_photo requested (no --photo given)");
        return;
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            println!("📸 sending {} ({} bytes)", path.display(), bytes.len());
            if let Err(e) = handle.send_image(bytes, "image/jpeg", context) {
                warn!("photo not sent: {}", e);
            }
        }
        Err(e) => warn!("reading {}: {}", path.display(), e),
    }
}

/// Read a WAV file as mono f32 and stream it into the session in real time.
fn spawn_wav_feeder(path: &Path, handle: SessionHandle) -> Result<JoinHandle<()>, BoxError> {
    let mut reader = hound::WavReader::open(path)?;
    let wav_spec = reader.spec();
    let channels = wav_spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match wav_spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (wav_spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    let frame_len = ((wav_spec.sample_rate as u64 * FRAME_MS) / 1000).max(1) as usize;
    info!(
        path = %path.display(),
        sample_rate = wav_spec.sample_rate,
        seconds = mono.len() as f32 / wav_spec.sample_rate.max(1) as f32,
        "📼 Streaming recording"
    );

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
        let mut dropped = 0usize;
        for chunk in mono.chunks(frame_len) {
            ticker.tick().await;
            if !handle.push_audio(RawFrame::f32(chunk.to_vec(), wav_spec.sample_rate)) {
                dropped += 1;
            }
        }
        info!(dropped, "recording streamed (frames dropped while the mic was muted)");
    }))
}

/// Writes downlink speech to a WAV file, completing each frame after its
/// real playing time so turn timing behaves like a speaker.
struct WavSink {
    writer: hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    playhead: Instant,
}

impl WavSink {
    fn create(path: &Path) -> VoiceResult<Self> {
        let wav_spec = hound::WavSpec {
            channels: 1,
            sample_rate: inspex_voice::audio::DOWNLINK_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, wav_spec).map_err(wav_error)?;
        info!(path = %path.display(), "🔊 Writing replies");
        Ok(Self {
            writer,
            playhead: Instant::now(),
        })
    }
}

fn wav_error(e: hound::Error) -> VoiceError {
    VoiceError::Io(std::io::Error::other(e.to_string()))
}

impl PlaybackSink for WavSink {
    fn play(&mut self, frame: PlayableFrame, ticket: PlaybackTicket) -> VoiceResult<()> {
        for &sample in &frame.samples {
            self.writer.write_sample(sample).map_err(wav_error)?;
        }
        let finish = self.playhead.max(Instant::now()) + frame.duration();
        self.playhead = finish;
        tokio::spawn(async move {
            tokio::time::sleep_until(finish).await;
            drop(ticket);
        });
        Ok(())
    }

    fn flush(&mut self) {
        self.playhead = Instant::now();
        if let Err(e) = self.writer.flush() {
            warn!("flushing reply wav: {}", e);
        }
    }
}
