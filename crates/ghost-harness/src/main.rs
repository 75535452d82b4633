//! Ghostline session simulator.
//!
//! Runs two participants over an in-memory relay: key exchange, fingerprint
//! verification, text and voice messages, then termination. Every step is
//! logged.
//!
//! # Usage
//!
//! ```bash
//! ghost-sim --seed 7 --messages 3 --log-level debug
//! ```

use std::f32::consts::TAU;

use clap::Parser;
use ghost_client::{SessionConfig, SessionNotice};
use ghost_core::{AudioOutput, VoiceError};
use ghost_harness::{MemoryRegistry, Participant, SimEnv, SimRelay};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Samples per captured voice chunk (20 ms at 48 kHz)
const CHUNK_SAMPLES: usize = 960;

/// Ghostline two-party session simulator
#[derive(Parser, Debug)]
#[command(name = "ghost-sim")]
#[command(about = "Simulate an ephemeral two-party Ghostline session")]
#[command(version)]
struct Args {
    /// RNG seed; the peer uses seed + 1
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Text messages each side sends
    #[arg(short, long, default_value = "2")]
    messages: usize,

    /// Voice chunks in the voice message
    #[arg(long, default_value = "25")]
    voice_chunks: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Discards rendered audio.
struct NullOutput;

impl AudioOutput for NullOutput {
    fn render(&mut self, _samples: &[f32]) -> Result<(), VoiceError> {
        Ok(())
    }

    fn release(&mut self) {}
}

/// 440 Hz tone as 16-bit little-endian PCM chunks.
fn tone(chunks: usize) -> Vec<Vec<u8>> {
    (0..chunks)
        .map(|chunk| {
            (0..CHUNK_SAMPLES)
                .flat_map(|i| {
                    let t = (chunk * CHUNK_SAMPLES + i) as f32 / 48_000.0;
                    let sample = ((TAU * 440.0 * t).sin() * 8_000.0) as i16;
                    sample.to_le_bytes()
                })
                .collect()
        })
        .collect()
}

async fn fingerprints(participant: &mut Participant) -> Result<(String, String), String> {
    match participant.wait_for(|n| matches!(n, SessionNotice::FingerprintsReady { .. })).await {
        Some(SessionNotice::FingerprintsReady { local, peer }) => {
            Ok((local.to_string(), peer.to_string()))
        },
        _ => Err(format!("{} stopped before the key exchange", participant.name())),
    }
}

async fn received(participant: &mut Participant) -> Result<String, String> {
    match participant.wait_for(|n| matches!(n, SessionNotice::MessageReceived { .. })).await {
        Some(SessionNotice::MessageReceived { id, .. }) => Ok(id),
        _ => Err(format!("{} stopped before a message arrived", participant.name())),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let relay = SimRelay::new();
    let registry = MemoryRegistry::new();

    let mut alice = Participant::create(
        "alice",
        SimEnv::with_seed(args.seed),
        SessionConfig::default(),
        &relay,
        &registry,
    )
    .await?;
    tracing::info!(session_id = %alice.session_id(), "alice created the session");

    let mut bob = Participant::join(
        "bob",
        SimEnv::with_seed(args.seed.wrapping_add(1)),
        SessionConfig::default(),
        &relay,
        &registry,
        alice.session_id(),
    )?;
    tracing::info!("bob joined");

    let (alice_local, alice_peer) = fingerprints(&mut alice).await?;
    let (bob_local, bob_peer) = fingerprints(&mut bob).await?;
    tracing::info!(alice = %alice_local, bob = %bob_local, "fingerprints ready");

    if alice_local != bob_peer || bob_local != alice_peer {
        return Err("fingerprints do not match, refusing to verify".into());
    }
    alice.handle().confirm_verification().await?;
    bob.handle().confirm_verification().await?;
    tracing::info!("both sides verified");

    for n in 0..args.messages {
        let id = alice.handle().send_text(&format!("hello #{n} from alice")).await?;
        received(&mut bob).await?;
        tracing::info!(%id, "bob received alice's message");

        let id = bob.handle().send_text(&format!("hello #{n} from bob")).await?;
        received(&mut alice).await?;
        tracing::info!(%id, "alice received bob's message");
    }

    let voice_id = alice.handle().send_voice(tone(args.voice_chunks)).await?;
    let delivered = received(&mut bob).await?;
    let report = bob.handle().play_voice(&delivered, Box::new(NullOutput)).await?;
    tracing::info!(
        %voice_id,
        samples = report.samples_rendered,
        duration_ms = report.duration_ms,
        "bob played the voice message"
    );

    match bob.handle().play_voice(&delivered, Box::new(NullOutput)).await {
        Err(err) => tracing::info!(error = %err, "second playback refused"),
        Ok(_) => return Err("voice message played twice".into()),
    }

    let snapshot = alice.handle().snapshot().await?;
    tracing::info!(
        messages = snapshot.memory.count,
        bytes = snapshot.memory.estimated_bytes,
        "alice queue before termination"
    );

    alice.handle().terminate().await?;
    let alice_notices = alice.finished().await?;
    let bob_notices = bob.finished().await?;

    for (name, notices) in [("alice", &alice_notices), ("bob", &bob_notices)] {
        let reason = notices.iter().find_map(|n| match n {
            SessionNotice::Terminated { reason } => Some(*reason),
            _ => None,
        });
        tracing::info!(name, ?reason, "session ended");
    }

    let calls = registry.calls();
    tracing::info!(
        reserve = calls.reserve,
        validate = calls.validate,
        extend = calls.extend,
        delete = calls.delete,
        "registry calls"
    );

    Ok(())
}
