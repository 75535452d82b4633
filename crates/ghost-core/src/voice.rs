//! Voice capture, one-time playback and buffer destruction.
//!
//! # Capture
//!
//! A capture is a run of 16-bit little-endian mono PCM chunks. Chunk `i` of a
//! capture started at wall-clock `t` is sealed under
//! `HKDF(session key, label || i || t)` with its own random nonce, so each
//! chunk has an independent key.
//!
//! # Playback
//!
//! ```text
//! play(id) ─▶ mark id played ─▶ decrypt all chunks ─▶ decode PCM ─▶ render
//!                                      │ error                         │
//!                                      ▼                               ▼
//!                               destroy buffers ◀── end / stop() / drop
//! ```
//!
//! The id is consumed before any decryption, so a failed or interrupted
//! playback still counts. Destruction zeroes decoded samples, overwrites the
//! decrypted bytes with random data and then zeroes them, and releases the
//! audio output. It runs exactly once per playback.

use std::collections::HashSet;

use ghost_crypto::{
    CryptoError, NONCE_SIZE, SharedSessionKey, TAG_SIZE, derive_chunk_key, open, seal,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{env::Environment, error::VoiceError, wire};

/// Capture sample rate in Hz.
pub const VOICE_SAMPLE_RATE: u32 = 48_000;

/// Bytes per PCM sample.
const SAMPLE_BYTES: usize = 2;

/// Samples handed to the output per render call in [`Playback::run_to_end`].
const RENDER_QUANTUM: usize = 1024;

/// Default bound on played ids per session.
pub const DEFAULT_MAX_PLAYED_IDS: usize = 1024;

/// One sealed chunk of a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    /// Position within the capture, from zero
    pub index: u32,
    /// AES-256-GCM output under the chunk key
    pub ciphertext: Vec<u8>,
    /// Chunk nonce
    pub nonce: [u8; NONCE_SIZE],
}

/// A complete encrypted recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMessage {
    /// Wall-clock start of the capture, unix milliseconds
    pub capture_timestamp: u64,
    /// Recording length
    pub duration_ms: u64,
    /// Whether the message may be played only once
    pub play_once: bool,
    /// Sealed chunks in capture order
    pub chunks: Vec<EncryptedChunk>,
}

impl VoiceMessage {
    /// Serialize to CBOR.
    ///
    /// # Errors
    ///
    /// - `Malformed` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, VoiceError> {
        wire::encode(self).map_err(|e| VoiceError::Malformed(e.to_string()))
    }

    /// Deserialize from CBOR.
    ///
    /// # Errors
    ///
    /// - `Malformed` if the bytes are not a voice message
    pub fn decode(bytes: &[u8]) -> Result<Self, VoiceError> {
        wire::decode(bytes).map_err(|e| VoiceError::Malformed(e.to_string()))
    }
}

/// Audio sink supplied by the presentation layer.
pub trait AudioOutput {
    /// Render a block of samples in `[-1.0, 1.0]`.
    fn render(&mut self, samples: &[f32]) -> Result<(), VoiceError>;

    /// Release the rendering context. Called exactly once per playback.
    fn release(&mut self);
}

impl<O: AudioOutput + ?Sized> AudioOutput for Box<O> {
    fn render(&mut self, samples: &[f32]) -> Result<(), VoiceError> {
        (**self).render(samples)
    }

    fn release(&mut self) {
        (**self).release();
    }
}

/// Summary of a finished playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Samples handed to the output
    pub samples_rendered: usize,
    /// Declared duration of the message
    pub duration_ms: u64,
}

/// Chunk key derivation, capture packaging and one-time playback for one
/// session.
pub struct VoicePipeline<E: Environment> {
    env: E,
    key: Option<SharedSessionKey>,
    played: HashSet<String>,
    max_played: usize,
}

impl<E: Environment> VoicePipeline<E> {
    /// Pipeline with no key, remembering at most `max_played` ids.
    pub fn new(env: E, max_played: usize) -> Self {
        Self { env, key: None, played: HashSet::new(), max_played }
    }

    /// Bind the session key chunk keys are derived from.
    pub fn bind_key(&mut self, key: SharedSessionKey) {
        self.key = Some(key);
    }

    /// Whether a key is bound.
    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    /// Drop the key and forget every played id.
    pub fn release(&mut self) {
        self.key = None;
        self.played.clear();
    }

    /// Whether `message_id` has been consumed.
    pub fn has_played(&self, message_id: &str) -> bool {
        self.played.contains(message_id)
    }

    /// Number of consumed ids.
    pub fn played_count(&self) -> usize {
        self.played.len()
    }

    /// Begin a capture stamped with the current wall clock.
    ///
    /// # Errors
    ///
    /// - `Crypto(UninitializedKey)` if no key is bound
    pub fn start_capture(&self) -> Result<VoiceCapture<E>, VoiceError> {
        let Some(key) = self.key.clone() else {
            return Err(VoiceError::Crypto(CryptoError::UninitializedKey));
        };

        Ok(VoiceCapture {
            env: self.env.clone(),
            key,
            capture_timestamp: self.env.wall_clock_millis(),
            chunks: Vec::new(),
            sample_count: 0,
        })
    }

    /// Start playing `voice` into `output`.
    ///
    /// The id is marked played before any chunk is decrypted. On error the
    /// returned playback never exists, and `output` has already been
    /// released.
    ///
    /// # Errors
    ///
    /// - `ReplayViolation` if a play-once message was played before
    /// - `PlaybackLimit` if the played-id set is full
    /// - `Crypto` if no key is bound or a chunk fails authentication
    /// - `Malformed` if chunk indices are not `0..n` or PCM is truncated
    pub fn play<O: AudioOutput>(
        &mut self,
        message_id: &str,
        voice: &VoiceMessage,
        mut output: O,
    ) -> Result<Playback<O, E>, VoiceError> {
        let Some(key) = self.key.as_ref() else {
            output.release();
            return Err(VoiceError::Crypto(CryptoError::UninitializedKey));
        };

        if voice.play_once {
            if self.played.contains(message_id) {
                output.release();
                return Err(VoiceError::ReplayViolation { message_id: message_id.to_string() });
            }

            if self.played.len() >= self.max_played {
                output.release();
                return Err(VoiceError::PlaybackLimit { limit: self.max_played });
            }

            self.played.insert(message_id.to_string());
        }

        tracing::debug!(message_id, chunks = voice.chunks.len(), "voice playback starting");

        // Sized up front: a reallocation would free decrypted audio unwiped.
        let plain_len = voice
            .chunks
            .iter()
            .map(|chunk| chunk.ciphertext.len().saturating_sub(TAG_SIZE))
            .sum();

        let mut playback = Playback {
            env: self.env.clone(),
            output,
            raw: Vec::with_capacity(plain_len),
            samples: Vec::new(),
            position: 0,
            duration_ms: voice.duration_ms,
            destroyed: false,
        };

        // Dropping `playback` on any error below runs destruction.
        for (expected, chunk) in voice.chunks.iter().enumerate() {
            if usize::try_from(chunk.index).ok() != Some(expected) {
                return Err(VoiceError::Malformed(format!(
                    "chunk {} out of sequence, expected {expected}",
                    chunk.index
                )));
            }

            let chunk_key = derive_chunk_key(key, chunk.index, voice.capture_timestamp);
            let mut plain = open(chunk_key.as_bytes(), &chunk.nonce, &chunk.ciphertext)?;
            if plain.len() > playback.raw.capacity() - playback.raw.len() {
                plain.zeroize();
                return Err(VoiceError::Malformed("chunk longer than its ciphertext".to_string()));
            }
            playback.raw.extend_from_slice(&plain);
            plain.zeroize();
        }

        if playback.raw.len() % SAMPLE_BYTES != 0 {
            return Err(VoiceError::Malformed("truncated PCM sample".to_string()));
        }

        playback.samples = decode_pcm(&playback.raw);
        Ok(playback)
    }
}

impl<E: Environment> std::fmt::Debug for VoicePipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicePipeline")
            .field("ready", &self.is_ready())
            .field("played", &self.played.len())
            .field("max_played", &self.max_played)
            .finish()
    }
}

/// An in-progress capture.
pub struct VoiceCapture<E: Environment> {
    env: E,
    key: SharedSessionKey,
    capture_timestamp: u64,
    chunks: Vec<EncryptedChunk>,
    sample_count: u64,
}

impl<E: Environment> VoiceCapture<E> {
    /// Seal one chunk of PCM. Returns the chunk's index.
    ///
    /// # Errors
    ///
    /// - `Malformed` if `pcm` is not a whole number of samples, or the
    ///   capture already holds `u32::MAX` chunks
    pub fn push_chunk(&mut self, pcm: &[u8]) -> Result<u32, VoiceError> {
        if pcm.len() % SAMPLE_BYTES != 0 {
            return Err(VoiceError::Malformed("chunk is not whole 16-bit samples".to_string()));
        }

        let index = u32::try_from(self.chunks.len())
            .map_err(|_| VoiceError::Malformed("too many chunks".to_string()))?;

        let chunk_key = derive_chunk_key(&self.key, index, self.capture_timestamp);
        let nonce: [u8; NONCE_SIZE] = self.env.random_array();

        self.chunks.push(EncryptedChunk {
            index,
            ciphertext: seal(chunk_key.as_bytes(), &nonce, pcm),
            nonce,
        });
        self.sample_count += (pcm.len() / SAMPLE_BYTES) as u64;

        Ok(index)
    }

    /// Capture start, unix milliseconds.
    pub fn capture_timestamp(&self) -> u64 {
        self.capture_timestamp
    }

    /// Close the capture.
    pub fn finish(self, play_once: bool) -> VoiceMessage {
        VoiceMessage {
            capture_timestamp: self.capture_timestamp,
            duration_ms: self.sample_count * 1000 / u64::from(VOICE_SAMPLE_RATE),
            play_once,
            chunks: self.chunks,
        }
    }
}

/// A decrypted recording being rendered.
///
/// Buffers are destroyed on natural end, on [`Playback::stop`], or on drop,
/// whichever comes first.
pub struct Playback<O: AudioOutput, E: Environment> {
    env: E,
    output: O,
    raw: Vec<u8>,
    samples: Vec<f32>,
    position: usize,
    duration_ms: u64,
    destroyed: bool,
}

impl<O: AudioOutput, E: Environment> Playback<O, E> {
    /// Render up to `max_samples` more samples. Returns true while samples
    /// remain; the final call destroys the buffers.
    ///
    /// # Errors
    ///
    /// - `Output` if the sink fails (buffers are destroyed)
    pub fn render_next(&mut self, max_samples: usize) -> Result<bool, VoiceError> {
        if self.destroyed {
            return Ok(false);
        }

        let end = (self.position + max_samples).min(self.samples.len());
        if let Err(e) = self.output.render(&self.samples[self.position..end]) {
            self.destroy();
            return Err(e);
        }
        self.position = end;

        if self.position >= self.samples.len() {
            self.destroy();
            return Ok(false);
        }

        Ok(true)
    }

    /// Render everything that remains.
    ///
    /// # Errors
    ///
    /// - `Output` if the sink fails
    pub fn run_to_end(mut self) -> Result<PlaybackReport, VoiceError> {
        let start = self.position;
        while self.render_next(RENDER_QUANTUM)? {}

        Ok(PlaybackReport { samples_rendered: self.position - start, duration_ms: self.duration_ms })
    }

    /// Stop early and destroy the buffers.
    pub fn stop(&mut self) {
        self.destroy();
    }

    /// Decoded samples not yet destroyed.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Samples rendered so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether buffers have been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.samples.zeroize();

        self.env.random_bytes(&mut self.raw);
        self.raw.zeroize();

        self.output.release();
        tracing::debug!("voice playback buffers destroyed");
    }
}

impl<O: AudioOutput, E: Environment> Drop for Playback<O, E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// 16-bit little-endian mono PCM to `f32` in `[-1.0, 1.0]`.
fn decode_pcm(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(SAMPLE_BYTES)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use ghost_crypto::KEY_SIZE;

    use super::*;
    use crate::test_support::TestEnv;

    #[derive(Default, Clone)]
    struct OutputRecorder {
        rendered: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    struct RecordingOutput {
        recorder: OutputRecorder,
        fail: bool,
    }

    impl AudioOutput for RecordingOutput {
        fn render(&mut self, samples: &[f32]) -> Result<(), VoiceError> {
            if self.fail {
                return Err(VoiceError::Output("device lost".to_string()));
            }
            assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
            self.recorder.rendered.fetch_add(samples.len(), Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.recorder.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn output(recorder: &OutputRecorder) -> RecordingOutput {
        RecordingOutput { recorder: recorder.clone(), fail: false }
    }

    fn pipeline() -> VoicePipeline<TestEnv> {
        let mut pipeline = VoicePipeline::new(TestEnv::new(), DEFAULT_MAX_PLAYED_IDS);
        pipeline.bind_key(SharedSessionKey::from_bytes([5; KEY_SIZE]));
        pipeline
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn recording(pipeline: &VoicePipeline<TestEnv>, chunks: usize) -> VoiceMessage {
        let mut capture = pipeline.start_capture().unwrap();
        for _ in 0..chunks {
            capture.push_chunk(&pcm(&[0, 16384, -16384, i16::MAX, i16::MIN])).unwrap();
        }
        capture.finish(true)
    }

    #[test]
    fn capture_indices_increase_from_zero() {
        let pipeline = pipeline();
        let mut capture = pipeline.start_capture().unwrap();

        assert_eq!(capture.push_chunk(&pcm(&[1, 2])).unwrap(), 0);
        assert_eq!(capture.push_chunk(&pcm(&[3, 4])).unwrap(), 1);

        let voice = capture.finish(true);
        assert_eq!(voice.chunks.iter().map(|c| c.index).collect::<Vec<_>>(), [0, 1]);
    }

    #[test]
    fn capture_rejects_partial_samples() {
        let pipeline = pipeline();
        let mut capture = pipeline.start_capture().unwrap();

        assert!(matches!(capture.push_chunk(&[1, 2, 3]), Err(VoiceError::Malformed(_))));
    }

    #[test]
    fn duration_follows_sample_count() {
        let pipeline = pipeline();
        let mut capture = pipeline.start_capture().unwrap();
        capture.push_chunk(&vec![0u8; VOICE_SAMPLE_RATE as usize * SAMPLE_BYTES]).unwrap();

        assert_eq!(capture.finish(true).duration_ms, 1000);
    }

    #[test]
    fn decrypted_audio_is_never_reallocated() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 8);
        let recorder = OutputRecorder::default();

        let playback = pipeline.play("m1", &voice, output(&recorder)).unwrap();

        assert_eq!(playback.raw.len(), 8 * 5 * SAMPLE_BYTES);
        assert_eq!(playback.raw.capacity(), playback.raw.len());
    }

    #[test]
    fn full_playback_renders_and_destroys_once() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 3);
        let recorder = OutputRecorder::default();

        let playback = pipeline.play("m1", &voice, output(&recorder)).unwrap();
        let report = playback.run_to_end().unwrap();

        assert_eq!(report.samples_rendered, 15);
        assert_eq!(recorder.rendered.load(Ordering::SeqCst), 15);
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_play_is_a_replay_violation() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 1);
        let recorder = OutputRecorder::default();

        pipeline.play("m1", &voice, output(&recorder)).unwrap().run_to_end().unwrap();
        let replay = pipeline.play("m1", &voice, output(&recorder));

        assert_eq!(
            replay.err(),
            Some(VoiceError::ReplayViolation { message_id: "m1".to_string() })
        );
    }

    #[test]
    fn failed_playback_still_consumes_id() {
        let mut pipeline = pipeline();
        let mut voice = recording(&pipeline, 2);
        voice.chunks[1].ciphertext[0] ^= 1;
        let recorder = OutputRecorder::default();

        let first = pipeline.play("m1", &voice, output(&recorder));
        assert_eq!(first.err(), Some(VoiceError::Crypto(CryptoError::DecryptionFailed)));
        assert!(pipeline.has_played("m1"));
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);

        let second = pipeline.play("m1", &voice, output(&recorder));
        assert!(matches!(second, Err(VoiceError::ReplayViolation { .. })));
    }

    #[test]
    fn stop_destroys_exactly_once() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 2);
        let recorder = OutputRecorder::default();

        let mut playback = pipeline.play("m1", &voice, output(&recorder)).unwrap();
        assert!(playback.render_next(4).unwrap());
        playback.stop();
        playback.stop();

        assert!(playback.is_destroyed());
        assert!(playback.samples().is_empty());
        assert!(!playback.render_next(4).unwrap());

        drop(playback);
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_mid_playback_destroys() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 2);
        let recorder = OutputRecorder::default();

        let mut playback = pipeline.play("m1", &voice, output(&recorder)).unwrap();
        playback.render_next(1).unwrap();
        drop(playback);

        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_failure_destroys_buffers() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 1);
        let recorder = OutputRecorder::default();

        let mut playback =
            pipeline.play("m1", &voice, RecordingOutput { recorder: recorder.clone(), fail: true }).unwrap();

        assert!(matches!(playback.render_next(8), Err(VoiceError::Output(_))));
        assert!(playback.is_destroyed());
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_order_chunks_are_malformed() {
        let mut pipeline = pipeline();
        let mut voice = recording(&pipeline, 2);
        voice.chunks.swap(0, 1);

        let result = pipeline.play("m1", &voice, output(&OutputRecorder::default()));
        assert!(matches!(result, Err(VoiceError::Malformed(_))));
    }

    #[test]
    fn chunks_do_not_open_at_other_positions() {
        // Re-labelling chunk 1 as chunk 0 changes its key
        let mut pipeline = pipeline();
        let mut voice = recording(&pipeline, 2);
        voice.chunks.remove(0);
        voice.chunks[0].index = 0;

        let result = pipeline.play("m1", &voice, output(&OutputRecorder::default()));
        assert_eq!(result.err(), Some(VoiceError::Crypto(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn played_set_is_bounded() {
        let mut pipeline = VoicePipeline::new(TestEnv::new(), 2);
        pipeline.bind_key(SharedSessionKey::from_bytes([5; KEY_SIZE]));
        let voice = recording(&pipeline, 1);
        let recorder = OutputRecorder::default();

        pipeline.play("a", &voice, output(&recorder)).unwrap();
        pipeline.play("b", &voice, output(&recorder)).unwrap();
        let third = pipeline.play("c", &voice, output(&recorder));

        assert_eq!(third.err(), Some(VoiceError::PlaybackLimit { limit: 2 }));
        assert!(!pipeline.has_played("c"));
    }

    #[test]
    fn replayable_messages_skip_the_played_set() {
        let mut pipeline = pipeline();
        let mut voice = recording(&pipeline, 1);
        voice.play_once = false;
        let recorder = OutputRecorder::default();

        pipeline.play("m1", &voice, output(&recorder)).unwrap();
        pipeline.play("m1", &voice, output(&recorder)).unwrap();

        assert_eq!(pipeline.played_count(), 0);
    }

    #[test]
    fn release_clears_key_and_played_ids() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 1);
        pipeline.play("m1", &voice, output(&OutputRecorder::default())).unwrap();

        pipeline.release();

        assert!(!pipeline.is_ready());
        assert_eq!(pipeline.played_count(), 0);
        assert!(matches!(
            pipeline.start_capture(),
            Err(VoiceError::Crypto(CryptoError::UninitializedKey))
        ));
    }

    #[test]
    fn pcm_decoding_range() {
        let samples = decode_pcm(&pcm(&[0, i16::MIN, i16::MAX]));

        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], -1.0);
        assert!(samples[2] < 1.0 && samples[2] > 0.999);
    }

    #[test]
    fn voice_message_cbor_roundtrip_still_plays() {
        let mut pipeline = pipeline();
        let voice = recording(&pipeline, 2);
        let restored = VoiceMessage::decode(&voice.encode().unwrap()).unwrap();

        assert_eq!(restored, voice);
        assert!(pipeline.play("m1", &restored, output(&OutputRecorder::default())).is_ok());
    }
}
