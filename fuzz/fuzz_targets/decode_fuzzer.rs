//! Fuzz target for every decoder fed by the network or an import
//!
//! Channel payloads are attacker-controlled: any participant on the relay
//! can broadcast arbitrary bytes, and an exported hidden volume can be
//! swapped on disk.
//!
//! # Invariants
//!
//! - NEVER panic on malformed input; decoders return errors
//! - A decoded envelope re-encodes and decodes to the same value

#![no_main]

use ghost_core::{ChatPayload, Envelope, VoiceMessage};
use ghost_crypto::HiddenVolume;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        let encoded = envelope.encode().expect("decoded envelope must re-encode");
        let again = Envelope::decode(&encoded).expect("re-encoded envelope must decode");
        assert_eq!(envelope, again);

        let _ = envelope.message_id();
        let _ = envelope.acked_id();
    }

    let _ = ChatPayload::decode(data);
    let _ = VoiceMessage::decode(data);

    if let Ok(volume) = HiddenVolume::from_bytes(data) {
        let _ = volume.to_bytes();
    }
});
