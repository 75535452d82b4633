//! Hidden volume helpers for async callers.
//!
//! PBKDF2 with the minimum iteration count takes long enough to stall an
//! event loop, so both directions run on the blocking pool.

use ghost_core::Environment;
use ghost_crypto::{HiddenVolume, HiddenVolumeParams, VolumeContent, VolumeEntropy};
use zeroize::Zeroizing;

use crate::error::SessionError;

/// Seal `real` under `inner_password` and `decoy` under `outer_password`.
///
/// # Errors
///
/// - `Crypto(IdenticalPasswords)` if both passwords are equal
/// - `Crypto(WeakIterationCount)` or `Crypto(ExcessiveIterationCount)` if
///   `params` is out of bounds
/// - `Task` if the blocking task panicked
pub async fn create_hidden_volume<E: Environment>(
    env: &E,
    real: Zeroizing<Vec<u8>>,
    decoy: Vec<u8>,
    outer_password: Zeroizing<String>,
    inner_password: Zeroizing<String>,
    params: HiddenVolumeParams,
) -> Result<HiddenVolume, SessionError> {
    let entropy = VolumeEntropy::generate(|buf| env.random_bytes(buf));

    let volume = tokio::task::spawn_blocking(move || {
        HiddenVolume::create(&real, &decoy, &outer_password, &inner_password, params, entropy)
    })
    .await
    .map_err(|e| SessionError::Task(e.to_string()))??;

    tracing::debug!(iterations = volume.iterations, "hidden volume created");
    Ok(volume)
}

/// Open `volume` with `password`. `None` when the password matches neither
/// slot.
///
/// # Errors
///
/// - `Task` if the blocking task panicked
pub async fn open_hidden_volume(
    volume: HiddenVolume,
    password: Zeroizing<String>,
) -> Result<Option<VolumeContent>, SessionError> {
    tokio::task::spawn_blocking(move || volume.open(&password))
        .await
        .map_err(|e| SessionError::Task(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualEnv;

    fn secret(s: &str) -> Zeroizing<String> {
        Zeroizing::new(s.to_string())
    }

    #[tokio::test]
    async fn volume_opens_per_password() {
        let env = ManualEnv::new(3);
        let volume = create_hidden_volume(
            &env,
            Zeroizing::new(b"real notes".to_vec()),
            b"shopping list".to_vec(),
            secret("outer"),
            secret("inner"),
            HiddenVolumeParams::default(),
        )
        .await
        .unwrap();

        let inner = open_hidden_volume(volume.clone(), secret("inner")).await.unwrap().unwrap();
        let outer = open_hidden_volume(volume.clone(), secret("outer")).await.unwrap().unwrap();
        let wrong = open_hidden_volume(volume, secret("guess")).await.unwrap();

        assert_eq!(inner.content, b"real notes");
        assert!(!inner.is_decoy);
        assert_eq!(outer.content, b"shopping list");
        assert!(outer.is_decoy);
        assert!(wrong.is_none());
    }

    #[tokio::test]
    async fn identical_passwords_are_rejected() {
        let env = ManualEnv::new(3);

        let result = create_hidden_volume(
            &env,
            Zeroizing::new(b"a".to_vec()),
            b"b".to_vec(),
            secret("same"),
            secret("same"),
            HiddenVolumeParams::default(),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            SessionError::Crypto(ghost_crypto::CryptoError::IdenticalPasswords)
        );
    }
}
