//! Deterministic simulation harness for Ghostline sessions.
//!
//! In-memory implementations of the client's external collaborators, so the
//! production [`ghost_client::Runtime`] runs end to end without a network:
//!
//! - [`SimEnv`]: seeded ChaCha20 randomness and tokio time. Under a paused
//!   clock, subscribe timeouts and grace delays pass instantly and exactly.
//! - [`SimRelay`] / [`SimChannel`]: pub/sub channels with presence rosters and
//!   subscribe fault injection
//! - [`MemoryRegistry`]: session registry that counts calls and can fail on
//!   demand
//! - [`Participant`]: one side of a session running on a spawned task

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod participant;
pub mod registry;
pub mod relay;
pub mod sim_env;

pub use participant::Participant;
pub use registry::{MemoryRegistry, RegistryCalls};
pub use relay::{MemberId, RelayConfig, SimChannel, SimRelay, SubscribeFault};
pub use sim_env::SimEnv;
