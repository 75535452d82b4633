//! Fuzz target for the Transport connection state machine
//!
//! # Strategy
//!
//! - Results for current, stale and future attempt numbers
//! - Presence rosters of zero to three other participants
//! - Time jumps across attempt timeouts, backoff and heartbeat deadlines
//! - Close at any point
//!
//! # Invariants
//!
//! - Reported progress always matches the status
//! - The attempt number never exceeds the retry budget
//! - `Failed` is reported at most once, and only on entering `Error`
//! - `Disconnected` is final; `Error` can only move to `Disconnected`
//! - No deadline is pending in a terminal status

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use ghost_core::{
    SessionIdentity, Transport, TransportAction, TransportConfig, TransportEvent, TransportStatus,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum TransportOp {
    Start,
    Validated { ok: bool },
    Subscribed { attempt_offset: i8 },
    Tracked { attempt_offset: i8 },
    SubscribeFailed { attempt_offset: i8 },
    Presence { others: u8 },
    Activity,
    SuspendHeartbeat,
    Advance { millis: u16 },
    Close,
}

fn attempt(transport: &Transport<Duration>, offset: i8) -> u32 {
    transport.attempt().saturating_add_signed(i32::from(offset))
}

fuzz_target!(|ops: Vec<TransportOp>| {
    let config = TransportConfig::default();
    let max_retries = config.max_retries;
    let me = SessionIdentity::from_raw("me");
    let mut transport: Transport<Duration> = Transport::new(config, me.clone());
    let mut now = Duration::ZERO;
    let mut failures = 0;

    for op in ops {
        let before = transport.status();

        let actions = match op {
            TransportOp::Start => transport.start(now).unwrap_or_default(),
            TransportOp::Validated { ok } => {
                let outcome = if ok { Ok(()) } else { Err("expired".to_string()) };
                transport.handle_validation(now, outcome).unwrap_or_default()
            }
            TransportOp::Subscribed { attempt_offset } => {
                let attempt = attempt(&transport, attempt_offset);
                transport.handle_subscribed(now, attempt)
            }
            TransportOp::Tracked { attempt_offset } => {
                let attempt = attempt(&transport, attempt_offset);
                transport.handle_presence_tracked(now, attempt)
            }
            TransportOp::SubscribeFailed { attempt_offset } => {
                let attempt = attempt(&transport, attempt_offset);
                transport.handle_subscribe_failed(now, attempt, "refused".to_string())
            }
            TransportOp::Presence { others } => {
                let mut roster = vec![me.clone()];
                roster.extend((0..others % 4).map(|i| SessionIdentity::from_raw(format!("peer-{i}"))));
                transport.handle_presence(now, &roster)
            }
            TransportOp::Activity => {
                transport.record_activity(now);
                Vec::new()
            }
            TransportOp::SuspendHeartbeat => {
                transport.suspend_heartbeat();
                Vec::new()
            }
            TransportOp::Advance { millis } => {
                now += Duration::from_millis(u64::from(millis));
                transport.tick(now)
            }
            TransportOp::Close => transport.close(),
        };

        let after = transport.status();
        let state = transport.state();

        assert_eq!(state.progress, after.progress());
        assert!(transport.attempt() <= max_retries, "attempt {} over budget", transport.attempt());

        let failed = actions
            .iter()
            .filter(|a| matches!(a, TransportAction::Notify(TransportEvent::Failed(_))))
            .count();
        if failed > 0 {
            assert_eq!(failed, 1);
            assert_eq!(after, TransportStatus::Error);
            assert_ne!(before, TransportStatus::Error);
        }
        failures += failed;
        assert!(failures <= 1, "Failed reported {failures} times");

        match before {
            TransportStatus::Disconnected => assert_eq!(after, TransportStatus::Disconnected),
            TransportStatus::Error => {
                assert!(matches!(after, TransportStatus::Error | TransportStatus::Disconnected));
            }
            _ => {}
        }

        if after.is_terminal() {
            assert_eq!(transport.next_deadline(), None);
            assert!(state.error.is_some() || after == TransportStatus::Disconnected);
        }
    }
});
