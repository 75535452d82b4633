//! Property tests for the simulated relay's presence roster.

use ghost_client::Channel;
use ghost_core::SessionIdentity;
use ghost_harness::{RelayConfig, SimChannel, SimRelay};
use proptest::prelude::*;

const MEMBERS: usize = 3;

#[derive(Debug, Clone, Copy)]
enum Op {
    Subscribe(usize),
    Track(usize),
    Leave(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..MEMBERS).prop_map(Op::Subscribe),
        (0..MEMBERS).prop_map(Op::Track),
        (0..MEMBERS).prop_map(Op::Leave),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
struct ModelMember {
    subscribed: bool,
    tracked: bool,
}

fn identity(member: usize) -> SessionIdentity {
    SessionIdentity::from_raw(&format!("member-{member}"))
}

async fn apply(channels: &mut [SimChannel], model: &mut [ModelMember], op: Op) {
    match op {
        Op::Subscribe(m) => {
            channels[m].subscribe("s").await.unwrap();
            model[m] = ModelMember { subscribed: true, tracked: false };
        },
        Op::Track(m) => {
            let result = channels[m].track(&identity(m)).await;
            assert_eq!(result.is_ok(), model[m].subscribed);
            if model[m].subscribed {
                model[m].tracked = true;
            }
        },
        Op::Leave(m) => {
            channels[m].unsubscribe().await;
            model[m] = ModelMember::default();
        },
    }
}

proptest! {
    #[test]
    fn roster_lists_exactly_the_tracked_subscribers(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();

        runtime.block_on(async {
            let relay = SimRelay::with_config(RelayConfig { presence_sync: None });
            let mut channels: Vec<SimChannel> = (0..MEMBERS).map(|_| relay.connect()).collect();
            let mut model = [ModelMember::default(); MEMBERS];

            for op in ops {
                apply(&mut channels, &mut model, op).await;

                let expected: Vec<SessionIdentity> = (0..MEMBERS)
                    .filter(|m| model[*m].subscribed && model[*m].tracked)
                    .map(identity)
                    .collect();
                let subscribed = model.iter().filter(|m| m.subscribed).count();

                assert_eq!(relay.roster("s"), expected, "after {op:?}");
                assert_eq!(relay.subscriber_count("s"), subscribed, "after {op:?}");
            }
        });
    }
}
