use crate::{
    round_state::Step,
    state_machine::Input,
    ticker::{run_ticker, TimeoutInfo},
};
use quorum_consensus_roles::validator::{BlockHeight, Round};
use zksync_concurrency::{ctx, scope, time};

fn tick(millis: i64, height: u64, round: u32, step: Step) -> TimeoutInfo {
    TimeoutInfo {
        duration: time::Duration::milliseconds(millis),
        height: BlockHeight(height),
        round: Round(round),
        step,
    }
}

#[test]
fn supersession_is_strict_lexicographic() {
    let armed = tick(0, 5, 1, Step::Propose);
    // Anything at or below the armed (height, round, step) is stale.
    assert!(!tick(0, 5, 1, Step::Propose).supersedes(&armed));
    assert!(!tick(0, 5, 1, Step::NewRound).supersedes(&armed));
    assert!(!tick(0, 5, 0, Step::Commit).supersedes(&armed));
    assert!(!tick(0, 4, 9, Step::Commit).supersedes(&armed));
    // Any strictly greater position wins, regardless of duration.
    assert!(tick(0, 5, 1, Step::Prevote).supersedes(&armed));
    assert!(tick(0, 5, 2, Step::NewRound).supersedes(&armed));
    assert!(tick(0, 6, 0, Step::NewHeight).supersedes(&armed));
}

/// The ticker fires exactly one tock, for the greatest scheduled
/// (height, round, step); stale requests never fire.
#[tokio::test]
async fn fires_only_the_latest_armed() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (tick_send, tick_recv) = ctx::channel::unbounded();
        let (tock_send, mut tock_recv) = ctx::channel::unbounded();
        s.spawn_bg(run_ticker(ctx, tick_recv, tock_send));

        tick_send.send(tick(300, 1, 0, Step::Propose));
        // Stale: same height and round, earlier step.
        tick_send.send(tick(5, 1, 0, Step::NewRound));
        // Supersedes with a short fuse; this is the one that fires.
        tick_send.send(tick(20, 1, 1, Step::PrevoteWait));

        let Input::Tock(fired) = tock_recv.recv(ctx).await.unwrap() else {
            panic!("expected a tock");
        };
        assert_eq!(
            (fired.height, fired.round, fired.step),
            (BlockHeight(1), Round(1), Step::PrevoteWait)
        );

        // Nothing else is armed; no second tock shows up.
        ctx.sleep(time::Duration::milliseconds(350)).await?;
        assert!(tock_recv.try_recv().is_none());
        Ok(())
    })
    .await
    .unwrap();
}

/// Re-arming the same (height, round, step) does not produce a second
/// fire.
#[tokio::test]
async fn rearming_same_position_is_a_noop() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (tick_send, tick_recv) = ctx::channel::unbounded();
        let (tock_send, mut tock_recv) = ctx::channel::unbounded();
        s.spawn_bg(run_ticker(ctx, tick_recv, tock_send));

        tick_send.send(tick(20, 2, 0, Step::Propose));
        tick_send.send(tick(300, 2, 0, Step::Propose));

        let Input::Tock(fired) = tock_recv.recv(ctx).await.unwrap() else {
            panic!("expected a tock");
        };
        assert_eq!(fired.step, Step::Propose);

        ctx.sleep(time::Duration::milliseconds(350)).await?;
        assert!(tock_recv.try_recv().is_none());
        Ok(())
    })
    .await
    .unwrap();
}

/// After a fire the ticker is disarmed and accepts a fresh schedule for
/// a later position.
#[tokio::test]
async fn fires_again_for_later_positions() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (tick_send, tick_recv) = ctx::channel::unbounded();
        let (tock_send, mut tock_recv) = ctx::channel::unbounded();
        s.spawn_bg(run_ticker(ctx, tick_recv, tock_send));

        tick_send.send(tick(10, 3, 0, Step::Propose));
        let Input::Tock(first) = tock_recv.recv(ctx).await.unwrap() else {
            panic!("expected a tock");
        };
        assert_eq!(first.round, Round(0));

        tick_send.send(tick(10, 3, 1, Step::Propose));
        let Input::Tock(second) = tock_recv.recv(ctx).await.unwrap() else {
            panic!("expected a tock");
        };
        assert_eq!(second.round, Round(1));
        Ok(())
    })
    .await
    .unwrap();
}
