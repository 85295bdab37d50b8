//! Round lifecycle driver.
//!
//! One [`RoundRunner`] owns one round from provisioning to teardown:
//!
//! ```text
//!  PREPARING    provision N channels ──► move pair i into channel i
//!      │
//!  ACTIVE       sleep(silent) ─► spawn signal run ─► sleep(lead)
//!      │        ─► warning broadcast ─► sleep(warning)
//!      │        (every sleep races the cancellation token)
//!      ▼
//!  WINDING_DOWN join signal run ─► members back to lobby
//!      │        ─► delete channels ─► release signal transport
//!      ▼
//!  DONE         finalize status once ─► RoundEnded event
//! ```
//!
//! `drive` covers PREPARING and ACTIVE and may return early (cancel, fault)
//! or panic. PREPARING checks the token before provisioning and again before
//! placement, ACTIVE at every sleep. Whatever it acquired lives in [`RoundResources`], which teardown
//! consumes unconditionally afterwards. Teardown does not observe the
//! cancellation token.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use matchmaking::{Pair, ParticipantId};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bulk::{relocate_all, relocate_moves, BulkSummary};
use crate::collaborators::{
    ChannelBatch, ChannelHandle, Collaborators, GroupId, RoundId, RoundStatus, WarningNotice,
};
use crate::errors::{CollaboratorError, EngineError};
use crate::events::RoundEvent;
use crate::state_machine::{RoundPhase, RoundStateMachine, TransitionRecord};

/// Everything decided before a round starts running.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub group_id: GroupId,
    pub round_id: RoundId,
    pub round_number: u32,
    /// Pair `i` goes to channel `i`.
    pub pairs: Vec<Pair>,
    /// Eligible participants left out of this round.
    pub sitters: Vec<ParticipantId>,
    /// Shared space everyone returns to.
    pub lobby: ChannelHandle,
    pub duration: Duration,
}

impl RoundPlan {
    pub fn paired_members(&self) -> Vec<ParticipantId> {
        self.pairs.iter().flat_map(|p| p.members()).collect()
    }
}

/// What happened during a round, returned when the task finishes.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub group_id: GroupId,
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub pairs: usize,
    pub channels_created: usize,
    /// `None` when provisioning failed before anyone was moved.
    pub placement: Option<BulkSummary>,
    pub warning_issued: bool,
    pub returned: BulkSummary,
    pub channels_removed: usize,
    pub channels_failed: usize,
    pub signal: SignalRun,
    /// Fault description for rounds ending in `Error`.
    pub fault: Option<String>,
    pub transitions: Vec<TransitionRecord>,
}

/// Tally of one audible signalling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalRun {
    pub visited: usize,
    pub failed: usize,
    pub interrupted: bool,
}

/// How PREPARING/ACTIVE ended.
#[derive(Debug)]
enum DriveOutcome {
    Completed,
    Cancelled,
    Faulted(EngineError),
}

/// Resources acquired while driving, released by teardown.
#[derive(Default)]
struct RoundResources {
    channels: Vec<ChannelHandle>,
    placement: Option<BulkSummary>,
    warning_issued: bool,
    signal: Option<(CancellationToken, JoinHandle<SignalRun>)>,
}

pub struct RoundRunner {
    plan: RoundPlan,
    collab: Collaborators,
    cancel: CancellationToken,
}

impl RoundRunner {
    pub fn new(plan: RoundPlan, collab: Collaborators, cancel: CancellationToken) -> Self {
        Self {
            plan,
            collab,
            cancel,
        }
    }

    pub fn plan(&self) -> &RoundPlan {
        &self.plan
    }

    /// Drive the round to `Done`. Never panics past this point and always
    /// finalizes the persisted status exactly once.
    pub async fn run(self) -> RoundReport {
        let round_id = self.plan.round_id;
        let group_id = self.plan.group_id;
        info!(
            %round_id,
            %group_id,
            round_number = self.plan.round_number,
            pairs = self.plan.pairs.len(),
            duration_secs = self.plan.duration.as_secs(),
            "Round starting"
        );

        let mut sm = RoundStateMachine::new();
        let mut res = RoundResources::default();

        let outcome = AssertUnwindSafe(self.drive(&mut sm, &mut res))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                DriveOutcome::Faulted(EngineError::Panicked(panic_message(payload.as_ref())))
            });

        let (status, fault) = match outcome {
            DriveOutcome::Completed => (RoundStatus::Completed, None),
            DriveOutcome::Cancelled => {
                info!(%round_id, "Round cancelled");
                (RoundStatus::Cancelled, None)
            }
            DriveOutcome::Faulted(e) => {
                error!(%round_id, error = %e, "Round faulted");
                (RoundStatus::Error, Some(e.to_string()))
            }
        };
        sm.conclude(status);

        let signal = self.join_signal_run(&mut res).await;
        let teardown = self.wind_down(&mut sm, &res, signal.is_some()).await;

        if let Err(e) = self
            .collab
            .store
            .finalize_round_status(round_id, sm.status())
            .await
        {
            error!(%round_id, status = %sm.status(), error = %e, "Failed to persist final round status");
        }

        let report = RoundReport {
            group_id,
            round_id,
            status: sm.status(),
            pairs: self.plan.pairs.len(),
            channels_created: res.channels.len(),
            placement: res.placement,
            warning_issued: res.warning_issued,
            returned: teardown.returned,
            channels_removed: teardown.channels_removed,
            channels_failed: teardown.channels_failed,
            signal: signal.unwrap_or_default(),
            fault,
            transitions: sm.transitions().to_vec(),
        };

        self.collab.events.publish(RoundEvent::RoundEnded {
            group_id,
            round_id,
            status: report.status,
            pairs: report.pairs,
            returned: report.returned.succeeded(),
            channels_removed: report.channels_removed,
            channels_failed: report.channels_failed,
            timestamp: Utc::now(),
        });

        info!(%round_id, status = %report.status, summary = %sm.summary(), "Round finished");
        report
    }

    // ── PREPARING + ACTIVE ──────────────────────────────────────────────

    async fn drive(&self, sm: &mut RoundStateMachine, res: &mut RoundResources) -> DriveOutcome {
        let config = &self.collab.config;
        let pairs = &self.plan.pairs;

        if self.cancel.is_cancelled() {
            debug!(round_id = %self.plan.round_id, "Stopped before provisioning");
            return DriveOutcome::Cancelled;
        }

        let batch = ChannelBatch::numbered(
            &config.category_name,
            &config.channel_name_prefix,
            pairs.len(),
        );
        match self.collab.provisioner.provision_channels(&batch).await {
            Ok(channels) => res.channels = channels,
            Err(failure) => {
                res.channels = failure.created;
                return DriveOutcome::Faulted(EngineError::Provisioning(failure.error));
            }
        }
        if res.channels.len() != pairs.len() {
            return DriveOutcome::Faulted(EngineError::Provisioning(CollaboratorError::Other(
                format!("expected {} channels, got {}", pairs.len(), res.channels.len()),
            )));
        }

        if self.cancel.is_cancelled() {
            debug!(round_id = %self.plan.round_id, "Stopped before placement");
            return DriveOutcome::Cancelled;
        }

        let moves: Vec<(ParticipantId, ChannelHandle)> = pairs
            .iter()
            .zip(&res.channels)
            .flat_map(|(pair, channel)| {
                pair.members()
                    .into_iter()
                    .map(move |member| (member, channel.clone()))
            })
            .collect();
        let placement = relocate_moves(&self.collab.provisioner, moves).await;
        let summary = placement.summary();
        res.placement = Some(summary);
        if summary.failed() > 0 {
            for failure in placement.failures() {
                if let Err(e) = &failure.result {
                    warn!(round_id = %self.plan.round_id, member = %failure.member, error = %e, "Could not move member into channel");
                }
            }
        }

        self.collab.events.publish(RoundEvent::RoundPrepared {
            group_id: self.plan.group_id,
            round_id: self.plan.round_id,
            pair_count: pairs.len(),
            relocation: summary,
            timestamp: Utc::now(),
        });

        if let Err(e) = sm.advance(RoundPhase::Active, None) {
            return DriveOutcome::Faulted(e.into());
        }

        self.hold(res).await
    }

    /// Wait out the round, issuing the warning when there is room for it.
    async fn hold(&self, res: &mut RoundResources) -> DriveOutcome {
        let config = &self.collab.config;
        let total = self.plan.duration;
        let warning = config.warning_span();
        let hop = config.signal_hop_delay();
        // Signal run is centred on the warning boundary.
        let lead = hop.saturating_mul(res.channels.len() as u32) / 2;

        if warning.is_zero() || total <= warning + lead {
            debug!(round_id = %self.plan.round_id, "Duration too short for a warning span");
            return if self.pause(total).await {
                DriveOutcome::Completed
            } else {
                DriveOutcome::Cancelled
            };
        }

        if !self.pause(total - warning - lead).await {
            return DriveOutcome::Cancelled;
        }

        let token = self.cancel.child_token();
        let handle = tokio::spawn(signal_run(
            self.collab.clone(),
            res.channels.clone(),
            hop,
            token.clone(),
        ));
        res.signal = Some((token, handle));

        if !self.pause(lead).await {
            return DriveOutcome::Cancelled;
        }

        let notice = WarningNotice {
            round_id: self.plan.round_id,
            group_id: self.plan.group_id,
            participants: self
                .plan
                .paired_members()
                .into_iter()
                .chain(self.plan.sitters.iter().copied())
                .collect(),
            channels: res.channels.clone(),
            remaining: warning,
        };
        if let Err(e) = self.collab.announcer.announce_warning(&notice).await {
            return DriveOutcome::Faulted(EngineError::Signal(e));
        }
        res.warning_issued = true;
        info!(round_id = %self.plan.round_id, remaining_secs = warning.as_secs(), "Warning issued");
        self.collab.events.publish(RoundEvent::WarningIssued {
            group_id: self.plan.group_id,
            round_id: self.plan.round_id,
            remaining: warning,
            timestamp: Utc::now(),
        });

        if !self.pause(warning).await {
            return DriveOutcome::Cancelled;
        }
        DriveOutcome::Completed
    }

    /// Sleep for `span` unless cancelled first. Returns `false` on cancel.
    async fn pause(&self, span: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(span) => true,
        }
    }

    // ── WINDING_DOWN ────────────────────────────────────────────────────

    async fn join_signal_run(&self, res: &mut RoundResources) -> Option<SignalRun> {
        let (token, handle) = res.signal.take()?;
        token.cancel();
        match handle.await {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(round_id = %self.plan.round_id, error = %e, "Signal run panicked");
                Some(SignalRun {
                    interrupted: true,
                    ..SignalRun::default()
                })
            }
        }
    }

    async fn wind_down(
        &self,
        sm: &mut RoundStateMachine,
        res: &RoundResources,
        signal_started: bool,
    ) -> Teardown {
        let round_id = self.plan.round_id;
        if let Err(e) = sm.advance(RoundPhase::WindingDown, None) {
            warn!(%round_id, error = %e, "Unexpected phase before teardown");
        }

        // Nobody was moved if placement never ran.
        let returned = if res.placement.is_some() {
            let lobby = self.plan.lobby.clone();
            let outcome = relocate_all(
                &self.collab.provisioner,
                &self.plan.paired_members(),
                |_| lobby.clone(),
            )
            .await;
            for failure in outcome.failures() {
                if let Err(e) = &failure.result {
                    warn!(%round_id, member = %failure.member, error = %e, "Could not return member to lobby");
                }
            }
            outcome.summary()
        } else {
            BulkSummary::Empty
        };

        let mut channels_removed = 0;
        let mut channels_failed = 0;
        for channel in &res.channels {
            match self.collab.provisioner.delete_channel(channel).await {
                Ok(()) => channels_removed += 1,
                Err(e) if e.is_not_found() => channels_removed += 1,
                Err(e) => {
                    channels_failed += 1;
                    warn!(%round_id, channel = %channel, error = %e, "Failed to delete channel");
                }
            }
        }

        if signal_started {
            if let Err(e) = self.collab.announcer.release_signal_transport().await {
                warn!(%round_id, error = %e, "Failed to release signal transport");
            }
        }

        if let Err(e) = sm.advance(RoundPhase::Done, None) {
            warn!(%round_id, error = %e, "Unexpected phase after teardown");
        }

        Teardown {
            returned,
            channels_removed,
            channels_failed,
        }
    }
}

struct Teardown {
    returned: BulkSummary,
    channels_removed: usize,
    channels_failed: usize,
}

/// Visit each channel in order with the audible signal.
async fn signal_run(
    collab: Collaborators,
    channels: Vec<ChannelHandle>,
    hop: Duration,
    token: CancellationToken,
) -> SignalRun {
    let mut run = SignalRun::default();
    for channel in &channels {
        if token.is_cancelled() {
            run.interrupted = true;
            break;
        }
        match collab.announcer.signal_channel(channel).await {
            Ok(()) => run.visited += 1,
            Err(e) => {
                run.failed += 1;
                warn!(channel = %channel, error = %e, "Signal hop failed");
            }
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                run.interrupted = run.visited + run.failed < channels.len();
                break;
            }
            _ = tokio::time::sleep(hop) => {}
        }
    }
    debug!(visited = run.visited, failed = run.failed, "Signal run finished");
    run
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockChannelProvisioner, MockRoundAnnouncer, MockRoundStore};
    use crate::config::EngineConfig;
    use crate::errors::ProvisionFailure;
    use crate::events::EventBus;
    use std::sync::Arc;

    fn pair(a: u64, b: u64) -> Pair {
        Pair::new(ParticipantId(a), ParticipantId(b)).unwrap()
    }

    fn plan(pairs: Vec<Pair>, duration: Duration) -> RoundPlan {
        RoundPlan {
            group_id: GroupId(1),
            round_id: RoundId(42),
            round_number: 1,
            pairs,
            sitters: Vec::new(),
            lobby: ChannelHandle::new(100, "Lobby"),
            duration,
        }
    }

    fn collaborators(
        store: MockRoundStore,
        provisioner: MockChannelProvisioner,
        announcer: MockRoundAnnouncer,
    ) -> Collaborators {
        Collaborators::new(
            Arc::new(store),
            Arc::new(provisioner),
            Arc::new(announcer),
            EventBus::new().shared(),
            EngineConfig::default(),
        )
    }

    fn store_expecting(status: RoundStatus) -> MockRoundStore {
        let mut store = MockRoundStore::new();
        store
            .expect_finalize_round_status()
            .withf(move |id, s| *id == RoundId(42) && *s == status)
            .times(1)
            .returning(|_, _| Ok(()));
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_tears_down_created_channels() {
        let mut provisioner = MockChannelProvisioner::new();
        provisioner.expect_provision_channels().returning(|_| {
            Err(ProvisionFailure::new(
                vec![ChannelHandle::new(1, "Session 1")],
                CollaboratorError::Unavailable("rate limited".into()),
            ))
        });
        provisioner.expect_relocate().never();
        provisioner
            .expect_delete_channel()
            .withf(|c| c.id == 1)
            .times(1)
            .returning(|_| Ok(()));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_release_signal_transport().never();

        let collab = collaborators(store_expecting(RoundStatus::Error), provisioner, announcer);
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2), pair(3, 4)], Duration::from_secs(60)),
            collab,
            CancellationToken::new(),
        );

        let report = runner.run().await;
        assert_eq!(report.status, RoundStatus::Error);
        assert_eq!(report.channels_removed, 1);
        assert!(report.placement.is_none());
        assert!(report.fault.unwrap().contains("rate limited"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_round_skips_warning() {
        let mut provisioner = MockChannelProvisioner::new();
        provisioner
            .expect_provision_channels()
            .returning(|batch| {
                Ok(batch
                    .names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| ChannelHandle::new(i as u64 + 1, n.clone()))
                    .collect())
            });
        provisioner.expect_relocate().returning(|_, _| Ok(()));
        provisioner.expect_delete_channel().times(1).returning(|_| Ok(()));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_announce_warning().never();
        announcer.expect_signal_channel().never();
        announcer.expect_release_signal_transport().never();

        let collab = collaborators(store_expecting(RoundStatus::Completed), provisioner, announcer);
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2)], Duration::from_secs(20)),
            collab,
            CancellationToken::new(),
        );

        let start = tokio::time::Instant::now();
        let report = runner.run().await;
        assert_eq!(report.status, RoundStatus::Completed);
        assert!(!report.warning_issued);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_warning_is_an_error_and_still_tears_down() {
        let mut provisioner = MockChannelProvisioner::new();
        provisioner
            .expect_provision_channels()
            .returning(|_| Ok(vec![ChannelHandle::new(7, "Session 1")]));
        provisioner.expect_relocate().times(4).returning(|_, _| Ok(()));
        provisioner
            .expect_delete_channel()
            .times(1)
            .returning(|_| Err(CollaboratorError::NotFound("gone".into())));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_signal_channel().returning(|_| Ok(()));
        announcer
            .expect_announce_warning()
            .times(1)
            .returning(|_| Err(CollaboratorError::PermissionDenied("send messages".into())));
        announcer
            .expect_release_signal_transport()
            .times(1)
            .returning(|| Ok(()));

        let collab = collaborators(store_expecting(RoundStatus::Error), provisioner, announcer);
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2)], Duration::from_secs(60)),
            collab,
            CancellationToken::new(),
        );

        let report = runner.run().await;
        assert_eq!(report.status, RoundStatus::Error);
        assert_eq!(report.channels_removed, 1);
        assert_eq!(report.returned, BulkSummary::AllSucceeded { count: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait_immediately() {
        let mut provisioner = MockChannelProvisioner::new();
        provisioner
            .expect_provision_channels()
            .times(1)
            .returning(|_| Ok(vec![ChannelHandle::new(7, "Session 1")]));
        provisioner.expect_relocate().returning(|_, _| Ok(()));
        provisioner.expect_delete_channel().times(1).returning(|_| Ok(()));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_announce_warning().never();
        announcer.expect_release_signal_transport().never();

        let collab = collaborators(store_expecting(RoundStatus::Cancelled), provisioner, announcer);
        let cancel = CancellationToken::new();
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2)], Duration::from_secs(600)),
            collab,
            cancel.clone(),
        );

        let start = tokio::time::Instant::now();
        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let report = task.await.unwrap();
        assert_eq!(report.status, RoundStatus::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_provisioning_skips_placement() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut provisioner = MockChannelProvisioner::new();
        provisioner.expect_provision_channels().times(1).returning(move |_| {
            trigger.cancel();
            Ok(vec![ChannelHandle::new(7, "Session 1")])
        });
        provisioner.expect_relocate().never();
        provisioner
            .expect_delete_channel()
            .withf(|c| c.id == 7)
            .times(1)
            .returning(|_| Ok(()));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_announce_warning().never();
        announcer.expect_release_signal_transport().never();

        let collab = collaborators(store_expecting(RoundStatus::Cancelled), provisioner, announcer);
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2)], Duration::from_secs(600)),
            collab,
            cancel,
        );

        let report = runner.run().await;
        assert_eq!(report.status, RoundStatus::Cancelled);
        assert_eq!(report.channels_created, 1);
        assert_eq!(report.channels_removed, 1);
        assert!(report.placement.is_none());
        assert_eq!(report.returned, BulkSummary::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_announcer_is_an_error_and_still_tears_down() {
        let mut provisioner = MockChannelProvisioner::new();
        provisioner
            .expect_provision_channels()
            .returning(|_| Ok(vec![ChannelHandle::new(7, "Session 1")]));
        provisioner.expect_relocate().times(4).returning(|_, _| Ok(()));
        provisioner.expect_delete_channel().times(1).returning(|_| Ok(()));

        let mut announcer = MockRoundAnnouncer::new();
        announcer.expect_signal_channel().returning(|_| Ok(()));
        announcer
            .expect_announce_warning()
            .times(1)
            .returning(|_| panic!("warn boom"));
        announcer
            .expect_release_signal_transport()
            .times(1)
            .returning(|| Ok(()));

        let collab = collaborators(store_expecting(RoundStatus::Error), provisioner, announcer);
        let runner = RoundRunner::new(
            plan(vec![pair(1, 2)], Duration::from_secs(60)),
            collab,
            CancellationToken::new(),
        );

        let report = runner.run().await;
        assert_eq!(report.status, RoundStatus::Error);
        assert_eq!(report.fault.as_deref(), Some("Round task panicked: warn boom"));
        assert!(!report.warning_issued);
        assert_eq!(report.channels_removed, 1);
        assert_eq!(report.returned, BulkSummary::AllSucceeded { count: 2 });
        assert_eq!(report.transitions.last().map(|t| t.to), Some(RoundPhase::Done));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
