//! Session Supervisor: at most one round per group.
//!
//! The per-group slot is the only state shared between concurrent commands.
//! `start_round` checks and reserves it under one lock, so two concurrent
//! starts cannot both pass. The reservation is a drop guard owned by the
//! round task; it clears the slot when the task ends (or when a start is
//! rejected part-way), and only if the slot still belongs to it.
//!
//! ```text
//! start_round ──► [lock] running? duration? eligible? reserve [unlock]
//!                    │
//!                    ├─► history ─► pairing ─► persist round + pairs
//!                    │
//!                    └─► tokio::spawn(RoundRunner::run) ── guard dropped on exit
//!
//! stop_round  ──► [lock] cancel token [unlock]   (returns immediately)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use matchmaking::{Pair, PairingEngine, Participant, ParticipantId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bulk::{relocate_channel_members, BulkOutcome};
use crate::collaborators::{ChannelHandle, Collaborators, GroupId, MeetingRecord, RoundId, RoundStatus};
use crate::config::SitOutPolicy;
use crate::errors::{CollaboratorError, EngineError, StartRejection, StopRejection};
use crate::round::{RoundPlan, RoundReport, RoundRunner};

/// A pool member as seen by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub participant: Participant,
    pub is_bot: bool,
    /// Currently connected to the group's shared voice space.
    pub in_voice: bool,
}

impl PoolMember {
    pub fn present(participant: Participant) -> Self {
        Self {
            participant,
            is_bot: false,
            in_voice: true,
        }
    }

    pub fn is_eligible(&self) -> bool {
        !self.is_bot && self.in_voice
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub group_id: GroupId,
    /// Whoever asked for the round; sits out first when the pool is odd.
    pub requester: Option<ParticipantId>,
    pub pool: Vec<PoolMember>,
    pub lobby: ChannelHandle,
    pub duration_minutes: u32,
}

/// Acknowledgement returned once a round has been launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundStarted {
    pub round_id: RoundId,
    pub round_number: u32,
    pub pairs: Vec<(Participant, Participant)>,
    pub sitters: Vec<Participant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopAck {
    /// `None` when the round was still being set up.
    pub round_id: Option<RoundId>,
    /// A stop had already been requested for this round.
    pub already_requested: bool,
}

struct ActiveSlot {
    generation: u64,
    round_id: Option<RoundId>,
    cancel: CancellationToken,
    stop_requested: bool,
}

type SlotMap = Arc<Mutex<HashMap<GroupId, ActiveSlot>>>;

fn lock_slots(slots: &SlotMap) -> std::sync::MutexGuard<'_, HashMap<GroupId, ActiveSlot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the group's slot on drop, if the slot is still ours.
struct SlotReservation {
    slots: SlotMap,
    group_id: GroupId,
    generation: u64,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if slots
            .get(&self.group_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.group_id);
        }
    }
}

/// Outcome of a successful slot reservation.
struct Admission {
    reservation: SlotReservation,
    cancel: CancellationToken,
    eligible: Vec<Participant>,
    sitter: Option<ParticipantId>,
}

/// Shared reference to Supervisor
pub type SharedSupervisor = Arc<Supervisor>;

pub struct Supervisor {
    collab: Collaborators,
    engine: PairingEngine,
    slots: SlotMap,
    handles: Mutex<HashMap<GroupId, JoinHandle<RoundReport>>>,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(collab: Collaborators) -> Self {
        Self {
            collab,
            engine: PairingEngine::new(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    pub fn shared(self) -> SharedSupervisor {
        Arc::new(self)
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Validate, pair, persist and launch a round. Returns as soon as the
    /// round task is spawned.
    pub async fn start_round(&self, request: StartRequest) -> Result<RoundStarted, StartRejection> {
        let group_id = request.group_id;
        let Admission {
            reservation,
            cancel,
            eligible,
            sitter,
        } = self.reserve(&request)?;

        let pool_ids: Vec<ParticipantId> = eligible
            .iter()
            .map(|p| p.id)
            .filter(|id| Some(*id) != sitter)
            .collect();

        let history = self
            .collab
            .store
            .last_meeting_times(&pool_ids)
            .await
            .map_err(|e| StartRejection::Unavailable(e.to_string()))?;
        let weighting = history.into_weighting(self.collab.config.weighting, Utc::now());
        debug!(%group_id, weighting = weighting.name(), "Weighting selected");
        let result = self.engine.create_pairs(&pool_ids, weighting.as_ref());
        if !result.has_pairs() {
            return Err(StartRejection::NoPairingFound);
        }

        let labels: HashMap<ParticipantId, &Participant> =
            eligible.iter().map(|p| (p.id, p)).collect();
        let label_of = |id: ParticipantId| -> Participant {
            labels
                .get(&id)
                .map(|p| (*p).clone())
                .unwrap_or_else(|| Participant::new(id, id.to_string()))
        };

        let sitters: Vec<ParticipantId> = sitter
            .into_iter()
            .chain(result.unmatched.iter().copied())
            .collect();
        let paired: Vec<Participant> = result.paired_participants().map(&label_of).collect();

        let (round_id, round_number) = self
            .persist(group_id, request.duration_minutes, &paired, &result.pairs)
            .await?;

        log_pairing(round_id, &result.pairs, &sitters, &label_of);

        {
            let mut slots = lock_slots(&self.slots);
            if let Some(slot) = slots.get_mut(&group_id) {
                if slot.generation == reservation.generation {
                    slot.round_id = Some(round_id);
                }
            }
        }

        let plan = RoundPlan {
            group_id,
            round_id,
            round_number,
            pairs: result.pairs.clone(),
            sitters: sitters.clone(),
            lobby: request.lobby.clone(),
            duration: Duration::from_secs(u64::from(request.duration_minutes) * 60),
        };
        let runner = RoundRunner::new(plan, self.collab.clone(), cancel);
        let handle = tokio::spawn(async move {
            let _reservation = reservation;
            runner.run().await
        });
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id, handle);

        Ok(RoundStarted {
            round_id,
            round_number,
            pairs: result
                .pairs
                .iter()
                .map(|p| (label_of(p.first()), label_of(p.second())))
                .collect(),
            sitters: sitters.into_iter().map(&label_of).collect(),
        })
    }

    /// Synchronous admission: everything decided under the slot lock.
    fn reserve(&self, request: &StartRequest) -> Result<Admission, StartRejection> {
        let config = &self.collab.config;
        let mut slots = lock_slots(&self.slots);

        if let Some(slot) = slots.get(&request.group_id) {
            return Err(StartRejection::AlreadyRunning {
                round_id: slot.round_id,
            });
        }
        if !config.accepts_duration(request.duration_minutes) {
            return Err(StartRejection::InvalidDuration {
                minutes: request.duration_minutes,
                min: config.min_duration_minutes,
                max: config.max_duration_minutes,
            });
        }

        let eligible = eligible_members(&request.pool);
        if eligible.len() < 2 {
            return Err(StartRejection::InsufficientParticipants {
                eligible: eligible.len(),
            });
        }
        let sitter = choose_sitter(&eligible, request.requester, config.sit_out_policy);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        slots.insert(
            request.group_id,
            ActiveSlot {
                generation,
                round_id: None,
                cancel: cancel.clone(),
                stop_requested: false,
            },
        );
        drop(slots);

        let reservation = SlotReservation {
            slots: Arc::clone(&self.slots),
            group_id: request.group_id,
            generation,
        };
        Ok(Admission {
            reservation,
            cancel,
            eligible,
            sitter,
        })
    }

    async fn persist(
        &self,
        group_id: GroupId,
        duration_minutes: u32,
        paired: &[Participant],
        pairs: &[Pair],
    ) -> Result<(RoundId, u32), StartRejection> {
        let store = &self.collab.store;
        let unavailable = |e: CollaboratorError| StartRejection::Unavailable(e.to_string());

        store.record_participants(paired).await.map_err(unavailable)?;
        let round_number = store.next_round_number(group_id).await.map_err(unavailable)?;
        let round_id = store
            .record_round(group_id, round_number, duration_minutes)
            .await
            .map_err(unavailable)?;

        if let Err(e) = store.record_pairs(round_id, pairs).await {
            warn!(%round_id, error = %e, "Failed to record pairs; abandoning round");
            if let Err(e) = store.finalize_round_status(round_id, RoundStatus::Error).await {
                warn!(%round_id, error = %e, "Failed to mark abandoned round as error");
            }
            return Err(unavailable(e));
        }
        Ok((round_id, round_number))
    }

    /// Request cancellation of the group's round. Idempotent; does not wait
    /// for teardown.
    pub fn stop_round(&self, group_id: GroupId) -> Result<StopAck, StopRejection> {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.get_mut(&group_id).ok_or(StopRejection::NotRunning)?;

        let already_requested = slot.stop_requested;
        slot.stop_requested = true;
        slot.cancel.cancel();
        if !already_requested {
            info!(%group_id, round_id = ?slot.round_id, "Round stop requested");
        }
        Ok(StopAck {
            round_id: slot.round_id,
            already_requested,
        })
    }

    pub fn is_running(&self, group_id: GroupId) -> bool {
        lock_slots(&self.slots).contains_key(&group_id)
    }

    /// Round id of the group's running round, once persisted.
    pub fn active_round(&self, group_id: GroupId) -> Option<RoundId> {
        lock_slots(&self.slots)
            .get(&group_id)
            .and_then(|slot| slot.round_id)
    }

    /// Wait for the group's most recently launched round to finish.
    pub async fn join(&self, group_id: GroupId) -> Option<RoundReport> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id)?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(%group_id, error = %e, "Round task did not complete");
                None
            }
        }
    }

    /// Move everyone in `source` to `target`.
    pub async fn relocate_channel(
        &self,
        source: &ChannelHandle,
        target: &ChannelHandle,
    ) -> Result<BulkOutcome, EngineError> {
        let outcome = relocate_channel_members(&self.collab.provisioner, source, target).await?;
        info!(
            source = %source,
            target = %target,
            summary = ?outcome.summary(),
            "Channel relocation finished"
        );
        Ok(outcome)
    }

    /// Most recent meetings of `participant`, newest first.
    pub async fn user_history(
        &self,
        participant: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<MeetingRecord>, EngineError> {
        let limit = limit.unwrap_or(self.collab.config.history_limit);
        self.collab
            .store
            .user_history(participant, limit)
            .await
            .map_err(EngineError::Persistence)
    }
}

/// Non-bot, voice-present members, first occurrence of each id.
fn eligible_members(pool: &[PoolMember]) -> Vec<Participant> {
    let mut seen = std::collections::HashSet::new();
    pool.iter()
        .filter(|m| m.is_eligible())
        .filter(|m| seen.insert(m.participant.id))
        .map(|m| m.participant.clone())
        .collect()
}

/// Pick who sits out of an odd pool. `None` for even pools.
fn choose_sitter(
    eligible: &[Participant],
    requester: Option<ParticipantId>,
    policy: SitOutPolicy,
) -> Option<ParticipantId> {
    if eligible.len() % 2 == 0 {
        return None;
    }
    let last = eligible.last().map(|p| p.id);
    match policy {
        SitOutPolicy::RequesterFirst => requester
            .filter(|r| eligible.iter().any(|p| p.id == *r))
            .or(last),
        SitOutPolicy::LastInPool => last,
    }
}

fn log_pairing(
    round_id: RoundId,
    pairs: &[Pair],
    sitters: &[ParticipantId],
    label_of: &impl Fn(ParticipantId) -> Participant,
) {
    for (i, pair) in pairs.iter().enumerate() {
        info!(
            %round_id,
            channel = i + 1,
            first = %label_of(pair.first()),
            second = %label_of(pair.second()),
            "Paired"
        );
    }
    for sitter in sitters {
        info!(%round_id, sitter = %label_of(*sitter), "Sitting out");
    }
}
