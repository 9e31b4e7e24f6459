use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::{
    domain::{JobId, Stage},
    protocol::{JobDraft, JobPatch},
};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::broadcast,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, RequestGateway, RequestSpec};

const JOBS_PATH: &str = "/jobs/";

fn job_path(id: JobId) -> String {
    format!("/jobs/{id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityDecodeError {
    #[error("pipeline record is not a JSON object")]
    NotAnObject,
    #[error("pipeline record has no integer id")]
    MissingId,
    #[error("pipeline record {id} has unknown status '{status}'")]
    UnknownStage { id: JobId, status: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no pipeline entity with id {0}")]
    UnknownEntity(JobId),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("malformed pipeline entity: {0}")]
    InvalidEntity(#[from] EntityDecodeError),
    #[error("stage transitions need a running Tokio runtime")]
    NoRuntime,
}

/// Stage and attributes as the server last confirmed them.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSnapshot {
    pub stage: Stage,
    pub attributes: Map<String, Value>,
}

/// A tracked application as held in the local collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEntity {
    pub id: JobId,
    pub stage: Stage,
    pub attributes: Map<String, Value>,
    pub last_confirmed: ServerSnapshot,
}

impl PipelineEntity {
    /// Decodes a server record. `id` and `status` are lifted out; every other
    /// field stays in the attribute bag untouched.
    pub fn from_record(record: Value) -> Result<Self, EntityDecodeError> {
        let (id, snapshot) = decode_record(record)?;
        Ok(Self {
            id,
            stage: snapshot.stage,
            attributes: snapshot.attributes.clone(),
            last_confirmed: snapshot,
        })
    }

    pub fn title(&self) -> Option<&str> {
        self.text("title")
    }

    pub fn company(&self) -> Option<&str> {
        self.text("company")
    }

    pub fn location(&self) -> Option<&str> {
        self.text("location")
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.text("created_at")?;
        DateTime::parse_from_rfc3339(raw)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

fn decode_record(record: Value) -> Result<(JobId, ServerSnapshot), EntityDecodeError> {
    let Value::Object(mut attributes) = record else {
        return Err(EntityDecodeError::NotAnObject);
    };
    let id = attributes
        .remove("id")
        .and_then(|id| id.as_i64())
        .map(JobId)
        .ok_or(EntityDecodeError::MissingId)?;
    let stage = match attributes.remove("status") {
        None | Some(Value::Null) => Stage::default(),
        Some(Value::String(status)) => status
            .parse()
            .map_err(|_| EntityDecodeError::UnknownStage { id, status })?,
        Some(other) => {
            return Err(EntityDecodeError::UnknownStage {
                id,
                status: other.to_string(),
            })
        }
    };
    Ok((id, ServerSnapshot { stage, attributes }))
}

/// A stage change applied locally and not yet resolved by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransition {
    pub entity_id: JobId,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub sequence: u64,
    baseline: u64,
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The server accepted the change and it is still the latest one.
    Confirmed,
    /// The server refused the change; the stage was restored.
    RolledBack { restored: Stage, error: GatewayError },
    /// A newer transition or a reload took over; the result was ignored.
    Superseded,
}

/// Handle on the background round trip of one transition.
pub struct TransitionTicket {
    pub entity_id: JobId,
    pub sequence: u64,
    handle: JoinHandle<TransitionOutcome>,
}

impl TransitionTicket {
    pub async fn wait(self) -> Result<TransitionOutcome, JoinError> {
        self.handle.await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Loaded {
        count: usize,
        discarded_pending: usize,
    },
    StageChanged {
        id: JobId,
        stage: Stage,
    },
    TransitionConfirmed {
        id: JobId,
        stage: Stage,
    },
    TransitionFailed {
        id: JobId,
        attempted: Stage,
        restored: Stage,
        detail: String,
    },
    Created {
        id: JobId,
    },
    Updated {
        id: JobId,
    },
    Deleted {
        id: JobId,
    },
}

#[derive(Default)]
struct PipelineState {
    entities: Vec<PipelineEntity>,
    pending: HashMap<JobId, PendingTransition>,
    confirmed_sequence: HashMap<JobId, u64>,
    /// Newest sequence handed out per entity since the last reload.
    issued_sequence: HashMap<JobId, u64>,
    next_sequence: u64,
    baseline: u64,
}

impl PipelineState {
    fn allocate_sequence(&mut self, id: JobId) -> u64 {
        self.next_sequence += 1;
        self.issued_sequence.insert(id, self.next_sequence);
        self.next_sequence
    }

    fn is_newest(&self, id: JobId, sequence: u64) -> bool {
        self.issued_sequence
            .get(&id)
            .map_or(true, |issued| *issued <= sequence)
    }

    fn entity_mut(&mut self, id: JobId) -> Option<&mut PipelineEntity> {
        self.entities.iter_mut().find(|entity| entity.id == id)
    }

    fn is_current(&self, pending: &PendingTransition) -> bool {
        self.pending
            .get(&pending.entity_id)
            .is_some_and(|p| p.sequence == pending.sequence)
    }

    /// Records a server confirmation issued at `sequence` against `baseline`.
    ///
    /// Ignored when a reload happened since, or when a later confirmation for
    /// the same entity already landed. The displayed stage only follows the
    /// server when `sequence` is the newest one issued for the entity; an
    /// older confirmation only moves `last_confirmed`.
    fn confirm(&mut self, id: JobId, sequence: u64, baseline: u64, snapshot: ServerSnapshot) -> bool {
        if baseline != self.baseline {
            return false;
        }
        if self
            .confirmed_sequence
            .get(&id)
            .is_some_and(|confirmed| *confirmed >= sequence)
        {
            return false;
        }
        let newest = self.is_newest(id, sequence);

        let Some(entity) = self.entities.iter_mut().find(|entity| entity.id == id) else {
            return false;
        };
        entity.attributes = snapshot.attributes.clone();
        if newest {
            entity.stage = snapshot.stage;
        }
        entity.last_confirmed = snapshot;

        self.confirmed_sequence.insert(id, sequence);
        if newest {
            self.pending.remove(&id);
        }
        true
    }

    fn upsert(&mut self, entity: PipelineEntity) {
        match self.entity_mut(entity.id) {
            Some(existing) => *existing = entity,
            None => self.entities.push(entity),
        }
    }
}

/// Local cache of pipeline entities with optimistic stage transitions.
///
/// Every mutation of the cache happens inside one critical section that never
/// spans an await, so readers only ever see whole transitions.
pub struct PipelineController {
    gateway: Arc<RequestGateway>,
    state: Mutex<PipelineState>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineController {
    pub fn new(gateway: Arc<RequestGateway>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            gateway,
            state: Mutex::new(PipelineState::default()),
            events,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PipelineEntity> {
        self.lock_state().entities.clone()
    }

    pub fn entity(&self, id: JobId) -> Option<PipelineEntity> {
        self.lock_state()
            .entities
            .iter()
            .find(|entity| entity.id == id)
            .cloned()
    }

    pub fn by_stage(&self, stage: Stage) -> Vec<PipelineEntity> {
        self.lock_state()
            .entities
            .iter()
            .filter(|entity| entity.stage == stage)
            .cloned()
            .collect()
    }

    /// Entity count for every stage, including empty ones.
    pub fn stage_counts(&self) -> BTreeMap<Stage, usize> {
        let mut counts: BTreeMap<Stage, usize> =
            Stage::ALL.into_iter().map(|stage| (stage, 0)).collect();
        for entity in &self.lock_state().entities {
            *counts.entry(entity.stage).or_default() += 1;
        }
        counts
    }

    pub fn pending(&self, id: JobId) -> Option<PendingTransition> {
        self.lock_state().pending.get(&id).copied()
    }

    pub fn is_pending(&self, id: JobId) -> bool {
        self.lock_state().pending.contains_key(&id)
    }

    /// Replaces the collection with the server's. Outstanding transitions
    /// are forgotten; their results will be ignored when they arrive.
    pub async fn load_all(&self) -> Result<usize, PipelineError> {
        let records: Vec<Value> = self.gateway.send_json(RequestSpec::get(JOBS_PATH)).await?;

        let mut entities: Vec<PipelineEntity> = Vec::with_capacity(records.len());
        let mut positions: HashMap<JobId, usize> = HashMap::new();
        for record in records {
            match PipelineEntity::from_record(record) {
                Ok(entity) => match positions.get(&entity.id) {
                    Some(&index) => {
                        warn!(id = %entity.id, "duplicate pipeline entity in listing; keeping the later record");
                        entities[index] = entity;
                    }
                    None => {
                        positions.insert(entity.id, entities.len());
                        entities.push(entity);
                    }
                },
                Err(error) => warn!(%error, "skipping malformed pipeline entity"),
            }
        }

        let count = entities.len();
        let discarded_pending = {
            let mut state = self.lock_state();
            state.baseline += 1;
            let discarded = state.pending.len();
            state.pending.clear();
            state.confirmed_sequence.clear();
            state.issued_sequence.clear();
            state.entities = entities;
            discarded
        };

        info!(count, discarded_pending, "pipeline loaded");
        self.emit(PipelineEvent::Loaded {
            count,
            discarded_pending,
        });
        Ok(count)
    }

    /// Moves an entity to `to_stage` locally, then asks the server to do the
    /// same in the background.
    ///
    /// The local write is visible as soon as this returns. Returns `Ok(None)`
    /// when the entity already shows `to_stage`, and `NoRuntime` without
    /// touching anything when called outside a Tokio runtime.
    pub fn transition(
        self: &Arc<Self>,
        id: JobId,
        to_stage: Stage,
    ) -> Result<Option<TransitionTicket>, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let pending = {
            let mut state = self.lock_state();
            let from_stage = state
                .entities
                .iter()
                .find(|entity| entity.id == id)
                .map(|entity| entity.stage)
                .ok_or(PipelineError::UnknownEntity(id))?;
            if from_stage == to_stage {
                return Ok(None);
            }

            let sequence = state.allocate_sequence(id);
            let pending = PendingTransition {
                entity_id: id,
                from_stage,
                to_stage,
                sequence,
                baseline: state.baseline,
            };
            if let Some(entity) = state.entity_mut(id) {
                entity.stage = to_stage;
            }
            if let Some(previous) = state.pending.insert(id, pending) {
                debug!(%id, superseded = previous.sequence, sequence, "transition supersedes an in-flight one");
            }
            pending
        };

        debug!(%id, from = %pending.from_stage, to = %to_stage, sequence = pending.sequence, "stage applied locally");
        self.emit(PipelineEvent::StageChanged {
            id,
            stage: to_stage,
        });

        let controller = Arc::clone(self);
        let handle = runtime.spawn(async move { controller.push_transition(pending).await });
        Ok(Some(TransitionTicket {
            entity_id: id,
            sequence: pending.sequence,
            handle,
        }))
    }

    async fn push_transition(&self, pending: PendingTransition) -> TransitionOutcome {
        let result = match RequestSpec::put(job_path(pending.entity_id))
            .with_json(&JobPatch::stage(pending.to_stage))
        {
            Ok(spec) => self.gateway.send_json::<Value>(spec).await,
            Err(err) => Err(err),
        };
        self.reconcile(pending, result)
    }

    fn reconcile(
        &self,
        pending: PendingTransition,
        result: Result<Value, GatewayError>,
    ) -> TransitionOutcome {
        let id = pending.entity_id;
        match result {
            Ok(record) => {
                let (outcome, stage) = {
                    let mut state = self.lock_state();
                    let current = state.is_current(&pending);
                    let snapshot = match decode_record(record) {
                        Ok((_, snapshot)) => Some(snapshot),
                        Err(error) => {
                            debug!(%id, %error, "update response carried no usable record");
                            state
                                .entities
                                .iter()
                                .find(|entity| entity.id == id)
                                .map(|entity| ServerSnapshot {
                                    stage: pending.to_stage,
                                    attributes: entity.attributes.clone(),
                                })
                        }
                    };
                    if let Some(snapshot) = snapshot {
                        state.confirm(id, pending.sequence, pending.baseline, snapshot);
                    }
                    if current {
                        state.pending.remove(&id);
                    }
                    let stage = state
                        .entities
                        .iter()
                        .find(|entity| entity.id == id)
                        .map(|entity| entity.stage);
                    (current, stage)
                };

                match (outcome, stage) {
                    (true, Some(stage)) => {
                        debug!(%id, %stage, sequence = pending.sequence, "transition confirmed");
                        self.emit(PipelineEvent::TransitionConfirmed { id, stage });
                        TransitionOutcome::Confirmed
                    }
                    _ => {
                        debug!(%id, sequence = pending.sequence, "ignoring confirmation of a superseded transition");
                        TransitionOutcome::Superseded
                    }
                }
            }
            Err(error) => {
                let restored = {
                    let mut state = self.lock_state();
                    if !state.is_current(&pending) {
                        None
                    } else {
                        state.pending.remove(&id);
                        state.entity_mut(id).map(|entity| {
                            entity.stage = entity.last_confirmed.stage;
                            entity.stage
                        })
                    }
                };

                match restored {
                    Some(restored) => {
                        warn!(%id, attempted = %pending.to_stage, %restored, %error, "transition failed; stage rolled back");
                        self.emit(PipelineEvent::TransitionFailed {
                            id,
                            attempted: pending.to_stage,
                            restored,
                            detail: error.detail().map(str::to_string).unwrap_or_else(|| error.to_string()),
                        });
                        TransitionOutcome::RolledBack { restored, error }
                    }
                    None => {
                        debug!(%id, sequence = pending.sequence, %error, "ignoring failure of a superseded transition");
                        TransitionOutcome::Superseded
                    }
                }
            }
        }
    }

    /// Creates an entity once the server has accepted it, then reloads.
    pub async fn create(&self, draft: JobDraft) -> Result<PipelineEntity, PipelineError> {
        let spec = RequestSpec::post(JOBS_PATH).with_json(&draft)?;
        let record: Value = self.gateway.send_json(spec).await?;
        let created = PipelineEntity::from_record(record)?;
        let id = created.id;

        if let Err(error) = self.load_all().await {
            warn!(%id, %error, "reload after create failed; keeping the server record");
            let mut state = self.lock_state();
            let sequence = state.allocate_sequence(id);
            state.confirmed_sequence.insert(id, sequence);
            state.upsert(created.clone());
        }

        info!(%id, "pipeline entity created");
        self.emit(PipelineEvent::Created { id });
        Ok(self.entity(id).unwrap_or(created))
    }

    /// Sends a non-optimistic partial update and adopts the server's record.
    pub async fn update_details(
        &self,
        id: JobId,
        patch: JobPatch,
    ) -> Result<PipelineEntity, PipelineError> {
        let (sequence, baseline) = {
            let mut state = self.lock_state();
            if !state.entities.iter().any(|entity| entity.id == id) {
                return Err(PipelineError::UnknownEntity(id));
            }
            (state.allocate_sequence(id), state.baseline)
        };

        let spec = RequestSpec::put(job_path(id)).with_json(&patch)?;
        let record: Value = self.gateway.send_json(spec).await?;
        let (record_id, snapshot) = decode_record(record)?;
        if record_id != id {
            warn!(%id, %record_id, "update response names a different entity");
        }

        let updated = {
            let mut state = self.lock_state();
            state.confirm(id, sequence, baseline, snapshot.clone());
            state
                .entities
                .iter()
                .find(|entity| entity.id == id)
                .cloned()
        };

        self.emit(PipelineEvent::Updated { id });
        Ok(updated.unwrap_or(PipelineEntity {
            id,
            stage: snapshot.stage,
            attributes: snapshot.attributes.clone(),
            last_confirmed: snapshot,
        }))
    }

    /// Deletes an entity once the server confirms, then reloads.
    pub async fn delete(&self, id: JobId) -> Result<(), PipelineError> {
        self.gateway.send(RequestSpec::delete(job_path(id))).await?;

        if let Err(error) = self.load_all().await {
            warn!(%id, %error, "reload after delete failed; dropping the entity locally");
            let mut state = self.lock_state();
            state.entities.retain(|entity| entity.id != id);
            state.pending.remove(&id);
            state.confirmed_sequence.remove(&id);
            state.issued_sequence.remove(&id);
        }

        info!(%id, "pipeline entity deleted");
        self.emit(PipelineEvent::Deleted { id });
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
