//! Fixed-rate tick scheduler.
//!
//! One tick walks `Idle → Ingest → Apply → Reconcile → Diff → Flush → Idle`
//! on the calling thread. Chunk IO and event delivery run on the worker pool
//! and never hold up the next tick. A slow tick is reported and the next one
//! starts right away; phases are never skipped.
//!
//! Commands that need a chunk still loading are held and go to the front of
//! the next tick's queue. Any later command from the same session, or one that
//! targets the same entity, chunk or observer, is held behind them, which
//! keeps per-source order intact.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};

use crate::config::config_manager::{ConfigurationError, SimulationConfig};
use crate::config::global_config;
use crate::core::commands::{Command, CommandIntake, CommandQueue, CommandSource, PendingCommand, command_channel};
use crate::core::entity::EntityIdAllocator;
use crate::core::error::WorldError;
use crate::core::types::{ChunkCoord, EntityId, ObserverId, Tick};
use crate::core::visibility::Anchor;
use crate::core::world_manager::{ApplyOutcome, World, WorldSettings};
use crate::networking::dispatcher::Dispatcher;
use crate::networking::event_sink::EventSink;
use crate::terrain::chunk_manager::ChunkStore;
use crate::terrain::chunk_storage::ChunkPersistence;
use crate::terrain::generation::WorldGenerator;
use crate::threading::ThreadPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Ingest,
    Apply,
    Reconcile,
    Diff,
    Flush,
}

/// A command dropped during Apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub source: CommandSource,
    pub command: &'static str,
    pub error: WorldError,
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: Tick,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// How far past its budget the tick ran, if it did.
    pub overrun: Option<Duration>,
    pub ingested: usize,
    pub applied: usize,
    pub held: usize,
    pub rejected: Vec<Rejection>,
    pub moved: usize,
    pub chunks_requested: usize,
    pub chunks_retried: usize,
    pub chunks_unloaded: usize,
    pub chunks_evicted: usize,
    pub batches: usize,
}

impl TickReport {
    fn new(tick: Tick) -> Self {
        TickReport {
            tick,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            overrun: None,
            ingested: 0,
            applied: 0,
            held: 0,
            rejected: Vec::new(),
            moved: 0,
            chunks_requested: 0,
            chunks_retried: 0,
            chunks_unloaded: 0,
            chunks_evicted: 0,
            batches: 0,
        }
    }
}

/// What a command must not overtake while an earlier one is held.
///
/// Session commands carry their session as an observer key, so one session's
/// commands stay in submission order. System commands are ordered only per
/// entity, chunk and observer they touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OrderingKeys {
    entity: Option<EntityId>,
    chunk: Option<ChunkCoord>,
    observers: [Option<ObserverId>; 2],
}

impl OrderingKeys {
    fn of(pending: &PendingCommand) -> Self {
        let session = match pending.source {
            CommandSource::Session(observer) => Some(observer),
            CommandSource::System => None,
        };
        let (entity, chunk, observer) = match &pending.command {
            Command::SetBlock { position, .. } => (None, Some(position.chunk()), None),
            Command::Spawn { entity, owner, .. } => (Some(*entity), None, *owner),
            Command::Attach { observer, anchor, .. } => {
                let entity = match anchor {
                    Anchor::Entity(entity) => Some(*entity),
                    Anchor::Fixed(_) => None,
                };
                (entity, None, Some(*observer))
            }
            Command::Detach { observer } | Command::SetViewDistance { observer, .. } => {
                (None, None, Some(*observer))
            }
            other => (other.target_entity(), None, None),
        };
        OrderingKeys { entity, chunk, observers: [session, observer] }
    }
}

#[derive(Debug, Default)]
struct Barriers {
    entities: HashSet<EntityId>,
    chunks: HashSet<ChunkCoord>,
    observers: HashSet<ObserverId>,
}

impl Barriers {
    fn blocks(&self, keys: &OrderingKeys) -> bool {
        keys.entity.is_some_and(|e| self.entities.contains(&e))
            || keys.chunk.is_some_and(|c| self.chunks.contains(&c))
            || keys.observers.iter().flatten().any(|o| self.observers.contains(o))
    }

    fn raise(&mut self, keys: &OrderingKeys) {
        self.entities.extend(keys.entity);
        self.chunks.extend(keys.chunk);
        self.observers.extend(keys.observers.iter().flatten());
    }
}

pub struct TickScheduler {
    world: World,
    intake: CommandIntake,
    queue: CommandQueue,
    held: VecDeque<PendingCommand>,
    dispatcher: Dispatcher,
    pool: Arc<ThreadPool>,
    tick: Tick,
    phase: TickPhase,
    interval: Duration,
    budget: Duration,
}

impl TickScheduler {
    /// Builds a scheduler with a worker pool sized from `[chunks] io_threads`
    /// and a separate delivery pool sized from `[dispatch] threads`.
    pub fn new(
        config: &SimulationConfig,
        generator: Arc<dyn WorldGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let pool = Arc::new(ThreadPool::new(config.chunks.io_threads)?);
        Self::with_pool(config, generator, persistence, sink, pool)
    }

    /// Builds a scheduler from the process-wide configuration.
    pub fn from_global_config(
        generator: Arc<dyn WorldGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigurationError> {
        Self::new(&global_config::get_config(), generator, persistence, sink)
    }

    /// Like [`TickScheduler::new`] but shares an existing pool for chunk IO and diffing.
    ///
    /// Delivery still gets its own pool so a stalled sink cannot starve the
    /// tick. An inline pool keeps delivery inline too.
    pub fn with_pool(
        config: &SimulationConfig,
        generator: Arc<dyn WorldGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
        sink: Arc<dyn EventSink>,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, ConfigurationError> {
        let delivery = if pool.is_inline() {
            ThreadPool::inline()
        } else {
            ThreadPool::new(config.dispatch.threads)?
        };
        Self::with_pools(config, generator, persistence, sink, pool, Arc::new(delivery))
    }

    pub fn with_pools(
        config: &SimulationConfig,
        generator: Arc<dyn WorldGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
        sink: Arc<dyn EventSink>,
        pool: Arc<ThreadPool>,
        delivery: Arc<ThreadPool>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let chunks = Arc::new(ChunkStore::new(
            generator,
            persistence,
            Arc::clone(&pool),
            config.chunks.store_settings(),
        ));
        let ids = Arc::new(EntityIdAllocator::new(config.entities.id_capacity));
        let settings = WorldSettings {
            ticks_per_second: config.tick.ticks_per_second,
            entity_load_radius: config.view.entity_load_radius,
            max_move_distance: config.entities.max_move_distance,
            diffing_enabled: config.tick.diffing_enabled,
        };
        let (intake, queue) = command_channel(Arc::clone(&ids));

        info!(
            "TickScheduler: {} ticks/s, budget {:?}, {} worker threads{}, {} delivery threads",
            config.tick.ticks_per_second,
            config.tick.budget(),
            pool.num_threads(),
            if pool.is_inline() { " (inline)" } else { "" },
            delivery.num_threads()
        );
        Ok(TickScheduler {
            world: World::new(chunks, ids, settings),
            intake,
            queue,
            held: VecDeque::new(),
            dispatcher: Dispatcher::new(sink, delivery),
            pool,
            tick: 0,
            phase: TickPhase::Idle,
            interval: config.tick.interval(),
            budget: config.tick.budget(),
        })
    }

    /// A handle sessions use to submit commands from any thread.
    pub fn intake(&self) -> CommandIntake {
        self.intake.clone()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    /// Commands waiting on a chunk load.
    pub fn held_commands(&self) -> usize {
        self.held.len()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn set_diffing_enabled(&mut self, enabled: bool) {
        self.world.set_diffing_enabled(enabled);
    }

    fn enter(&mut self, phase: TickPhase) {
        trace!("Tick {}: {:?} -> {:?}", self.tick, self.phase, phase);
        self.phase = phase;
    }

    /// Runs one full tick.
    pub fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let tick = self.tick;
        let mut report = TickReport::new(tick);

        self.enter(TickPhase::Ingest);
        self.world.chunks().advance_to(tick);
        let mut batch = std::mem::take(&mut self.held);
        let fresh = self.queue.drain();
        report.ingested = fresh.len();
        batch.extend(fresh);

        self.enter(TickPhase::Apply);
        let held_targets = self.apply_all(batch, tick, &mut report);
        let dt = 1.0 / self.world.settings().ticks_per_second.max(1) as f64;
        let motion = self.world.integrate(dt);
        report.moved = motion.moved;

        self.enter(TickPhase::Reconcile);
        self.world.refresh_observers();
        let mut interest = held_targets;
        interest.extend(motion.held_at);
        let references = self.world.chunk_references(&interest);
        let summary = self.world.chunks().reconcile(&references, tick);
        report.chunks_requested = summary.requested;
        report.chunks_retried = summary.retried;
        report.chunks_unloaded = summary.unloaded;
        report.chunks_evicted = summary.evicted;

        self.enter(TickPhase::Diff);
        let batches = self.world.diff(tick, &self.pool);

        self.enter(TickPhase::Flush);
        for observer in self.world.take_detached() {
            self.dispatcher.close(observer);
        }
        report.batches = self.dispatcher.dispatch(batches);
        self.world.end_tick();

        report.duration = started.elapsed();
        if report.duration > self.budget {
            report.overrun = Some(report.duration - self.budget);
            warn!(
                "{}",
                WorldError::Overrun { tick, elapsed: report.duration, budget: self.budget }
            );
        }
        self.enter(TickPhase::Idle);
        debug!(
            "Tick {} done in {:?}: {} applied, {} held, {} rejected, {} batches",
            tick,
            report.duration,
            report.applied,
            report.held,
            report.rejected.len(),
            report.batches
        );
        report
    }

    fn apply_all(&mut self, batch: VecDeque<PendingCommand>, tick: Tick, report: &mut TickReport) -> Vec<ChunkCoord> {
        let mut barriers = Barriers::default();
        let mut held_targets = Vec::new();

        for pending in batch {
            let keys = OrderingKeys::of(&pending);
            if barriers.blocks(&keys) {
                // Anything ordered after this command has to wait as well
                barriers.raise(&keys);
                self.held.push_back(pending);
                report.held += 1;
                continue;
            }

            let source = pending.source;
            let name = pending.command.name();
            match self.world.apply(pending, tick) {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Held(pending, coord)) => {
                    barriers.raise(&keys);
                    held_targets.push(coord);
                    self.held.push_back(pending);
                    report.held += 1;
                }
                Err(error) => {
                    warn!("Tick {}: rejected {} from {:?}: {}", tick, name, source, error);
                    report.rejected.push(Rejection { source, command: name, error });
                }
            }
        }
        held_targets
    }

    /// Ticks at the configured rate until `running` is cleared, then saves every loaded chunk.
    ///
    /// After an overrun the next tick starts immediately instead of trying to catch up.
    pub fn run(&mut self, running: &AtomicBool) {
        info!("TickScheduler: entering run loop at tick {}", self.tick);
        let mut next_deadline = Instant::now();
        while running.load(Ordering::Acquire) {
            self.tick();
            next_deadline += self.interval;
            let now = Instant::now();
            if next_deadline > now {
                thread::sleep(next_deadline - now);
            } else {
                next_deadline = now;
            }
        }
        self.shutdown();
    }

    /// Saves every loaded chunk. Returns how many were written.
    pub fn shutdown(&mut self) -> usize {
        info!("TickScheduler: shutting down after tick {}", self.tick);
        self.world.chunks().flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::core::visibility::ViewDistance;
    use crate::networking::event_sink::{ChannelSink, WorldEvent};
    use crate::terrain::chunk_storage::MemoryChunkStorage;
    use crate::terrain::generation::FlatGenerator;

    fn scheduler() -> (TickScheduler, crossbeam::channel::Receiver<crate::networking::event_sink::EventBatch>) {
        let (sink, receiver) = ChannelSink::new();
        let scheduler = TickScheduler::with_pool(
            &SimulationConfig::default(),
            Arc::new(FlatGenerator::default()),
            Arc::new(MemoryChunkStorage::new()),
            Arc::new(sink),
            Arc::new(ThreadPool::inline()),
        )
        .unwrap();
        (scheduler, receiver)
    }

    #[test]
    fn commands_apply_on_the_next_tick() {
        let (mut scheduler, _rx) = scheduler();
        let intake = scheduler.intake();
        let id = intake.spawn(CommandSource::System, Vec3::ZERO, Vec3::ZERO).unwrap();
        assert!(scheduler.world().registry().get(id).is_none());

        let report = scheduler.tick();
        assert_eq!(report.tick, 1);
        assert_eq!(report.ingested, 1);
        assert_eq!(report.applied, 1);
        assert!(scheduler.world().registry().get(id).is_some());
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }

    #[test]
    fn invalid_commands_do_not_affect_others() {
        let (mut scheduler, _rx) = scheduler();
        let intake = scheduler.intake();
        intake
            .submit(CommandSource::System, Command::Despawn { entity: EntityId(77) })
            .unwrap();
        let id = intake.spawn(CommandSource::System, Vec3::ZERO, Vec3::ZERO).unwrap();

        let report = scheduler.tick();
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].command, "despawn");
        assert!(scheduler.world().registry().contains(id));
    }

    #[test]
    fn every_observer_gets_a_batch_each_tick() {
        let (mut scheduler, rx) = scheduler();
        let observer = ObserverId::new();
        scheduler
            .intake()
            .attach(observer, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(1, 1))
            .unwrap();

        scheduler.tick();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.observer, observer);
        assert_eq!(first.events.iter().filter(|e| matches!(e, WorldEvent::ChunkShow { .. })).count(), 9);

        scheduler.tick();
        let second = rx.try_recv().unwrap();
        assert_eq!(second.tick, 2);
        assert!(second.events.is_empty());
    }

    #[test]
    fn zero_budget_overrun_is_reported() {
        let (mut scheduler, _rx) = scheduler();
        scheduler.budget = Duration::ZERO;
        let report = scheduler.tick();
        assert!(report.overrun.is_some());
        assert_eq!(scheduler.current_tick(), 1);
    }

    #[test]
    fn run_stops_when_flag_clears() {
        let (mut scheduler, _rx) = scheduler();
        let running = AtomicBool::new(false);
        scheduler.run(&running);
        assert_eq!(scheduler.current_tick(), 0);
    }

    #[test]
    fn held_session_commands_block_the_rest_of_that_session_only() {
        let player = ObserverId::new();
        let other = ObserverId::new();
        let held = PendingCommand {
            source: CommandSource::Session(player),
            command: Command::Spawn { entity: EntityId(1), position: Vec3::ZERO, velocity: Vec3::ZERO, owner: Some(player) },
        };
        let mut barriers = Barriers::default();
        barriers.raise(&OrderingKeys::of(&held));

        let detach = PendingCommand { source: CommandSource::Session(player), command: Command::Detach { observer: player } };
        let other_session = PendingCommand {
            source: CommandSource::Session(other),
            command: Command::SetVelocity { entity: EntityId(2), velocity: Vec3::ZERO },
        };
        let system_same_entity = PendingCommand {
            source: CommandSource::System,
            command: Command::Despawn { entity: EntityId(1) },
        };
        let system_elsewhere = PendingCommand {
            source: CommandSource::System,
            command: Command::Despawn { entity: EntityId(3) },
        };
        assert!(barriers.blocks(&OrderingKeys::of(&detach)));
        assert!(!barriers.blocks(&OrderingKeys::of(&other_session)));
        assert!(barriers.blocks(&OrderingKeys::of(&system_same_entity)));
        assert!(!barriers.blocks(&OrderingKeys::of(&system_elsewhere)));
    }
}
