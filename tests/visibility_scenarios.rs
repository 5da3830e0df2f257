use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::channel::Receiver;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use worldtick::config::SimulationConfig;
use worldtick::core::commands::{Command, CommandIntake, CommandSource};
use worldtick::core::error::WorldError;
use worldtick::networking::ChannelSink;
use worldtick::terrain::generation::GenerationError;
use worldtick::terrain::{ChunkContent, ChunkState, FlatGenerator, MemoryChunkStorage, WorldGenerator};
use worldtick::threading::ThreadPool;
use worldtick::{Anchor, BlockPos, ChunkCoord, EntityId, EventBatch, ObserverId, TickScheduler, Vec3, ViewDistance, WorldEvent};

fn scheduler_with(
    config: SimulationConfig,
    generator: Arc<dyn WorldGenerator>,
) -> (TickScheduler, Receiver<EventBatch>) {
    let (sink, receiver) = ChannelSink::new();
    let scheduler = TickScheduler::with_pool(
        &config,
        generator,
        Arc::new(MemoryChunkStorage::new()),
        Arc::new(sink),
        Arc::new(ThreadPool::inline()),
    )
    .unwrap();
    (scheduler, receiver)
}

fn flat_scheduler() -> (TickScheduler, Receiver<EventBatch>) {
    scheduler_with(SimulationConfig::default(), Arc::new(FlatGenerator::default()))
}

fn attach_at_origin(intake: &CommandIntake, view: ViewDistance) -> ObserverId {
    let observer = ObserverId::new();
    intake.attach(observer, Anchor::Fixed(Vec3::ZERO), view).unwrap();
    observer
}

fn events_for(batch: &EventBatch, entity: EntityId) -> Vec<&WorldEvent> {
    batch.events.iter().filter(|e| e.entity() == Some(entity)).collect()
}

fn walk(intake: &CommandIntake, entity: EntityId, x: f64) {
    intake
        .submit(CommandSource::System, Command::Move { entity, position: Vec3::new(x, 0.0, 8.0) })
        .unwrap();
}

#[test]
fn entity_walking_into_range_spawns_once_then_updates() {
    let (mut scheduler, rx) = flat_scheduler();
    let intake = scheduler.intake();
    attach_at_origin(&intake, ViewDistance::new(1, 1));
    // chunk [2, 0], two chunks from the observer
    let entity = intake.spawn(CommandSource::System, Vec3::new(40.0, 0.0, 8.0), Vec3::ZERO).unwrap();

    scheduler.tick();
    assert!(events_for(&rx.try_recv().unwrap(), entity).is_empty());

    walk(&intake, entity, 36.0);
    scheduler.tick();
    assert!(events_for(&rx.try_recv().unwrap(), entity).is_empty());

    walk(&intake, entity, 30.0);
    scheduler.tick();
    let batch = rx.try_recv().unwrap();
    let events = events_for(&batch, entity);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], WorldEvent::Spawn { position, .. } if position.x == 30.0));

    walk(&intake, entity, 20.0);
    scheduler.tick();
    let batch = rx.try_recv().unwrap();
    assert!(matches!(events_for(&batch, entity).as_slice(), [WorldEvent::Update { .. }]));

    scheduler.tick();
    assert!(events_for(&rx.try_recv().unwrap(), entity).is_empty());
}

#[test]
fn teleport_out_and_back_in_one_tick_is_silent() {
    let (mut scheduler, rx) = flat_scheduler();
    let intake = scheduler.intake();
    attach_at_origin(&intake, ViewDistance::new(2, 1));
    let entity = intake.spawn(CommandSource::System, Vec3::new(4.0, 0.0, 4.0), Vec3::ZERO).unwrap();
    scheduler.tick();
    assert_eq!(events_for(&rx.try_recv().unwrap(), entity).len(), 1);

    let far = Vec3::new(200.0, 0.0, 4.0);
    intake
        .submit(CommandSource::System, Command::Teleport { entity, position: far })
        .unwrap();
    intake
        .submit(CommandSource::System, Command::Teleport { entity, position: Vec3::new(4.0, 0.0, 4.0) })
        .unwrap();
    let report = scheduler.tick();
    assert_eq!(report.applied, 2);
    assert!(rx.try_recv().unwrap().events.is_empty());
}

struct FailingGenerator {
    calls: AtomicUsize,
}

impl WorldGenerator for FailingGenerator {
    fn generate(&self, coord: ChunkCoord) -> Result<ChunkContent, GenerationError> {
        if coord == ChunkCoord::new(10, 10) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(GenerationError::failed(coord, "corrupt region"));
        }
        Ok(ChunkContent::empty())
    }
}

#[test]
fn spawn_into_chunk_that_keeps_failing_is_rejected() {
    let mut config = SimulationConfig::default();
    config.chunks.generation_max_attempts = 3;
    config.chunks.retry_backoff_ticks = 1;
    let generator = Arc::new(FailingGenerator { calls: AtomicUsize::new(0) });
    let (mut scheduler, _rx) = scheduler_with(config, generator.clone());
    let intake = scheduler.intake();
    let coord = ChunkCoord::new(10, 10);

    let entity = intake.spawn(CommandSource::System, Vec3::new(165.0, 0.0, 165.0), Vec3::ZERO).unwrap();
    let mut rejected = None;
    for _ in 0..20 {
        let report = scheduler.tick();
        if let Some(rejection) = report.rejected.into_iter().next() {
            rejected = Some(rejection);
            break;
        }
        assert_eq!(report.held, 1);
    }

    let rejection = rejected.expect("spawn was never rejected");
    assert_eq!(rejection.command, "spawn");
    assert_eq!(rejection.error, WorldError::PermanentFailure { coord, attempts: 3 });
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.world().chunks().state(coord), ChunkState::Unavailable);
    assert!(scheduler.world().registry().get(entity).is_none());
    assert_eq!(scheduler.held_commands(), 0);
}

#[test]
fn commands_behind_a_held_spawn_keep_their_order() {
    let mut config = SimulationConfig::default();
    config.chunks.retry_backoff_ticks = 1;
    let flaky = |coord: ChunkCoord| -> Result<ChunkContent, GenerationError> {
        static FAILED_ONCE: AtomicUsize = AtomicUsize::new(0);
        if coord == ChunkCoord::new(4, 0) && FAILED_ONCE.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(GenerationError::failed(coord, "first attempt"));
        }
        Ok(ChunkContent::empty())
    };
    let (mut scheduler, _rx) = scheduler_with(config, Arc::new(flaky));
    let intake = scheduler.intake();

    let entity = intake.spawn(CommandSource::System, Vec3::new(70.0, 0.0, 1.0), Vec3::ZERO).unwrap();
    intake
        .submit(CommandSource::System, Command::Teleport { entity, position: Vec3::new(72.0, 0.0, 1.0) })
        .unwrap();

    let first = scheduler.tick();
    assert_eq!(first.held, 2);
    assert!(first.rejected.is_empty());

    let mut ticks = 0;
    while scheduler.held_commands() > 0 && ticks < 10 {
        let report = scheduler.tick();
        assert!(report.rejected.is_empty());
        ticks += 1;
    }
    let position = scheduler.world().registry().get(entity).unwrap().position();
    assert_eq!(position, Vec3::new(72.0, 0.0, 1.0));
}

struct FailsOnceAt {
    coord: ChunkCoord,
    failed: AtomicBool,
}

impl FailsOnceAt {
    fn new(coord: ChunkCoord) -> Self {
        FailsOnceAt { coord, failed: AtomicBool::new(false) }
    }
}

impl WorldGenerator for FailsOnceAt {
    fn generate(&self, coord: ChunkCoord) -> Result<ChunkContent, GenerationError> {
        if coord == self.coord && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(GenerationError::failed(coord, "first attempt"));
        }
        FlatGenerator::default().generate(coord)
    }
}

fn drain_held(scheduler: &mut TickScheduler) {
    let mut ticks = 0;
    while scheduler.held_commands() > 0 && ticks < 10 {
        let report = scheduler.tick();
        assert!(report.rejected.is_empty(), "rejected: {:?}", report.rejected);
        ticks += 1;
    }
    assert_eq!(scheduler.held_commands(), 0);
}

#[test]
fn session_detach_waits_for_its_held_spawn_and_attach() {
    let mut config = SimulationConfig::default();
    config.chunks.retry_backoff_ticks = 1;
    let (mut scheduler, _rx) = scheduler_with(config, Arc::new(FailsOnceAt::new(ChunkCoord::new(4, 0))));
    let intake = scheduler.intake();
    let player = ObserverId::new();

    let avatar = intake.spawn(CommandSource::Session(player), Vec3::new(70.0, 0.0, 1.0), Vec3::ZERO).unwrap();
    intake.attach(player, Anchor::Entity(avatar), ViewDistance::new(2, 1)).unwrap();
    intake.detach(player).unwrap();

    let first = scheduler.tick();
    assert_eq!(first.held, 3);
    assert!(first.rejected.is_empty());

    drain_held(&mut scheduler);
    assert!(scheduler.world().tracker().get(player).is_none());
    assert!(!scheduler.world().registry().contains(avatar));
    assert_eq!(scheduler.world().index().chunk_of(avatar), None);
}

#[test]
fn one_session_keeps_order_across_different_targets() {
    let mut config = SimulationConfig::default();
    config.chunks.retry_backoff_ticks = 1;
    let (mut scheduler, _rx) = scheduler_with(config, Arc::new(FailsOnceAt::new(ChunkCoord::new(4, 0))));
    let intake = scheduler.intake();
    let player = ObserverId::new();
    let session = CommandSource::Session(player);
    let block = BlockPos::new(2, 30, 2);

    intake.spawn(session, Vec3::new(70.0, 0.0, 1.0), Vec3::ZERO).unwrap();
    intake.attach(player, Anchor::Fixed(Vec3::ZERO), ViewDistance::new(2, 1)).unwrap();
    let pet = intake.spawn(session, Vec3::new(5.0, 0.0, 5.0), Vec3::ZERO).unwrap();
    intake.submit(session, Command::SetBlock { position: block, block: 5 }).unwrap();
    intake
        .submit(session, Command::SetViewDistance { observer: player, view: ViewDistance::new(3, 2) })
        .unwrap();
    let bystander = intake.spawn(CommandSource::System, Vec3::new(5.0, 0.0, 5.0), Vec3::ZERO).unwrap();

    let first = scheduler.tick();
    assert_eq!(first.held, 5);
    assert_eq!(first.applied, 1);
    assert!(scheduler.world().registry().contains(bystander));
    assert!(!scheduler.world().registry().contains(pet));
    assert!(scheduler.world().tracker().get(player).is_none());
    assert_ne!(scheduler.world().chunks().read(block), Some(5));

    drain_held(&mut scheduler);
    assert!(scheduler.world().registry().contains(pet));
    assert_eq!(scheduler.world().chunks().read(block), Some(5));
    let observer = scheduler.world().tracker().get(player).unwrap();
    assert_eq!(observer.view(), ViewDistance::new(3, 2));
}

#[test]
fn known_sets_track_random_walks_without_drift() {
    let mut config = SimulationConfig::default();
    config.view.chunk_view_distance = 2;
    config.view.entity_view_distance = 1;
    let (mut scheduler, rx) = scheduler_with(config, Arc::new(FlatGenerator::default()));
    let intake = scheduler.intake();
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let observers: Vec<ObserverId> = (0..3)
        .map(|i| {
            let observer = ObserverId::new();
            let anchor = Anchor::Fixed(Vec3::new(i as f64 * 24.0, 0.0, 0.0));
            intake.attach(observer, anchor, ViewDistance::new(2, 1)).unwrap();
            observer
        })
        .collect();
    let entities: Vec<EntityId> = (0..30)
        .map(|_| {
            let position = Vec3::new(rng.random_range(-40.0..80.0), 0.0, rng.random_range(-40.0..40.0));
            intake.spawn(CommandSource::System, position, Vec3::ZERO).unwrap()
        })
        .collect();

    // ids each observer has been told about and not yet told to forget
    let mut spawned: HashMap<ObserverId, HashSet<EntityId>> = HashMap::new();

    for _ in 0..40 {
        for entity in &entities {
            if rng.random_bool(0.3) {
                let position = Vec3::new(rng.random_range(-40.0..80.0), 0.0, rng.random_range(-40.0..40.0));
                intake
                    .submit(CommandSource::System, Command::Teleport { entity: *entity, position })
                    .unwrap();
            }
        }
        let report = scheduler.tick();
        assert!(report.rejected.is_empty());

        for batch in rx.try_iter() {
            let live = spawned.entry(batch.observer).or_default();
            for event in &batch.events {
                match event {
                    WorldEvent::Spawn { entity, .. } => assert!(live.insert(*entity)),
                    WorldEvent::Update { entity, .. } => assert!(live.contains(entity)),
                    WorldEvent::Despawn { entity } => assert!(live.remove(entity)),
                    _ => {}
                }
            }
        }

        for observer in &observers {
            let world = scheduler.world();
            let known = world.tracker().get(*observer).unwrap().known().clone();
            let truth = world.true_visible(*observer, report.tick).unwrap();
            assert_eq!(known, truth);
            let streamed: HashSet<EntityId> = spawned[observer].clone();
            assert_eq!(streamed, known.entities.iter().copied().collect());
        }
    }
}

#[test]
fn detaching_despawns_owned_entities_for_other_observers() {
    let (mut scheduler, rx) = flat_scheduler();
    let intake = scheduler.intake();
    let watcher = attach_at_origin(&intake, ViewDistance::new(2, 2));

    let player = ObserverId::new();
    let avatar = intake
        .spawn(CommandSource::Session(player), Vec3::new(10.0, 0.0, 10.0), Vec3::ZERO)
        .unwrap();
    intake.attach(player, Anchor::Entity(avatar), ViewDistance::new(2, 2)).unwrap();
    scheduler.tick();
    let spawned: BTreeMap<ObserverId, usize> = rx
        .try_iter()
        .map(|b| (b.observer, events_for(&b, avatar).len()))
        .collect();
    assert_eq!(spawned[&watcher], 1);
    assert_eq!(spawned[&player], 0);

    intake.detach(player).unwrap();
    scheduler.tick();
    let batches: Vec<EventBatch> = rx.try_iter().collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].events, vec![WorldEvent::Despawn { entity: avatar }]);
}

#[test]
fn observers_see_block_edits_in_known_chunks() {
    let (mut scheduler, rx) = flat_scheduler();
    let intake = scheduler.intake();
    attach_at_origin(&intake, ViewDistance::new(1, 0));
    scheduler.tick();
    rx.try_recv().unwrap();

    intake
        .submit(
            CommandSource::System,
            Command::SetBlock { position: BlockPos::new(5, 20, 5), block: 3 },
        )
        .unwrap();
    scheduler.tick();
    assert_eq!(
        rx.try_recv().unwrap().events,
        vec![WorldEvent::ChunkUpdate { coord: ChunkCoord::new(0, 0) }]
    );
}

#[test]
fn diffing_disabled_updates_every_visible_entity() {
    let mut config = SimulationConfig::default();
    config.tick.diffing_enabled = false;
    let (mut scheduler, rx) = scheduler_with(config, Arc::new(FlatGenerator::default()));
    let intake = scheduler.intake();
    attach_at_origin(&intake, ViewDistance::new(1, 1));
    let entity = intake.spawn(CommandSource::System, Vec3::new(2.0, 0.0, 2.0), Vec3::ZERO).unwrap();
    scheduler.tick();
    rx.try_recv().unwrap();

    scheduler.tick();
    let batch = rx.try_recv().unwrap();
    assert!(matches!(events_for(&batch, entity).as_slice(), [WorldEvent::Update { .. }]));
}
