//! Bullet group manager
//!
//! Per frame, in order:
//! 1. copy the world snapshot into the actor buffers
//! 2. poll readbacks and decode every ticket that resolved
//! 3. per group: advance the timer and retire the group once its lifespan
//!    has passed, otherwise queue a readback of last step's collisions and
//!    step it and its sounds
//! 4. dispose retired groups, abandoning their in-flight readbacks
//!
//! A group that fails to step does not stop the others; the first failure
//! is returned once every group has been visited and retired groups are gone.

use std::collections::{BTreeMap, VecDeque};

use glam::Vec3;
use rand::SeedableRng;
use rand_pcg::Pcg32;

use super::readback::{ReadbackQueue, ReadbackTicket, TicketStatus, TransferPool};
use super::world::{ActorBuffers, EmitterId, WorldSnapshot};
use super::GroupId;
use crate::audio::{SoundEffect, SoundSchedule};
use crate::behaviour::encoding::{
    EnemyTally, PlayerHitTarget, decode_enemy_tally, decode_player_hits,
};
use crate::behaviour::{Behaviour, BehaviourInit, CollisionProfile};
use crate::compute::{ComputeBackend, PoolId};
use crate::error::Result;
use crate::recipe::registry::{BulletMesh, make_bullet_material, make_bullet_mesh};
use crate::recipe::{
    BulletMaterial, BulletRecipe, Deferred, RecipeCache, RecipeId, RecipeSpec,
    prepare_bullet_instruction,
};
use crate::settings::SimConfig;

/// Decoded collision readback
#[derive(Debug, Clone, PartialEq)]
pub enum CollisionEvent {
    /// Enemy-fired group touched or grazed the player
    PlayerTally { group: GroupId, tally: EnemyTally },
    /// Player-fired bullet hit an enemy
    EnemyHit {
        group: GroupId,
        enemy: usize,
        position: Vec3,
        damage: f32,
    },
    /// Player-fired bullet left the arena
    EnvironmentHit {
        group: GroupId,
        code: u32,
        position: Vec3,
    },
}

/// Sound to play this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundCue {
    pub group: GroupId,
    pub effect: SoundEffect,
    /// Activation waves crossed this frame
    pub count: usize,
}

#[derive(Debug, Default)]
pub struct FrameReport {
    pub events: Vec<CollisionEvent>,
    pub sounds: Vec<SoundCue>,
    pub removed: Vec<GroupId>,
    /// Readbacks that failed or were abandoned; their collisions are lost
    pub dropped_readbacks: usize,
}

struct BulletGroup {
    recipe: BulletRecipe,
    emitter: EmitterId,
    behaviour: Behaviour,
    material: BulletMaterial,
    mesh: BulletMesh,
    pool: TransferPool,
    tickets: VecDeque<ReadbackTicket>,
    sounds: Option<SoundSchedule>,
    timer: f32,
}

impl BulletGroup {
    /// Queue a readback of the last step's collisions, then advance one step
    fn step(
        &mut self,
        id: GroupId,
        backend: &mut dyn ComputeBackend,
        readbacks: &mut ReadbackQueue,
        actors: &ActorBuffers,
        world: &WorldSnapshot,
        delta: f32,
    ) -> Result<()> {
        if let Some(grid) = self.behaviour.collision_result() {
            let ticket = readbacks.request(backend, grid, &mut self.pool, id)?;
            self.tickets.push_back(ticket);
        }
        self.behaviour.update(
            backend,
            delta,
            world.emitter(self.emitter),
            actors,
            &mut self.material,
        )?;
        Ok(())
    }
}

pub struct BulletGroupManager {
    config: SimConfig,
    groups: BTreeMap<GroupId, BulletGroup>,
    cache: RecipeCache,
    readbacks: ReadbackQueue,
    actors: ActorBuffers,
    rng: Pcg32,
    next_group: u64,
    next_recipe: u64,
}

impl BulletGroupManager {
    pub fn new(config: SimConfig) -> Self {
        let rng = Pcg32::seed_from_u64(config.seed);
        Self {
            config,
            groups: BTreeMap::new(),
            cache: RecipeCache::new(),
            readbacks: ReadbackQueue::new(),
            actors: ActorBuffers::default(),
            rng,
            next_group: 1,
            next_recipe: 1,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.groups.keys().copied()
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub fn recipe(&self, id: GroupId) -> Option<&BulletRecipe> {
        self.groups.get(&id).map(|g| &g.recipe)
    }

    pub fn material(&self, id: GroupId) -> Option<&BulletMaterial> {
        self.groups.get(&id).map(|g| &g.material)
    }

    pub fn mesh(&self, id: GroupId) -> Option<&BulletMesh> {
        self.groups.get(&id).map(|g| &g.mesh)
    }

    pub fn readbacks_in_flight(&self) -> usize {
        self.readbacks.in_flight()
    }

    pub fn cache(&self) -> &RecipeCache {
        &self.cache
    }

    fn fresh_recipe_id(&mut self) -> RecipeId {
        let id = RecipeId(format!("recipe-{}", self.next_recipe));
        self.next_recipe += 1;
        id
    }

    /// Resolve a recipe for the current difficulty
    pub fn prepare(&mut self, recipe: &Deferred<RecipeSpec>) -> Result<BulletRecipe> {
        let fallback = self.fresh_recipe_id();
        prepare_bullet_instruction(recipe, self.config.difficulty, fallback)
    }

    /// Resolve and build a recipe's pattern, timings and grids ahead of use
    pub fn precompute(&mut self, recipe: &Deferred<RecipeSpec>) -> Result<BulletRecipe> {
        let prepared = self.prepare(recipe)?;
        self.cache.precompute(&prepared, &mut self.rng)?;
        Ok(prepared)
    }

    /// Create a group fired from `emitter`
    pub fn add_group(
        &mut self,
        backend: &mut dyn ComputeBackend,
        world: &WorldSnapshot,
        emitter: EmitterId,
        recipe: &Deferred<RecipeSpec>,
    ) -> Result<GroupId> {
        let prepared = self.prepare(recipe)?;
        self.add_prepared(backend, world, emitter, prepared)
    }

    /// Create a group from an already-resolved recipe
    pub fn add_prepared(
        &mut self,
        backend: &mut dyn ComputeBackend,
        world: &WorldSnapshot,
        emitter: EmitterId,
        recipe: BulletRecipe,
    ) -> Result<GroupId> {
        self.actors.write(world);
        let sources = self.cache.resolve(&recipe, &mut self.rng, false)?;
        let count = sources.pattern.len();
        let mesh = make_bullet_mesh(&recipe.mesh, count)?;
        let material = make_bullet_material(&recipe.material);

        let mut behaviour = Behaviour::new(&recipe.behaviour, recipe.mesh.radius);
        behaviour.init(
            backend,
            BehaviourInit {
                sources: &sources.grids,
                parent: world.emitter(emitter),
                actors: &self.actors,
                config: &self.config,
                laser_length: recipe.mesh.laser_length,
            },
        )?;

        let sounds = (!recipe.sound.mute)
            .then(|| SoundSchedule::new(recipe.sound.sound, &sources.pattern.timings));

        let id = GroupId(self.next_group);
        self.next_group += 1;

        log::info!(
            "Group {} from recipe {}: {} {} bullets, lifespan {}s",
            id.0,
            recipe.uid,
            count,
            recipe.behaviour.behaviour.as_str(),
            recipe.lifespan
        );

        self.groups.insert(
            id,
            BulletGroup {
                pool: TransferPool::new(PoolId(id.0), self.config.readback_depth),
                recipe,
                emitter,
                behaviour,
                material,
                mesh,
                tickets: VecDeque::new(),
                sounds,
                timer: 0.0,
            },
        );
        Ok(id)
    }

    /// Advance every group by `delta` seconds
    pub fn update(
        &mut self,
        backend: &mut dyn ComputeBackend,
        world: &WorldSnapshot,
        delta: f32,
    ) -> Result<FrameReport> {
        let mut report = FrameReport::default();

        self.actors.write(world);
        self.readbacks.resolve(backend);

        let mut expired = Vec::new();
        let mut failure = None;
        for (&id, group) in self.groups.iter_mut() {
            drain_tickets(id, group, &mut report);

            group.timer += delta;
            if group.timer > group.recipe.lifespan {
                expired.push(id);
                continue;
            }

            if let Err(err) = group.step(id, backend, &mut self.readbacks, &self.actors, world, delta) {
                log::warn!("Group {} failed to step: {}", id.0, err);
                failure.get_or_insert(err);
                continue;
            }

            if let Some(sounds) = group.sounds.as_mut() {
                let count = sounds.update(delta);
                if count > 0 {
                    report.sounds.push(SoundCue {
                        group: id,
                        effect: sounds.effect(),
                        count,
                    });
                }
            }
        }

        for id in expired {
            if let Err(err) = self.dispose_group(backend, id) {
                log::warn!("Group {} failed to dispose: {}", id.0, err);
                failure.get_or_insert(err);
            }
            report.removed.push(id);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Dispose one group now; its pending readbacks never resolve
    pub fn dispose_group(&mut self, backend: &mut dyn ComputeBackend, id: GroupId) -> Result<bool> {
        let Some(mut group) = self.groups.remove(&id) else {
            return Ok(false);
        };
        self.readbacks.abandon_owner(id);
        backend.release_transfer_pool(group.pool.id());
        group.behaviour.dispose(backend)?;
        log::info!("Group {} disposed after {:.2}s", id.0, group.timer);
        Ok(true)
    }

    pub fn dispose_all(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            self.dispose_group(backend, id)?;
        }
        Ok(())
    }
}

/// Decode every resolved ticket and drop the ones that never will resolve
fn drain_tickets(id: GroupId, group: &mut BulletGroup, report: &mut FrameReport) {
    let profile = group.behaviour.profile();
    let damage = group.behaviour.bullet_value();

    group.tickets.retain(|ticket| match ticket.status() {
        TicketStatus::Pending => true,
        TicketStatus::Ready | TicketStatus::Failed => {
            match ticket.take() {
                Some(Ok(data)) => decode(id, profile, damage, &data, &mut report.events),
                Some(Err(err)) => {
                    log::debug!("Group {} lost a frame of collisions: {}", id.0, err);
                    report.dropped_readbacks += 1;
                }
                None => {}
            }
            false
        }
        TicketStatus::Abandoned => {
            report.dropped_readbacks += 1;
            false
        }
        TicketStatus::Consumed => false,
    });
}

fn decode(
    group: GroupId,
    profile: CollisionProfile,
    damage: f32,
    data: &[f32],
    events: &mut Vec<CollisionEvent>,
) {
    match profile {
        CollisionProfile::EnemyBullet | CollisionProfile::EnemyLaser => {
            let tally = decode_enemy_tally(data);
            if !tally.is_empty() {
                events.push(CollisionEvent::PlayerTally { group, tally });
            }
        }
        CollisionProfile::PlayerBullet => {
            events.extend(decode_player_hits(data).into_iter().map(|hit| match hit.target {
                PlayerHitTarget::Enemy(enemy) => CollisionEvent::EnemyHit {
                    group,
                    enemy,
                    position: hit.position,
                    damage,
                },
                PlayerHitTarget::Environment(code) => CollisionEvent::EnvironmentHit {
                    group,
                    code,
                    position: hit.position,
                },
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::Side;
    use crate::compute::{CpuBackend, TransferMode};
    use crate::error::BulletError;
    use crate::recipe::Repeat;
    use crate::sim::world::{Collider, ParentTransform};

    fn spec(num: usize, lifespan: f32) -> RecipeSpec {
        let mut spec = RecipeSpec::default();
        spec.pattern_options.num = Some(Deferred::from(num));
        spec.lifespan = Some(Deferred::from(lifespan));
        spec
    }

    fn world_at(emitter: Vec3) -> WorldSnapshot {
        let mut world = WorldSnapshot::default();
        world.set_emitter(EmitterId(1), ParentTransform::at(emitter));
        world
    }

    #[test]
    fn test_lifespan_expiry() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let world = world_at(Vec3::new(0.0, 5.0, 0.0));
        let id = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 10.0)))
            .unwrap();

        let report = manager.update(&mut backend, &world, 9.9).unwrap();
        assert!(report.removed.is_empty());
        let report = manager.update(&mut backend, &world, 0.05).unwrap();
        assert!(report.removed.is_empty());
        assert!(manager.contains(id));

        let report = manager.update(&mut backend, &world, 0.1).unwrap();
        assert_eq!(report.removed, vec![id]);
        assert!(!manager.contains(id));
        assert_eq!(manager.readbacks_in_flight(), 0);
        assert_eq!(backend.live_grids(), 0);
    }

    #[test]
    fn test_expiring_group_queues_no_readback() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let world = world_at(Vec3::new(0.0, 5.0, 0.0));
        manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 1.0)))
            .unwrap();

        // nothing to read back before the first step
        manager.update(&mut backend, &world, 0.4).unwrap();
        assert_eq!(backend.transfer_count(), 0);
        manager.update(&mut backend, &world, 0.4).unwrap();
        assert_eq!(backend.transfer_count(), 1);

        let report = manager.update(&mut backend, &world, 0.4).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(backend.transfer_count(), 1);
        assert_eq!(report.dropped_readbacks, 0);
    }

    #[test]
    fn test_failing_group_does_not_block_the_frame() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let world = world_at(Vec3::new(0.0, 5.0, 0.0));
        let short = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 0.5)))
            .unwrap();
        let first = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 10.0)))
            .unwrap();
        let second = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 10.0)))
            .unwrap();
        manager.update(&mut backend, &world, 0.3).unwrap();

        backend.set_dispatch_failing(true);
        let err = manager.update(&mut backend, &world, 0.3).unwrap_err();
        assert!(matches!(err, BulletError::Backend(_)));

        // both live groups were attempted, the expired one is gone
        assert_eq!(backend.rejected_dispatches(), 2);
        assert!(!manager.contains(short));
        assert!(manager.contains(first));
        assert!(manager.contains(second));

        backend.set_dispatch_failing(false);
        manager.update(&mut backend, &world, 0.3).unwrap();
        assert_eq!(manager.group_count(), 2);
    }

    #[test]
    fn test_enemy_group_reports_player_hits() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let mut world = world_at(Vec3::new(0.0, 5.0, 0.0));
        world.player_position = Vec3::new(0.0, 5.0, 0.0);

        let mut recipe = spec(100, 10.0);
        recipe.mesh_options.radius = Some(Deferred::from(2.0_f32));
        manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(recipe))
            .unwrap();

        let mut hits = 0;
        let mut grazes = 0;
        for _ in 0..10 {
            let report = manager.update(&mut backend, &world, 0.1).unwrap();
            for event in report.events {
                if let CollisionEvent::PlayerTally { tally, .. } = event {
                    hits += tally.player;
                    grazes += tally.grazes;
                }
            }
        }
        assert_eq!(hits, 100);
        assert_eq!(grazes, 100);
    }

    #[test]
    fn test_player_group_reports_enemy_hits() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let mut world = world_at(Vec3::new(0.0, 5.0, 0.0));
        world.enemies = vec![
            Collider::new(Vec3::new(0.0, -100.0, 0.0), 1.0),
            Collider::new(Vec3::new(0.0, 5.0, 0.0), 3.0),
        ];

        let mut recipe = spec(20, 10.0);
        recipe.behaviour_options.side = Some(Deferred::from(Side::Player));
        recipe.behaviour_options.bullet_value = Some(Deferred::from(2.5_f32));
        let id = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(recipe))
            .unwrap();

        let mut events = Vec::new();
        for _ in 0..6 {
            events.extend(manager.update(&mut backend, &world, 0.016).unwrap().events);
        }
        assert_eq!(events.len(), 20);
        for event in events {
            match event {
                CollisionEvent::EnemyHit {
                    group,
                    enemy,
                    damage,
                    ..
                } => {
                    assert_eq!(group, id);
                    assert_eq!(enemy, 1);
                    assert_eq!(damage, 2.5);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_disposed_group_drops_stalled_readbacks() {
        let mut backend = CpuBackend::new();
        backend.set_transfer_mode(TransferMode::Stalled);
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let world = world_at(Vec3::new(0.0, 5.0, 0.0));
        let id = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(spec(10, 1.0)))
            .unwrap();

        for _ in 0..5 {
            let report = manager.update(&mut backend, &world, 0.1).unwrap();
            assert!(report.events.is_empty());
        }
        assert!(manager.readbacks_in_flight() > 0);

        assert!(manager.dispose_group(&mut backend, id).unwrap());
        assert_eq!(manager.readbacks_in_flight(), 0);
        assert!(!manager.dispose_group(&mut backend, id).unwrap());

        backend.set_transfer_mode(TransferMode::Normal);
        let report = manager.update(&mut backend, &world, 0.1).unwrap();
        assert!(report.events.is_empty());
    }

    #[test]
    fn test_sound_cues_follow_timings() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let world = world_at(Vec3::new(0.0, 5.0, 0.0));

        let mut recipe = spec(4, 10.0);
        recipe.pattern_options.repeat = Some(Deferred::from(Repeat { times: 2, delay: 0.5 }));
        manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(recipe))
            .unwrap();

        let cues: Vec<usize> = (0..8)
            .map(|_| {
                let report = manager.update(&mut backend, &world, 0.1).unwrap();
                report.sounds.iter().map(|c| c.count).sum()
            })
            .collect();
        assert_eq!(cues.iter().sum::<usize>(), 2);
        assert_eq!(cues[0], 1);

        let mut muted = spec(4, 10.0);
        muted.sound_options.mute = Some(Deferred::from(true));
        let id = manager
            .add_group(&mut backend, &world, EmitterId(1), &Deferred::from(muted))
            .unwrap();
        let report = manager.update(&mut backend, &world, 0.1).unwrap();
        assert!(report.sounds.iter().all(|c| c.group != id));
    }

    #[test]
    fn test_precompute_fills_cache() {
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let mut recipe = spec(16, 5.0);
        recipe.uid = Some("wave".into());
        let prepared = manager.precompute(&Deferred::from(recipe)).unwrap();
        assert!(manager.cache().contains(&prepared.uid));
        assert!(manager.cache().grids(&prepared.uid).is_some());
    }

    #[test]
    fn test_laser_without_length_fails_at_creation() {
        let mut backend = CpuBackend::new();
        let mut manager = BulletGroupManager::new(SimConfig::default());
        let mut recipe = spec(4, 5.0);
        recipe.behaviour_options.behaviour = Some(Deferred::from("linearLaser".to_string()));
        let err = manager
            .add_group(&mut backend, &WorldSnapshot::default(), EmitterId(1), &Deferred::from(recipe))
            .unwrap_err();
        assert!(matches!(err, crate::BulletError::Configuration(_)));
        assert_eq!(manager.group_count(), 0);
        assert_eq!(backend.live_grids(), 0);
    }
}
