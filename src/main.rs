//! Danmaku Compute headless driver
//!
//! Spawns a few demo recipes against a scripted world and logs what the
//! collision readbacks report.

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::f32::consts::TAU;

    use danmaku_compute::compute::{ComputeBackend, CpuBackend, GpuBackend};
    use danmaku_compute::recipe::{Deferred, RecipeSpec};
    use danmaku_compute::sim::{
        BulletGroupManager, Collider, CollisionEvent, EmitterId, ParentTransform, WorldSnapshot,
    };
    use danmaku_compute::{BulletError, Result, SimConfig};
    use glam::{Quat, Vec3};

    const FRAME_DT: f32 = 1.0 / 60.0;
    const BOSS: EmitterId = EmitterId(1);
    const SHIP: EmitterId = EmitterId(2);

    const RING: &str = r#"{
        "uid": "boss-ring",
        "patternOptions": { "num": 600, "speed": 2.0, "repeat": { "times": 3, "delay": 0.75 } },
        "meshOptions": { "radius": 0.15 },
        "lifespan": 6
    }"#;

    const SPREAD: &str = r#"{
        "uid": "boss-spread",
        "patternOptions": { "num": 80, "speeds": [1.0, 1.5, 2.0], "offset": { "x": "rand", "y": 0, "z": "rand", "normalizeToLength": 0.5 } },
        "endTimingOptions": { "timing": "batch", "times": [2, 3, 4] },
        "behaviourOptions": { "bulletType": "point" },
        "lifespan": 5
    }"#;

    const SHOT: &str = r#"{
        "uid": "ship-shot",
        "patternOptions": { "num": 24, "speed": 6.0, "thetaLength": 0.6, "yStart": 0.2, "yLength": 0.4 },
        "behaviourOptions": { "side": "player", "bulletValue": 3, "rotationFromParent": true },
        "soundOptions": { "mute": true },
        "lifespan": 2
    }"#;

    struct Args {
        gpu: bool,
        frames: u32,
        config: Option<String>,
    }

    fn parse_args() -> Result<Args> {
        let mut args = Args {
            gpu: false,
            frames: 600,
            config: None,
        };
        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--gpu" => args.gpu = true,
                "--frames" => {
                    let value = it.next().unwrap_or_default();
                    args.frames = value
                        .parse()
                        .map_err(|_| BulletError::config(format!("--frames expects a count, got '{value}'")))?;
                }
                "--config" => {
                    args.config = Some(
                        it.next()
                            .ok_or_else(|| BulletError::config("--config expects a path"))?,
                    );
                }
                other => return Err(BulletError::config(format!("unknown argument '{other}'"))),
            }
        }
        Ok(args)
    }

    fn load_config(path: Option<&str>) -> Result<SimConfig> {
        let Some(path) = path else {
            return Ok(SimConfig::default());
        };
        let json = std::fs::read_to_string(path)
            .map_err(|e| BulletError::config(format!("cannot read {path}: {e}")))?;
        let config = SimConfig::from_json(&json)?;
        log::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Boss sweeps side to side, the ship circles beneath it
    fn scripted_world(t: f32) -> WorldSnapshot {
        let boss = Vec3::new(4.0 * (t * 0.5).sin(), 8.0, 0.0);
        let ship = Vec3::new(3.0 * (t * TAU / 8.0).cos(), 2.0, 3.0 * (t * TAU / 8.0).sin());

        let mut world = WorldSnapshot {
            player_position: ship,
            enemies: vec![Collider::new(boss, 1.0)],
            ..Default::default()
        };
        world.set_emitter(BOSS, ParentTransform::at(boss));
        let aim = Quat::from_rotation_arc(Vec3::X, (boss - ship).normalize_or(Vec3::Y));
        world.set_emitter(
            SHIP,
            ParentTransform {
                position: ship,
                rotation: aim,
            },
        );
        world
    }

    fn run_frames(backend: &mut dyn ComputeBackend, config: SimConfig, frames: u32) -> Result<()> {
        let mut manager = BulletGroupManager::new(config);
        let ring = Deferred::from(RecipeSpec::from_json(RING)?);
        let spread = Deferred::from(RecipeSpec::from_json(SPREAD)?);
        let shot = Deferred::from(RecipeSpec::from_json(SHOT)?);

        for recipe in [&ring, &spread, &shot] {
            manager.precompute(recipe)?;
        }

        let mut player_hits = 0u64;
        let mut grazes = 0u64;
        let mut damage = 0.0f32;
        let mut dropped = 0usize;

        for frame in 0..frames {
            let t = frame as f32 * FRAME_DT;
            let world = scripted_world(t);

            if frame % 180 == 0 {
                manager.add_group(backend, &world, BOSS, &ring)?;
            }
            if frame % 120 == 60 {
                manager.add_group(backend, &world, BOSS, &spread)?;
            }
            if frame % 20 == 0 {
                manager.add_group(backend, &world, SHIP, &shot)?;
            }

            let report = manager.update(backend, &world, FRAME_DT)?;
            for event in &report.events {
                match event {
                    CollisionEvent::PlayerTally { group, tally } => {
                        player_hits += tally.player;
                        grazes += tally.grazes;
                        log::debug!("Frame {}: group {} {:?}", frame, group.0, tally);
                    }
                    CollisionEvent::EnemyHit { enemy, damage: d, .. } => {
                        damage += d;
                        log::debug!("Frame {}: enemy {} took {}", frame, enemy, d);
                    }
                    CollisionEvent::EnvironmentHit { .. } => {}
                }
            }
            for cue in &report.sounds {
                log::debug!("Frame {}: play {} x{}", frame, cue.effect.as_str(), cue.count);
            }
            dropped += report.dropped_readbacks;
        }

        log::info!(
            "{} frames: player hit {} times, {} grazes, {:.1} damage dealt, {} readbacks dropped, {} groups alive",
            frames,
            player_hits,
            grazes,
            damage,
            dropped,
            manager.group_count()
        );
        manager.dispose_all(backend)
    }

    pub fn main() -> Result<()> {
        let args = parse_args()?;
        let config = load_config(args.config.as_deref())?;
        config.validate()?;

        if args.gpu {
            let mut backend = GpuBackend::headless()?;
            log::info!("Running {} frames on the GPU backend", args.frames);
            run_frames(&mut backend, config, args.frames)
        } else {
            let mut backend = CpuBackend::new();
            log::info!("Running {} frames on the CPU backend", args.frames);
            run_frames(&mut backend, config, args.frames)
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Danmaku Compute starting...");

    if let Err(e) = native::main() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {}
