//! Collision channel encoding
//!
//! Enemy-fired bullets pack four tallies per cell with `K = MAX_BULLETS_PER_GROUP`:
//!
//! | channel | low part        | high part          |
//! |---------|-----------------|--------------------|
//! | x       | points          | K * grazes         |
//! | y       | bombs           | 1000 * lives       |
//! | z       | power           | 1000 * specials    |
//! | w       | player + env    | K * player hits    |
//!
//! Player-fired bullets store `(position, collisionID)` where `0` is no hit,
//! `[1, MAX_ENEMIES)` an environment code and `[MAX_ENEMIES, 2*MAX_ENEMIES)`
//! enemy `id - MAX_ENEMIES`.
//!
//! Decoding widens to f64 before splitting so the integer arithmetic is exact
//! for every value the f32 channel can hold.

use glam::Vec3;

use crate::consts::*;

pub const PACK_K: f64 = MAX_BULLETS_PER_GROUP as f64;
pub const PACK_MINOR: f64 = 1000.0;

/// Decoded enemy-bullet tallies for one readback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnemyTally {
    pub player: u64,
    pub points: u64,
    pub grazes: u64,
    pub bombs: u64,
    pub lives: u64,
    pub power: u64,
    pub specials: u64,
}

impl EnemyTally {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[inline]
fn split(value: f64, multiplier: f64) -> (u64, u64) {
    let value = value.max(0.0).round();
    let high = (value / multiplier).floor();
    let low = value - high * multiplier;
    (low as u64, high as u64)
}

/// Pack tallies the way the enemy collision kernel does (environment hits
/// add to the w low part)
pub fn pack_enemy_tally(tally: &EnemyTally, environment: u64) -> [f64; 4] {
    [
        tally.points as f64 + PACK_K * tally.grazes as f64,
        tally.bombs as f64 + PACK_MINOR * tally.lives as f64,
        tally.power as f64 + PACK_MINOR * tally.specials as f64,
        (tally.player + environment) as f64 + PACK_K * tally.player as f64,
    ]
}

/// Split one packed cell
pub fn decode_enemy_packed(packed: [f64; 4]) -> EnemyTally {
    let (points, grazes) = split(packed[0], PACK_K);
    let (bombs, lives) = split(packed[1], PACK_MINOR);
    let (power, specials) = split(packed[2], PACK_MINOR);
    let (_, player) = split(packed[3], PACK_K);
    EnemyTally {
        player,
        points,
        grazes,
        bombs,
        lives,
        power,
        specials,
    }
}

/// Sum every cell of a readback, then decode
pub fn decode_enemy_tally(data: &[f32]) -> EnemyTally {
    let mut sum = [0.0f64; 4];
    for cell in data.chunks_exact(4) {
        for (acc, v) in sum.iter_mut().zip(cell) {
            *acc += f64::from(*v);
        }
    }
    decode_enemy_packed(sum)
}

/// What a player-fired bullet hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerHitTarget {
    Environment(u32),
    Enemy(usize),
}

impl PlayerHitTarget {
    pub fn from_id(id: f32) -> Option<Self> {
        let id = f64::from(id).round();
        if id < 1.0 {
            return None;
        }
        let id = id as usize;
        if id < MAX_ENEMIES {
            Some(PlayerHitTarget::Environment(id as u32))
        } else if id < MAX_ENEMIES * 2 {
            Some(PlayerHitTarget::Enemy(id - MAX_ENEMIES))
        } else {
            None
        }
    }

    pub fn id(&self) -> f32 {
        match self {
            PlayerHitTarget::Environment(code) => *code as f32,
            PlayerHitTarget::Enemy(index) => (MAX_ENEMIES + index) as f32,
        }
    }
}

/// One cell of a player-bullet readback with a non-zero collision id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerHit {
    pub cell: usize,
    pub position: Vec3,
    pub target: PlayerHitTarget,
}

pub fn decode_player_hits(data: &[f32]) -> Vec<PlayerHit> {
    data.chunks_exact(4)
        .enumerate()
        .filter_map(|(cell, c)| {
            PlayerHitTarget::from_id(c[3]).map(|target| PlayerHit {
                cell,
                position: Vec3::new(c[0], c[1], c[2]),
                target,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const K: u64 = MAX_BULLETS_PER_GROUP as u64;

    #[test]
    fn test_boundary_round_trip() {
        let lows = [0, 1, K - 1];
        let highs = [0, 1, K - 1, K, K + 1];
        for &low in &lows {
            for &high in &highs {
                let tally = EnemyTally {
                    player: high,
                    points: low,
                    grazes: high,
                    bombs: low % 1000,
                    lives: high,
                    power: low % 1000,
                    specials: high,
                };
                let decoded = decode_enemy_packed(pack_enemy_tally(&tally, 0));
                assert_eq!(decoded, tally, "low {low} high {high}");
            }
        }
    }

    #[test]
    fn test_f32_cell_round_trip_at_exact_limit() {
        // every channel packs to at most 2^24, the last integer f32 holds exactly
        let tally = EnemyTally {
            player: 167,
            points: 77_216,
            grazes: 167,
            bombs: 216,
            lives: 16_777,
            power: 216,
            specials: 16_777,
        };
        let packed = pack_enemy_tally(&tally, 49);
        assert_eq!(packed[0], 16_777_216.0);
        assert_eq!(packed[1], 16_777_216.0);

        let cell: [f32; 4] = packed.map(|v| v as f32);
        assert_eq!(decode_enemy_tally(&cell), tally);

        // one past the limit rounds to the nearest even f32
        let over = EnemyTally {
            points: 77_217,
            ..tally
        };
        let cell: [f32; 4] = pack_enemy_tally(&over, 49).map(|v| v as f32);
        assert_eq!(decode_enemy_tally(&cell).points, 77_216);
    }

    #[test]
    fn test_environment_hits_do_not_count_as_player() {
        let tally = EnemyTally::default();
        let decoded = decode_enemy_packed(pack_enemy_tally(&tally, 3));
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_sums_cells() {
        // two grazing bullets, one of which hit
        let data = [
            K as f32, 0.0, 0.0, 0.0, //
            K as f32, 0.0, 0.0, (K + 1) as f32,
        ];
        let tally = decode_enemy_tally(&data);
        assert_eq!(tally.grazes, 2);
        assert_eq!(tally.player, 1);
        assert_eq!(tally.points, 0);
    }

    #[test]
    fn test_player_hit_ids() {
        assert_eq!(PlayerHitTarget::from_id(0.0), None);
        assert_eq!(PlayerHitTarget::from_id(1.0), Some(PlayerHitTarget::Environment(1)));
        assert_eq!(
            PlayerHitTarget::from_id((MAX_ENEMIES - 1) as f32),
            Some(PlayerHitTarget::Environment((MAX_ENEMIES - 1) as u32))
        );
        assert_eq!(
            PlayerHitTarget::from_id(MAX_ENEMIES as f32),
            Some(PlayerHitTarget::Enemy(0))
        );
        assert_eq!(
            PlayerHitTarget::from_id((2 * MAX_ENEMIES - 1) as f32),
            Some(PlayerHitTarget::Enemy(MAX_ENEMIES - 1))
        );
        assert_eq!(PlayerHitTarget::from_id((2 * MAX_ENEMIES) as f32), None);
    }

    #[test]
    fn test_decode_player_hits_skips_empty_cells() {
        let data = [
            1.0, 2.0, 3.0, 0.0, //
            4.0, 5.0, 6.0, (MAX_ENEMIES + 2) as f32, //
            NULL_COORD, NULL_COORD, NULL_COORD, 0.0,
        ];
        let hits = decode_player_hits(&data);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cell, 1);
        assert_eq!(hits[0].position, Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(hits[0].target, PlayerHitTarget::Enemy(2));
    }

    proptest! {
        #[test]
        fn prop_tally_round_trip(
            points in 0..K,
            grazes in 0..K * 10,
            bombs in 0u64..1000,
            lives in 0u64..100_000,
            power in 0u64..1000,
            specials in 0u64..100_000,
            player in 0u64..1000,
            environment in 0u64..1000,
        ) {
            let tally = EnemyTally { player, points, grazes, bombs, lives, power, specials };
            prop_assert_eq!(decode_enemy_packed(pack_enemy_tally(&tally, environment)), tally);
        }

        #[test]
        fn prop_player_ids_round_trip(index in 0..MAX_ENEMIES, code in 1u32..(MAX_ENEMIES as u32)) {
            let enemy = PlayerHitTarget::Enemy(index);
            prop_assert_eq!(PlayerHitTarget::from_id(enemy.id()), Some(enemy));
            let env = PlayerHitTarget::Environment(code);
            prop_assert_eq!(PlayerHitTarget::from_id(env.id()), Some(env));
        }
    }
}
