//! Static level geometry shared by every role
//!
//! The level is a set of rectangular surface patches. A downward volume cast
//! reports every patch under the probe footprint, which is enough for the
//! movement code to pick the most walkable contact without a physics engine.

use crate::math::Vec3;
use crate::movement::{GroundHit, GroundQuery};
use serde::{Deserialize, Serialize};

/// Surface material id used by footstep/landing effects.
pub type SurfaceMaterial = u16;

pub const MATERIAL_CONCRETE: SurfaceMaterial = 0;
pub const MATERIAL_METAL: SurfaceMaterial = 1;
pub const MATERIAL_GRASS: SurfaceMaterial = 2;

/// A rectangular patch at a fixed height with an arbitrary contact normal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    pub min_x: f32,
    pub max_x: f32,
    pub min_z: f32,
    pub max_z: f32,
    pub height: f32,
    pub normal: Vec3,
    pub material: SurfaceMaterial,
}

impl Surface {
    pub fn flat(min_x: f32, max_x: f32, min_z: f32, max_z: f32, height: f32, material: SurfaceMaterial) -> Self {
        Self {
            min_x,
            max_x,
            min_z,
            max_z,
            height,
            normal: Vec3::UP,
            material,
        }
    }

    fn overlaps_circle(&self, x: f32, z: f32, radius: f32) -> bool {
        let nearest_x = x.clamp(self.min_x, self.max_x);
        let nearest_z = z.clamp(self.min_z, self.max_z);
        let dx = x - nearest_x;
        let dz = z - nearest_z;
        dx * dx + dz * dz <= radius * radius
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Level {
    pub surfaces: Vec<Surface>,
    pub spawn_points: Vec<Vec3>,
}

impl Level {
    pub fn new(surfaces: Vec<Surface>, spawn_points: Vec<Vec3>) -> Self {
        Self {
            surfaces,
            spawn_points,
        }
    }

    /// The arena both binaries load: a floor, a raised metal platform, a
    /// grass ledge and the glancing top edge of a wall next to it.
    pub fn arena() -> Self {
        let surfaces = vec![
            Surface::flat(-20.0, 20.0, -20.0, 20.0, 0.0, MATERIAL_CONCRETE),
            Surface::flat(5.0, 10.0, 5.0, 10.0, 1.5, MATERIAL_METAL),
            Surface::flat(-12.0, -6.0, -4.0, 4.0, 0.75, MATERIAL_GRASS),
            Surface {
                min_x: -6.0,
                max_x: -5.8,
                min_z: -4.0,
                max_z: 4.0,
                height: 0.75,
                normal: Vec3::new(0.94, 0.34, 0.0),
                material: MATERIAL_CONCRETE,
            },
        ];
        let spawn_points = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(-8.0, 0.0, 8.0),
            Vec3::new(8.0, 0.0, -8.0),
            Vec3::new(-9.0, 0.75, 0.0),
        ];
        Self::new(surfaces, spawn_points)
    }

    /// Spawn point for the n-th spawn, cycling through the list.
    pub fn spawn_point(&self, n: usize) -> Vec3 {
        if self.spawn_points.is_empty() {
            Vec3::ZERO
        } else {
            self.spawn_points[n % self.spawn_points.len()]
        }
    }
}

impl GroundQuery for Level {
    fn cast_down(&self, origin: Vec3, radius: f32, max_distance: f32) -> Vec<GroundHit> {
        self.surfaces
            .iter()
            .filter(|surface| surface.overlaps_circle(origin.x, origin.z, radius))
            .filter_map(|surface| {
                let distance = origin.y - surface.height;
                if (0.0..=max_distance).contains(&distance) {
                    Some(GroundHit {
                        point: Vec3::new(origin.x, surface.height, origin.z),
                        normal: surface.normal,
                        distance,
                        material: surface.material,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}
