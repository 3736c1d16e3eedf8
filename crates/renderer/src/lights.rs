//! Random light set fed to the trace shader as a static uniform array.

use rand::prelude::*;

/// Upper bound baked into the shader-side array declarations.
pub const MAX_LIGHTS: usize = 250;

/// Point lights scattered around a cylinder along the tunnel axis, with a
/// palette index per light. Generated once at startup; the seed makes runs
/// reproducible.
#[derive(Debug, Clone)]
pub struct LightSet {
    positions: Vec<[f32; 4]>,
    colors: Vec<i32>,
}

impl LightSet {
    pub fn generate(count: usize, seed: u64) -> Self {
        let count = count.min(MAX_LIGHTS);
        let mut rng = StdRng::seed_from_u64(seed);

        let positions = (0..count)
            .map(|i| {
                let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
                [
                    angle.cos() * 5.0,
                    angle.sin().abs() * 5.0,
                    0.2 * i as f32 - 0.2,
                    0.0,
                ]
            })
            .collect();
        let colors = (0..count).map(|_| rng.gen_range(3..7)).collect();

        Self { positions, colors }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[[f32; 4]] {
        &self.positions
    }

    pub fn colors(&self) -> &[i32] {
        &self.colors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic_per_seed() {
        let a = LightSet::generate(16, 7);
        let b = LightSet::generate(16, 7);
        assert_eq!(a.positions(), b.positions());
        assert_eq!(a.colors(), b.colors());

        let c = LightSet::generate(16, 8);
        assert_ne!(a.positions(), c.positions());
    }

    #[test]
    fn lights_sit_on_the_cylinder() {
        let lights = LightSet::generate(32, 1);
        for (i, pos) in lights.positions().iter().enumerate() {
            let radius = (pos[0] * pos[0] + pos[1] * pos[1]).sqrt();
            assert!((radius - 5.0).abs() < 1e-3, "light {i} off radius: {radius}");
            assert!(pos[1] >= 0.0, "light {i} below the floor");
            let expected_z = 0.2 * i as f32 - 0.2;
            assert!((pos[2] - expected_z).abs() < 1e-6);
        }
        for &col in lights.colors() {
            assert!((3..7).contains(&col));
        }
    }

    #[test]
    fn count_is_clamped_to_capacity() {
        let lights = LightSet::generate(MAX_LIGHTS + 50, 3);
        assert_eq!(lights.len(), MAX_LIGHTS);
    }
}
