use glam::{Mat4, Vec3};
use nanorand::Rng as _;

use crate::geometry::MeshHandle;

/// Rays traced per instance: primary, shadow, reflection. The hit-group
/// section of the binding table carries this many records per instance.
pub const RAY_TYPE_COUNT: u32 = 3;

/// Fixed-layout camera block: 4 consecutive 4x4 matrices, rewritten into
/// the camera constant buffer once per frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

/// The view/projection provider consumed once per frame.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn looking_at(eye: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            eye,
            target,
            up: Vec3::Y,
            fov_y: 45f32.to_radians(),
            aspect,
            near: 0.1,
            far: 1000.0,
        }
    }

    pub fn matrices(&self) -> CameraMatrices {
        let view = Mat4::look_at_rh(self.eye, self.target, self.up);
        let proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
        CameraMatrices {
            view,
            proj,
            view_inverse: view.inverse(),
            proj_inverse: proj.inverse(),
        }
    }
}

/// Three vertex tint colors, one block per instance, fed to the hit shaders
/// through the binding table.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct InstanceColors {
    pub a: [f32; 4],
    pub b: [f32; 4],
    pub c: [f32; 4],
}

/// Generate one color block per instance from an injected seeded generator,
/// so test runs are reproducible.
pub fn generate_instance_colors(
    count: usize,
    rng: &mut nanorand::WyRand,
) -> Vec<InstanceColors> {
    fn random_unit(rng: &mut nanorand::WyRand) -> f32 {
        rng.generate::<u32>() as f32 / u32::MAX as f32
    }
    fn random_color(rng: &mut nanorand::WyRand) -> [f32; 4] {
        [random_unit(rng), random_unit(rng), random_unit(rng), 1.0]
    }
    (0..count)
        .map(|_| InstanceColors {
            a: random_color(rng),
            b: random_color(rng),
            c: random_color(rng),
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
pub struct SceneInstance {
    pub mesh: MeshHandle,
    /// Position in the caller's bottom-level structure list.
    pub blas_index: usize,
    pub transform: Mat4,
    /// Base record of this instance's hit-group section slice.
    pub sbt_offset: u32,
}

/// The per-frame mutable instance set. Fixed after scene setup; only
/// transforms change between frames.
pub struct SceneInstances {
    instances: Vec<SceneInstance>,
    time: u32,
}

impl SceneInstances {
    pub fn new(instances: Vec<SceneInstance>) -> Self {
        Self { instances, time: 0 }
    }

    /// The demo layout: a ring of eight tetrahedra around an animated one,
    /// over a floor plane scaled up from the unit quad.
    pub fn demo(
        tetrahedron: (MeshHandle, usize),
        plane: (MeshHandle, usize),
    ) -> Self {
        let spin = |degrees: f32, translation: Vec3| {
            Mat4::from_translation(translation)
                * Mat4::from_rotation_y(degrees.to_radians())
                * Mat4::from_scale(Vec3::splat(0.5))
        };
        let placements = [
            Mat4::from_scale(Vec3::splat(0.5)),
            spin(135.0, Vec3::new(1.0, 0.0, -1.0)),
            spin(-135.0, Vec3::new(-1.0, 0.0, -1.0)),
            spin(45.0, Vec3::new(1.0, 0.0, 1.0)),
            spin(-45.0, Vec3::new(-1.0, 0.0, 1.0)),
            spin(-45.0, Vec3::new(-2.0, 0.0, -2.0)),
            spin(-45.0, Vec3::new(-2.0, 0.0, 2.0)),
            spin(-45.0, Vec3::new(2.0, 0.0, 2.0)),
            spin(-45.0, Vec3::new(2.0, 0.0, -2.0)),
        ];

        let (tet_mesh, tet_blas) = tetrahedron;
        let (plane_mesh, plane_blas) = plane;
        let mut instances = Vec::with_capacity(placements.len() + 1);
        for transform in placements {
            instances.push(SceneInstance {
                mesh: tet_mesh,
                blas_index: tet_blas,
                transform,
                sbt_offset: 0,
            });
        }
        instances.push(SceneInstance {
            mesh: plane_mesh,
            blas_index: plane_blas,
            transform: Mat4::from_translation(Vec3::new(0.0, -0.8, 0.0))
                * Mat4::from_scale(Vec3::splat(1000.0)),
            sbt_offset: 0,
        });
        for (index, instance) in instances.iter_mut().enumerate() {
            instance.sbt_offset = index as u32 * RAY_TYPE_COUNT;
        }
        Self { instances, time: 0 }
    }

    pub fn instances(&self) -> &[SceneInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    /// Advance the per-frame time counter. Only the first instance is
    /// animated: it spins around Y and bobs vertically; every other entry
    /// keeps its transform.
    pub fn advance(&mut self) {
        self.time += 1;
        if let Some(first) = self.instances.first_mut() {
            first.transform = Self::animated_transform(self.time);
        }
    }

    fn animated_transform(time: u32) -> Mat4 {
        let t = time as f32;
        Mat4::from_translation(Vec3::new(0.0, 0.1 * (t / 20.0).cos(), 0.0))
            * Mat4::from_rotation_y(t / 50.0)
            * Mat4::from_scale(Vec3::splat(0.5))
    }

    /// Object-to-world matrices in instance order, as written into the
    /// per-instance GPU buffer each frame.
    pub fn transforms(&self) -> Vec<Mat4> {
        self.instances.iter().map(|i| i.transform).collect()
    }

    /// The per-instance tuples fed to the top-level build, with bottom-level
    /// references resolved to device addresses.
    pub fn tlas_instances(&self, blas_addresses: &[u64]) -> Vec<crate::TlasInstance> {
        self.instances
            .iter()
            .map(|instance| crate::TlasInstance {
                blas_address: blas_addresses[instance.blas_index],
                transform: instance.transform,
                sbt_offset: instance.sbt_offset,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_scene() -> SceneInstances {
        SceneInstances::demo((MeshHandle::for_test(0), 0), (MeshHandle::for_test(1), 1))
    }

    #[test]
    fn demo_scene_has_ten_instances() {
        let scene = demo_scene();
        assert_eq!(scene.len(), 10);
        assert_eq!(
            scene.len() as u32 * RAY_TYPE_COUNT,
            30,
            "hit-group records for the demo scene"
        );
    }

    #[test]
    fn sbt_offsets_follow_instance_order() {
        let scene = demo_scene();
        for (index, instance) in scene.instances().iter().enumerate() {
            assert_eq!(instance.sbt_offset, index as u32 * RAY_TYPE_COUNT);
        }
    }

    #[test]
    fn advance_touches_only_the_first_instance() {
        let mut scene = demo_scene();
        let before = scene.transforms();
        scene.advance();
        let after = scene.transforms();
        assert_ne!(before[0], after[0]);
        for index in 1..before.len() {
            assert_eq!(before[index], after[index]);
        }
        assert_eq!(scene.time(), 1);
    }

    #[test]
    fn animation_is_a_function_of_time() {
        let mut a = demo_scene();
        let mut b = demo_scene();
        for _ in 0..7 {
            a.advance();
            b.advance();
        }
        assert_eq!(a.transforms()[0], b.transforms()[0]);
    }

    #[test]
    fn instance_colors_are_reproducible() {
        let mut rng_a = nanorand::WyRand::new_seed(73);
        let mut rng_b = nanorand::WyRand::new_seed(73);
        let colors_a = generate_instance_colors(10, &mut rng_a);
        let colors_b = generate_instance_colors(10, &mut rng_b);
        assert_eq!(colors_a, colors_b);
        for colors in colors_a {
            for channel in colors.a.iter().chain(&colors.b).chain(&colors.c) {
                assert!((0.0..=1.0).contains(channel));
            }
        }
    }

    #[test]
    fn camera_block_is_four_matrices() {
        assert_eq!(std::mem::size_of::<CameraMatrices>(), 4 * 64);
        let camera = Camera::looking_at(Vec3::new(3.0, 3.0, 3.0), Vec3::ZERO, 16.0 / 9.0);
        let matrices = camera.matrices();
        let roundtrip = (matrices.view * matrices.view_inverse).to_cols_array();
        for (value, expected) in roundtrip.iter().zip(Mat4::IDENTITY.to_cols_array()) {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn tlas_instances_resolve_blas_addresses() {
        let scene = demo_scene();
        let instances = scene.tlas_instances(&[0xAAAA, 0xBBBB]);
        assert_eq!(instances.len(), 10);
        for instance in &instances[..9] {
            assert_eq!(instance.blas_address, 0xAAAA);
        }
        assert_eq!(instances[9].blas_address, 0xBBBB);
    }
}
