//! Surface extraction: marching cubes over every allocated block.
//!
//! A cell is the cube between eight neighbouring voxel centers and belongs
//! to the block holding its minimum corner, so every lattice cell is
//! visited once. Corners past the block's upper faces are read from the
//! neighbouring blocks through the directory; a cell with any corner in
//! an unallocated block, or any corner not observed enough, is skipped.
//!
//! Vertices are shared across cells and blocks by keying them on the
//! lattice edge they sit on.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Mat3, Mat4, Vec3};
use rayon::prelude::*;

use crate::core::config::VolumeConfig;
use crate::core::error::Error;
use crate::math::Aabb;
use crate::voxel::block::{BlockKey, BLOCK_SIZE};
use crate::voxel::directory::BlockHashDirectory;
use crate::voxel::pool::VoxelBlockPool;
use crate::voxel::voxel::Voxel;
use super::sampler::VoxelSampler;
use super::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, EDGE_TABLE, TRI_TABLE};

/// Mesh vertex, laid out for direct upload to a vertex buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Linear RGB in [0, 1]
    pub color: [f32; 3],
}

/// Indexed triangle mesh in world coordinates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    /// Triangle list, three indices per triangle
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Bounding box of all vertex positions
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from(v.position)))
    }
}

/// Counters from one extraction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub blocks: usize,
    /// Cells with a corner in an unallocated block or under-observed
    pub skipped_cells: usize,
    /// Cells with non-finite corner values
    pub degenerate_cells: usize,
    pub vertices: usize,
    pub triangles: usize,
}

/// Lattice edge: its lower voxel and axis
type EdgeId = (IVec3, u8);

struct EdgeVertex {
    edge: EdgeId,
    /// Volume frame
    position: Vec3,
    /// Volume frame, unit length; None when the field gradient is undefined
    normal: Option<Vec3>,
    color: Vec3,
}

#[derive(Default)]
struct BlockSurface {
    vertices: Vec<EdgeVertex>,
    triangles: Vec<[u32; 3]>,
    skipped_cells: usize,
    degenerate_cells: usize,
}

/// Extract the iso-surface of every allocated block.
pub fn extract_mesh(
    directory: &BlockHashDirectory,
    pool: &VoxelBlockPool,
    volume_origin: &Mat4,
    config: &VolumeConfig,
) -> (Mesh, MeshStats) {
    let mut blocks = directory.entries();
    blocks.par_sort_unstable_by_key(|(key, _)| key.morton());

    let surfaces: Vec<BlockSurface> = blocks
        .par_iter()
        .map_init(
            || VoxelSampler::new(directory, pool, config.voxel_size),
            |sampler, &(key, _)| polygonize_block(sampler, key, config),
        )
        .collect();

    let (mesh, mut stats) = merge_surfaces(surfaces, volume_origin);
    stats.blocks = blocks.len();
    (mesh, stats)
}

fn polygonize_block(sampler: &mut VoxelSampler, key: BlockKey, config: &VolumeConfig) -> BlockSurface {
    let mut surface = BlockSurface::default();
    let mut local: HashMap<EdgeId, u32> = HashMap::new();
    let first = key.first_voxel();
    let n = BLOCK_SIZE as i32;

    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let base = first + IVec3::new(x, y, z);
                polygonize_cell(sampler, base, config, &mut surface, &mut local);
            }
        }
    }
    surface
}

fn polygonize_cell(
    sampler: &mut VoxelSampler,
    base: IVec3,
    config: &VolumeConfig,
    surface: &mut BlockSurface,
    local: &mut HashMap<EdgeId, u32>,
) {
    let mut corners = [Voxel::EMPTY; 8];
    for (i, corner) in corners.iter_mut().enumerate() {
        let [dx, dy, dz] = CORNER_OFFSETS[i];
        match sampler.voxel(base + IVec3::new(dx, dy, dz)) {
            Some(voxel) if voxel.weight > config.min_mesh_weight => *corner = *voxel,
            _ => {
                surface.skipped_cells += 1;
                return;
            }
        }
    }

    if corners.iter().any(|c| !c.tsdf.is_finite()) {
        log::trace!("Skipping cell: {}", Error::DegenerateGeometry(base));
        surface.degenerate_cells += 1;
        return;
    }

    let mut case = 0usize;
    for (i, corner) in corners.iter().enumerate() {
        if corner.tsdf < config.iso_level {
            case |= 1 << i;
        }
    }
    let crossed = EDGE_TABLE[case];
    if crossed == 0 {
        return;
    }

    let mut edge_vertices = [0u32; 12];
    for (edge, [a, b]) in EDGE_CONNECTIONS.iter().copied().enumerate() {
        if crossed & (1 << edge) == 0 {
            continue;
        }
        let ga = base + IVec3::from(CORNER_OFFSETS[a]);
        let gb = base + IVec3::from(CORNER_OFFSETS[b]);
        // Interpolate from the lower lattice corner so both cells sharing
        // the edge compute the same point
        let (lo, hi, glo) = if ga.cmple(gb).all() { (a, b, ga) } else { (b, a, gb) };
        let axis = (gb - ga).abs().to_array().iter().position(|&d| d != 0).unwrap_or(0) as u8;
        let id = (glo, axis);

        edge_vertices[edge] = *local.entry(id).or_insert_with(|| {
            let vertex = edge_vertex(sampler, id, &corners[lo], &corners[hi], config);
            surface.vertices.push(vertex);
            (surface.vertices.len() - 1) as u32
        });
    }

    for tri in TRI_TABLE[case].chunks_exact(3) {
        if tri[0] < 0 {
            break;
        }
        // Table winding faces the negative side; flip so faces point out
        surface.triangles.push([
            edge_vertices[tri[0] as usize],
            edge_vertices[tri[2] as usize],
            edge_vertices[tri[1] as usize],
        ]);
    }
}

fn edge_vertex(
    sampler: &mut VoxelSampler,
    edge: EdgeId,
    lo: &Voxel,
    hi: &Voxel,
    config: &VolumeConfig,
) -> EdgeVertex {
    let (g, axis) = edge;
    let mut step = IVec3::ZERO;
    step[axis as usize] = 1;

    let delta = hi.tsdf - lo.tsdf;
    let t = if delta.abs() < 1e-6 {
        0.5
    } else {
        ((config.iso_level - lo.tsdf) / delta).clamp(0.0, 1.0)
    };

    let p0 = sampler.voxel_center(g);
    let p1 = sampler.voxel_center(g + step);
    let position = p0.lerp(p1, t);
    let normal = sampler
        .gradient(position)
        .map(Vec3::normalize_or_zero)
        .filter(|n| *n != Vec3::ZERO);
    let c0 = Vec3::from_array(lo.color.map(|c| c as f32)) / 255.0;
    let c1 = Vec3::from_array(hi.color.map(|c| c as f32)) / 255.0;

    EdgeVertex {
        edge,
        position,
        normal,
        color: c0.lerp(c1, t),
    }
}

/// Stitch block surfaces into one mesh, sharing vertices on common edges.
fn merge_surfaces(surfaces: Vec<BlockSurface>, volume_origin: &Mat4) -> (Mesh, MeshStats) {
    let rotation = Mat3::from_mat4(*volume_origin);
    let mut stats = MeshStats::default();
    let mut mesh = Mesh::new();
    let mut global: HashMap<EdgeId, u32> = HashMap::new();
    let mut needs_face_normal: Vec<bool> = Vec::new();

    for surface in surfaces {
        stats.skipped_cells += surface.skipped_cells;
        stats.degenerate_cells += surface.degenerate_cells;

        let remap: Vec<u32> = surface
            .vertices
            .iter()
            .map(|v| {
                *global.entry(v.edge).or_insert_with(|| {
                    let normal = v.normal.map_or(Vec3::ZERO, |n| (rotation * n).normalize_or_zero());
                    mesh.vertices.push(MeshVertex {
                        position: volume_origin.transform_point3(v.position).to_array(),
                        normal: normal.to_array(),
                        color: v.color.to_array(),
                    });
                    needs_face_normal.push(v.normal.is_none());
                    (mesh.vertices.len() - 1) as u32
                })
            })
            .collect();

        for tri in &surface.triangles {
            mesh.indices.extend(tri.iter().map(|&i| remap[i as usize]));
        }
    }

    if needs_face_normal.iter().any(|&b| b) {
        apply_face_normals(&mut mesh, &needs_face_normal);
    }

    stats.vertices = mesh.vertex_count();
    stats.triangles = mesh.triangle_count();
    (mesh, stats)
}

/// Area-weighted face normals for vertices without a field gradient
fn apply_face_normals(mesh: &mut Mesh, needs: &[bool]) {
    let mut accumulated = vec![Vec3::ZERO; mesh.vertices.len()];
    for tri in mesh.indices.chunks_exact(3) {
        let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(mesh.vertices[i as usize].position));
        let face = (b - a).cross(c - a);
        for &i in tri {
            accumulated[i as usize] += face;
        }
    }
    for (i, vertex) in mesh.vertices.iter_mut().enumerate() {
        if needs[i] {
            vertex.normal = accumulated[i].normalize_or_zero().to_array();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const VOXEL: f32 = 0.02;

    fn config() -> VolumeConfig {
        VolumeConfig::with_voxel_size(VOXEL)
    }

    /// Allocate `range³` blocks and fill every voxel from an analytic
    /// signed distance (meters, positive outside)
    fn filled_volume(
        config: &VolumeConfig,
        range: std::ops::Range<i32>,
        sdf: impl Fn(Vec3) -> f32,
    ) -> (BlockHashDirectory, VoxelBlockPool) {
        let dir = BlockHashDirectory::new(128, 4, 8, 128);
        let mut pool = VoxelBlockPool::new(128, 1 << 30).unwrap();
        let mu = config.sdf_trunc;
        for bz in range.clone() {
            for by in range.clone() {
                for bx in range.clone() {
                    let key = BlockKey::new(bx, by, bz);
                    let slot = dir.insert(key, &pool).unwrap().slot();
                    let first = key.first_voxel();
                    let block = pool.block_mut(slot);
                    for (i, voxel) in block.voxels.iter_mut().enumerate() {
                        let (x, y, z) = crate::voxel::block::local_coords(i);
                        let g = first + IVec3::new(x as i32, y as i32, z as i32);
                        let p = (g.as_vec3() + 0.5) * VOXEL;
                        *voxel = Voxel::new(sdf(p).clamp(-mu, mu) / mu, 1.0, [255, 0, 0]);
                    }
                }
            }
        }
        (dir, pool)
    }

    fn sphere(center: Vec3, radius: f32) -> impl Fn(Vec3) -> f32 {
        move |p| p.distance(center) - radius
    }

    #[test]
    fn test_sphere_mesh_is_closed_and_on_surface() {
        let config = config();
        let center = Vec3::splat(0.16);
        let radius = 0.101;
        let (dir, pool) = filled_volume(&config, 0..2, sphere(center, radius));

        let (mesh, stats) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        assert!(mesh.triangle_count() > 100);
        assert_eq!(stats.blocks, 8);
        assert_eq!(stats.degenerate_cells, 0);

        for v in &mesh.vertices {
            let p = Vec3::from(v.position);
            assert!((p.distance(center) - radius).abs() < VOXEL, "vertex {:?} off the sphere", p);
            // Outward normal
            let n = Vec3::from(v.normal);
            assert!(n.dot((p - center).normalize()) > 0.9);
            assert!((v.color[0] - 1.0).abs() < 1e-5 && v.color[1] == 0.0 && v.color[2] == 0.0);
        }

        // Closed surface: every edge shared by exactly two triangles
        let mut edges: HashMap<(u32, u32), usize> = HashMap::new();
        for tri in mesh.indices.chunks_exact(3) {
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                *edges.entry((a.min(b), a.max(b))).or_default() += 1;
            }
        }
        assert!(edges.values().all(|&count| count == 2));
    }

    #[test]
    fn test_triangles_face_outward() {
        let config = config();
        let center = Vec3::splat(0.16);
        let (dir, pool) = filled_volume(&config, 0..2, sphere(center, 0.101));
        let (mesh, _) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);

        let mut faces = 0;
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| &mesh.vertices[i as usize]);
            let [pa, pb, pc] = [a, b, c].map(|v| Vec3::from(v.position));
            let face = (pb - pa).cross(pc - pa);
            if face.length() < 1e-10 {
                continue;
            }
            faces += 1;
            let normal = Vec3::from(a.normal) + Vec3::from(b.normal) + Vec3::from(c.normal);
            assert!(face.dot(normal) > 0.0, "triangle {:?} wound against its normals", tri);
            assert!(face.dot((pa + pb + pc) / 3.0 - center) > 0.0);
        }
        assert!(faces > 100);
    }

    #[test]
    fn test_face_normal_fallback_points_out() {
        // Plane z = 0.081, positive above: outward is +z
        let config = config();
        let (dir, pool) = filled_volume(&config, 0..1, |p| p.z - 0.081);
        let (mut mesh, _) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        let needs = vec![true; mesh.vertices.len()];
        apply_face_normals(&mut mesh, &needs);
        for v in &mesh.vertices {
            assert!(Vec3::from(v.normal).dot(Vec3::Z) > 0.99);
        }
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let config = config();
        let (dir, pool) = filled_volume(&config, 0..2, sphere(Vec3::splat(0.15), 0.09));
        let (a, _) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        let (b, _) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_origin_moves_mesh_to_world() {
        let config = config();
        let (dir, pool) = filled_volume(&config, 0..2, sphere(Vec3::splat(0.16), 0.08));
        let origin = Mat4::from_translation(Vec3::new(5.0, 0.0, -2.0));
        let (local, _) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        let (world, _) = extract_mesh(&dir, &pool, &origin, &config);
        let shift = world.bounds().unwrap().center() - local.bounds().unwrap().center();
        assert!((shift - Vec3::new(5.0, 0.0, -2.0)).length() < 1e-4);
    }

    #[test]
    fn test_cells_at_unallocated_border_are_skipped() {
        let config = config();
        // Plane z = 0.08 crossing a single block
        let (dir, pool) = filled_volume(&config, 0..1, |p| p.z - 0.081);
        let (mesh, stats) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        // Cells reaching x, y or z = 8 have no neighbour block
        assert_eq!(stats.skipped_cells, 512 - 343);
        // 7x7 interior cells cut by the plane, two triangles each
        assert_eq!(mesh.triangle_count(), 2 * 7 * 7);
    }

    #[test]
    fn test_non_finite_cells_are_counted_not_fatal() {
        let config = config();
        let (dir, mut pool) = filled_volume(&config, 0..1, |p| p.z - 0.081);
        let slot = dir.find(BlockKey::new(0, 0, 0)).unwrap();
        pool.block_mut(slot).get_mut(3, 3, 3).tsdf = f32::NAN;

        let (mesh, stats) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        // Eight cells share the poisoned corner
        assert_eq!(stats.degenerate_cells, 8);
        assert!(!mesh.is_empty());
    }

    #[test]
    fn test_unobserved_corners_produce_nothing() {
        let config = config();
        let dir = BlockHashDirectory::new(8, 2, 2, 8);
        let pool = VoxelBlockPool::new(2, 1 << 30).unwrap();
        dir.insert(BlockKey::new(0, 0, 0), &pool).unwrap();
        let (mesh, stats) = extract_mesh(&dir, &pool, &Mat4::IDENTITY, &config);
        assert!(mesh.is_empty());
        assert_eq!(stats.skipped_cells, 512);
    }

    #[test]
    fn test_vertex_bytes_layout() {
        let mesh = Mesh {
            vertices: vec![MeshVertex::default(); 3],
            indices: vec![0, 1, 2],
        };
        assert_eq!(mesh.vertex_bytes().len(), 3 * 36);
        assert_eq!(mesh.index_bytes().len(), 12);
    }
}
