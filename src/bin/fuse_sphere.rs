//! Fuses a synthetic sphere seen from an orbit of cameras, then ray-casts
//! and meshes the result.
//!
//! Usage: cargo run --release --bin fuse_sphere -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>       Volume config JSON (default: built-in)
//!   --save-config <PATH>  Write the effective config and exit
//!   --voxel <METERS>      Voxel size, mu = 3 voxels (default: 0.01)
//!   --radius <METERS>     Sphere radius (default: 0.25)
//!   --frames <N>          Cameras on the orbit (default: 24)
//!   --jobs <N>            Worker threads (default: all cores)

use std::process::ExitCode;
use std::time::Instant;

use glam::{Mat4, Vec3};

use rkfusion::core::logging;
use rkfusion::synthetic::{self, Sphere};
use rkfusion::{PinholeIntrinsics, Result, TsdfVolume, VolumeConfig};

fn main() -> ExitCode {
    logging::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => VolumeConfig::load(path)?,
        None => VolumeConfig::with_voxel_size(0.01).max_blocks(20_000),
    };
    if let Some(voxel) = parse_f32_arg(&args, "--voxel") {
        config.voxel_size = voxel;
        config.sdf_trunc = 3.0 * voxel;
    }
    if let Some(path) = parse_str_arg(&args, "--save-config") {
        config.validate()?;
        config.save(&path)?;
        println!("Wrote config to {}", path);
        return Ok(());
    }
    let radius = parse_f32_arg(&args, "--radius").unwrap_or(0.25);
    let frames = parse_usize_arg(&args, "--frames").unwrap_or(24).max(1);

    if let Some(jobs) = parse_usize_arg(&args, "--jobs") {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(jobs).build_global() {
            log::warn!("Could not configure thread pool: {}", e);
        }
    }

    println!("=== Rkfusion Sphere Demo ===");
    println!("Voxel:  {}m (mu {}m)", config.voxel_size, config.sdf_trunc);
    println!("Sphere: r = {}m", radius);
    println!("Frames: {}", frames);
    println!();

    let intrinsics = PinholeIntrinsics::prime_sense();
    let sphere = Sphere {
        center: Vec3::new(0.0, 0.0, 1.5),
        radius,
    };
    let mut volume = TsdfVolume::new(config, Mat4::IDENTITY)?;

    let start = Instant::now();
    let poses = synthetic::orbit_poses(sphere.center, 1.2, 0.3, frames);
    for (i, pose) in poses.iter().enumerate() {
        let frame = synthetic::render(&sphere, &intrinsics, pose);
        let stats = volume.integrate(&frame, &intrinsics, pose)?;
        println!(
            "  frame {:>3}: {:>5} blocks touched, {:>4} new, {:>8} voxels, {:.1}ms",
            i,
            stats.touched_blocks,
            stats.new_blocks,
            stats.updated_voxels,
            stats.elapsed.as_secs_f64() * 1000.0
        );
    }
    println!("Integrated {} frames in {:.2}s", frames, start.elapsed().as_secs_f64());

    let image = volume.ray_cast(&intrinsics, &poses[0])?;
    let errors: Vec<f32> = (0..intrinsics.height)
        .flat_map(|v| (0..intrinsics.width).map(move |u| (u, v)))
        .filter_map(|(u, v)| image.vertex_at(u, v))
        .map(|p| (p.distance(sphere.center) - sphere.radius).abs())
        .collect();
    let mean_error = errors.iter().sum::<f32>() / errors.len().max(1) as f32;
    println!(
        "Ray cast: {} hits, mean surface error {:.2}mm",
        errors.len(),
        mean_error * 1000.0
    );

    let (mesh, mesh_stats) = volume.extract_mesh_with_stats();
    println!(
        "Mesh: {} vertices, {} triangles ({} cells skipped)",
        mesh.vertex_count(),
        mesh.triangle_count(),
        mesh_stats.skipped_cells
    );

    let stats = volume.stats();
    println!();
    println!("Blocks:    {} allocated ({:.1}% of pool)", stats.allocated_blocks, stats.pool_utilization);
    println!("Directory: {:.1}% load, {} overflow nodes", stats.directory_load_factor * 100.0, stats.overflow_nodes_in_use);
    println!("Memory:    {}MB", stats.memory_bytes / 1024 / 1024);
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
