use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use nalgebra::Vector3;
use scanalign::{
    io::{read_cloud, write_cloud},
    pipeline::{prepare, register, PipelineConfig},
    viewpoint::Viewpoints,
    Error,
};

#[derive(Parser)]
#[clap(version, about = "Aligns an object scan to a scene scan without an initial guess")]
struct Args {
    /// Cloud to be moved (.ply or .pcd)
    #[clap(long)]
    object: PathBuf,
    /// Reference cloud (.ply or .pcd)
    #[clap(long)]
    scene: PathBuf,
    /// JSON file with the pipeline parameters
    #[clap(long)]
    config: Option<PathBuf>,
    /// Voxel size used to scale the default parameters. Ignored with --config
    #[clap(long)]
    voxel_size: Option<f32>,
    /// Scanner position of the object as x,y,z. Orients the object normals
    #[clap(long, value_parser = parse_vector)]
    object_viewpoint: Option<Vector3<f32>>,
    /// Scanner position of the scene as x,y,z. Orients the scene normals
    #[clap(long, value_parser = parse_vector)]
    scene_viewpoint: Option<Vector3<f32>>,
    /// Writes the loaded object moved into the scene frame
    #[clap(long)]
    output: Option<PathBuf>,
    /// Writes the scene followed by the aligned object. Both files need the same attributes
    #[clap(long)]
    merged: Option<PathBuf>,
}

fn parse_vector(value: &str) -> Result<Vector3<f32>, String> {
    let coords = value
        .split(',')
        .map(|c| c.trim().parse::<f32>().map_err(|err| format!("{c}: {err}")))
        .collect::<Result<Vec<f32>, String>>()?;
    match coords[..] {
        [x, y, z] => Ok(Vector3::new(x, y, z)),
        _ => Err(format!("expected x,y,z, got {value}")),
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let config = match (&args.config, args.voxel_size) {
        (Some(path), _) => PipelineConfig::from_json_file(path)?,
        (None, Some(voxel_size)) => PipelineConfig::for_voxel_size(voxel_size),
        (None, None) => PipelineConfig::default(),
    };

    let object_cloud = read_cloud(&args.object)?;
    let scene_cloud = read_cloud(&args.scene)?;
    info!(
        "Loaded {} object points and {} scene points",
        object_cloud.len(),
        scene_cloud.len()
    );

    let object_viewpoints = args
        .object_viewpoint
        .map(|origin| Viewpoints::single(origin, object_cloud.len()));
    let scene_viewpoints = args
        .scene_viewpoint
        .map(|origin| Viewpoints::single(origin, scene_cloud.len()));

    let object = prepare(object_cloud.clone(), &config, object_viewpoints.as_ref())?;
    let scene = prepare(scene_cloud.clone(), &config, scene_viewpoints.as_ref())?;
    let registration = register(&object, &scene, &config)?;

    println!("{}", registration.transform);
    println!("inlier fraction: {:.4}", registration.inlier_fraction);

    let aligned = registration.aligned(&object_cloud);
    if let Some(output) = &args.output {
        write_cloud(output, &aligned)?;
        info!("Aligned object written to {}", output.display());
    }
    if let Some(merged) = &args.merged {
        write_cloud(merged, &scene_cloud.merge(&aligned)?)?;
        info!("Scene and aligned object written to {}", merged.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
