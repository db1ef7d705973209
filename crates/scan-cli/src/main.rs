//! Command-line surface comparison for 3D scans.
//!
//! Loads an as-built scan and a reference mesh, runs the alignment and
//! defect-detection pipeline, and prints a per-direction defect report.
//!
//! ```text
//! scan-compare as_built.stl reference.ply --tolerance 0.5
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scan_compare::{
    compare_with_progress, extremal_pair, sample_surface, CompareParams, ComparisonResult,
    DefectCluster, FeatureParams, Mesh, RefineParams,
};

#[derive(Parser)]
#[command(
    name = "scan-compare",
    version,
    about = "Compare two 3D surface scans and report geometric defects",
    long_about = "Compares an as-built object scan against a reference design. The surfaces \
                  are aligned automatically (coarse feature registration followed by \
                  probabilistic refinement); divergent regions are clustered into discrete \
                  defects with bounding spheres. Accepts STL, OBJ, and PLY meshes."
)]
struct Cli {
    /// Path to the as-built scan (source).
    source: PathBuf,

    /// Path to the reference design (target).
    target: PathBuf,

    /// Divergence tolerance in target units; defaults to 1% of the
    /// reference diameter.
    #[arg(short = 't', long)]
    tolerance: Option<f64>,

    /// Surface sample count used for alignment.
    #[arg(long, default_value_t = 2000)]
    samples: usize,

    /// Surface sample count used for divergence measurement.
    #[arg(long, default_value_t = 6000)]
    dense_samples: usize,

    /// Refinement iteration cap.
    #[arg(long, default_value_t = 60)]
    max_iterations: usize,

    /// Coarse registration consensus iteration cap.
    #[arg(long, default_value_t = 64)]
    feature_iterations: usize,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let source = Mesh::load(&cli.source)
        .with_context(|| format!("loading source mesh {}", cli.source.display()))?;
    let target = Mesh::load(&cli.target)
        .with_context(|| format!("loading target mesh {}", cli.target.display()))?;

    println!(
        "{} {} ({} vertices) vs {} ({} vertices)",
        "Comparing".bold(),
        cli.source.display(),
        source.vertex_count(),
        cli.target.display(),
        target.vertex_count()
    );

    let tolerance = match cli.tolerance {
        Some(t) => t,
        None => {
            let t = default_tolerance(&target)?;
            println!("  using automatic tolerance {:.4}", t);
            t
        }
    };

    let params = CompareParams::default()
        .with_alignment_samples(cli.samples)
        .with_divergence_samples(cli.dense_samples)
        .with_refine(RefineParams::default().with_max_iterations(cli.max_iterations))
        .with_features(FeatureParams::default().with_max_iterations(cli.feature_iterations));

    let mut hook = |iteration: usize, _: &[nalgebra::Point3<f64>], max: usize| {
        let pct = ((iteration + 1) * 100) / max;
        eprint!("\r  refining alignment: {:>3}%", pct);
    };

    let result = compare_with_progress(&source, &target, tolerance, &params, Some(&mut hook))
        .context("surface comparison failed")?;
    eprintln!();

    report(&result, tolerance);

    if !result.forward_clusters.is_empty() || !result.backward_clusters.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scan_compare={default_level}")));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Automatic tolerance: 1% of the reference diameter.
fn default_tolerance(target: &Mesh) -> Result<f64> {
    let samples = sample_surface(target, 500).context("sampling reference for tolerance")?;
    let (a, b) = extremal_pair(&samples.points).context("measuring reference diameter")?;
    Ok((b - a).norm() * 0.01)
}

fn report(result: &ComparisonResult, tolerance: f64) {
    if !result.refine_converged {
        println!(
            "{} refinement stopped at {} iterations without converging; results are best-effort",
            "warning:".yellow().bold(),
            result.refine_iterations
        );
    }

    println!(
        "  alignment: scale {:.4}, {} refinement iterations",
        result.transform.scale, result.refine_iterations
    );
    println!(
        "  divergence > {:.4}: {} source points, {} target points",
        tolerance,
        result.forward_field.iter().filter(|&&d| d > tolerance).count(),
        result.backward_field.iter().filter(|&&d| d > tolerance).count(),
    );

    print_clusters("Added surface defects", &result.forward_clusters);
    print_clusters("Missing surface defects", &result.backward_clusters);

    if result.forward_clusters.is_empty() && result.backward_clusters.is_empty() {
        println!("{}", "No defects detected".green().bold());
    }
}

fn print_clusters(label: &str, clusters: &[DefectCluster]) {
    if clusters.is_empty() {
        println!("{}: {}", label.bold(), "none".green());
        return;
    }

    println!("{}: {}", label.bold(), clusters.len().to_string().red());
    for (i, cluster) in clusters.iter().enumerate() {
        println!(
            "  #{:<2} {} points, center ({:.2}, {:.2}, {:.2}), radius {:.3}",
            i + 1,
            cluster.len(),
            cluster.center.x,
            cluster.center.y,
            cluster.center.z,
            cluster.radius
        );
    }
}
