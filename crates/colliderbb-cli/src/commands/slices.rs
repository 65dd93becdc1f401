use crate::cli::SlicesArgs;
use crate::error::{CliError, Result};
use colliderbb::core::slicing::indexed_z_centroids;
use tracing::info;

fn render(centroids: &[(i32, f64)], indexed: bool) -> Vec<String> {
    centroids
        .iter()
        .map(|(index, z)| {
            if indexed {
                format!("{:>4} {:.15e}", index, z)
            } else {
                format!("{:.15e}", z)
            }
        })
        .collect()
}

pub fn run(args: SlicesArgs) -> Result<()> {
    info!(
        num_slices = args.num_slices,
        sigma_z = args.sigma_z,
        "Computing slice centroids."
    );
    let centroids = indexed_z_centroids(args.num_slices, args.sigma_z)
        .map_err(|e| CliError::Argument(e.to_string()))?;
    for line in render(&centroids, args.indexed) {
        println!("{}", line);
    }
    Ok(())
}
