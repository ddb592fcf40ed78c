//! `tilepack list` - list the tables in a package.

use std::path::PathBuf;

use clap::Args;
use tilepack::catalog::TableDescriptor;
use tilepack::PackageClient;

use super::common::connect;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Package file to open
    pub file: PathBuf,

    /// Print descriptors as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ListArgs, ipc: bool) -> Result<(), CliError> {
    let (bus, runtime) = connect(ipc).await?;
    let client = PackageClient::new(bus, "cli");

    client.open_path(&args.file).await?;
    let tables = client.list_tables().await?;
    client.close()?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&tables)
                .map_err(|e| CliError::InvalidArgs(e.to_string()))?
        );
    } else {
        for table in &tables {
            match table {
                TableDescriptor::Tile(tile) => {
                    println!(
                        "tile     {}  zoom {}..{}  ({} levels)",
                        tile.title,
                        tile.min_zoom,
                        tile.max_zoom,
                        tile.resolutions.len()
                    );
                    if let Some(projection) = &tile.extent_projection {
                        if let Some(extent) = tile.extent {
                            println!(
                                "         extent [{}, {}, {}, {}] ({})",
                                extent[0], extent[1], extent[2], extent[3], projection
                            );
                        }
                    }
                }
                TableDescriptor::Feature(feature) => {
                    println!(
                        "feature  {}  {} columns{}",
                        feature.title,
                        feature.columns.len(),
                        if feature.has_geometry {
                            ", geometry"
                        } else {
                            ""
                        }
                    );
                    for column in &feature.columns {
                        println!("         {} ({})", column.name, column.column_type.as_str());
                    }
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
