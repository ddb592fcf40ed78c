//! `tilepack tile` - fetch one rendered tile from a package.

use std::path::PathBuf;

use clap::Args;
use tilepack::{PackageClient, TileFetch, TileFetcher, TileResult};

use super::common::{connect, parse_extent};
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct TileArgs {
    /// Package file to open
    pub file: PathBuf,

    /// Tile table name
    #[arg(long)]
    pub table: String,

    /// Display zoom level
    #[arg(long)]
    pub zoom: u8,

    /// Extent as 'west,south,east,north' in EPSG:4326
    #[arg(long)]
    pub extent: String,

    /// Output width in pixels
    #[arg(long, default_value_t = 256)]
    pub width: u32,

    /// Output height in pixels
    #[arg(long, default_value_t = 256)]
    pub height: u32,

    /// Where to write the tile image
    #[arg(long, default_value = "tile.png")]
    pub out: PathBuf,
}

pub async fn run(args: TileArgs, ipc: bool) -> Result<(), CliError> {
    let extent = parse_extent(&args.extent)?;

    let (bus, runtime) = connect(ipc).await?;
    let client = PackageClient::new(bus.clone(), "cli");

    client.open_path(&args.file).await?;
    // Listing registers the table's scaling policy worker-side, widening
    // the zoom range tiles can be synthesized for.
    client.list_tables().await?;

    let fetcher = TileFetcher::new(bus, "cli");
    let result = fetcher
        .fetch(TileFetch {
            table: args.table.clone(),
            zoom: args.zoom,
            extent,
            width: args.width,
            height: args.height,
            projection: None,
            coord: None,
        })
        .await?;

    match result {
        TileResult::Image(bytes) => {
            std::fs::write(&args.out, &bytes)?;
            println!(
                "wrote {} ({} bytes) from table '{}' at zoom {}",
                args.out.display(),
                bytes.len(),
                args.table,
                args.zoom
            );
        }
        TileResult::Empty => {
            println!(
                "no data in table '{}' at zoom {} for that extent (blank tile)",
                args.table, args.zoom
            );
        }
    }

    client.close()?;
    runtime.shutdown().await;
    Ok(())
}
