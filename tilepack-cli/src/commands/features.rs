//! `tilepack features` - stream a feature table's rows.

use std::path::PathBuf;

use clap::Args;
use tilepack::PackageClient;

use super::common::connect;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct FeaturesArgs {
    /// Package file to open
    pub file: PathBuf,

    /// Feature table name
    #[arg(long)]
    pub table: String,
}

pub async fn run(args: FeaturesArgs, ipc: bool) -> Result<(), CliError> {
    let (bus, runtime) = connect(ipc).await?;
    let client = PackageClient::new(bus, "cli");

    client.open_path(&args.file).await?;
    let features = client.features(&args.table).await?;

    for feature in &features {
        println!(
            "{}",
            serde_json::to_string(feature).map_err(|e| CliError::InvalidArgs(e.to_string()))?
        );
    }
    eprintln!("{} features from '{}'", features.len(), args.table);

    client.close()?;
    runtime.shutdown().await;
    Ok(())
}
