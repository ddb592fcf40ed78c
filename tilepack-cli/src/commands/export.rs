//! `tilepack export` - export features from one package into a new one.

use std::path::PathBuf;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tilepack::package::ColumnValue;
use tilepack::{ExportItem, ExportOptions, Exporter, PackageClient, TimeSpan};

use super::common::connect;
use crate::error::CliError;

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Source package file
    pub file: PathBuf,

    /// Feature tables to export; all of them when omitted
    #[arg(long)]
    pub table: Vec<String>,

    /// Where to write the exported package
    #[arg(long)]
    pub out: PathBuf,
}

pub async fn run(args: ExportArgs, ipc: bool) -> Result<(), CliError> {
    let (bus, runtime) = connect(ipc).await?;
    let client = PackageClient::new(bus.clone(), "export-source");

    client.open_path(&args.file).await?;

    let tables = if args.table.is_empty() {
        client
            .list_tables()
            .await?
            .iter()
            .filter_map(|t| match t {
                tilepack::catalog::TableDescriptor::Feature(f) => Some(f.table_name.clone()),
                _ => None,
            })
            .collect()
    } else {
        args.table.clone()
    };

    if tables.is_empty() {
        return Err(CliError::InvalidArgs(
            "the source package has no feature tables to export".to_string(),
        ));
    }

    // Buffer every table's features, tagged with their destination table.
    let mut items = Vec::new();
    for table in &tables {
        for feature in client.features(table).await? {
            let time = match feature.properties.get("TIME_START") {
                Some(ColumnValue::DateTime(start)) => Some(TimeSpan {
                    start: *start,
                    stop: match feature.properties.get("TIME_STOP") {
                        Some(ColumnValue::DateTime(stop)) => Some(*stop),
                        _ => None,
                    },
                }),
                _ => None,
            };

            items.push(ExportItem {
                table: table.clone(),
                feature,
                time,
            });
        }
    }
    client.close()?;

    let bar = ProgressBar::new(items.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} features")
            .expect("static progress template is valid"),
    );

    let mut exporter = Exporter::new(bus);
    let bytes = exporter
        .run(items, ExportOptions::default(), |progress| {
            bar.set_position(progress.exported)
        })
        .await?;
    bar.finish();

    std::fs::write(&args.out, &bytes)?;
    println!(
        "exported {} table(s) to {} ({} bytes)",
        tables.len(),
        args.out.display(),
        bytes.len()
    );

    runtime.shutdown().await;
    Ok(())
}
