//! `tilepack demo` - write a small sample package for experimentation.

use std::path::PathBuf;

use clap::Args;
use tilepack::catalog::ColumnType;
use tilepack::package::{
    ColumnValue, Contents, FeatureColumn, FeatureRecord, Geometry, SpatialRef,
};
use tilepack::MemoryPackage;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Where to write the sample package
    #[arg(long, default_value = "demo.tilepack")]
    pub out: PathBuf,
}

pub fn run(args: DemoArgs) -> Result<(), CliError> {
    let bytes = MemoryPackage::builder()
        .tile_table(
            "imagery",
            [-180.0, -90.0, 180.0, 90.0],
            Some(SpatialRef {
                organization: "epsg".to_string(),
                coordsys_id: Some(4326),
                id: 4326,
            }),
            Some(Contents {
                identifier: Some("Demo Imagery".to_string()),
                description: Some("Generated sample layer".to_string()),
            }),
        )
        .tile_level(
            "imagery",
            2,
            256,
            256,
            MemoryPackage::solid_png(128, 64, [30, 90, 160, 255]),
        )
        .tile_level(
            "imagery",
            5,
            256,
            256,
            MemoryPackage::solid_png(512, 256, [50, 130, 90, 255]),
        )
        .feature_table(
            "sightings",
            vec![
                FeatureColumn {
                    name: "name".to_string(),
                    display_name: None,
                    column_type: ColumnType::Text,
                },
                FeatureColumn {
                    name: "TIME_START".to_string(),
                    display_name: None,
                    column_type: ColumnType::DateTime,
                },
            ],
            true,
            None,
        )
        .feature(
            "sightings",
            FeatureRecord::with_geometry(Geometry::Point([-0.1278, 51.5074]))
                .property("name", ColumnValue::Text("london".to_string()))
                .property("TIME_START", ColumnValue::DateTime(1_700_000_000_000)),
        )
        .feature(
            "sightings",
            FeatureRecord::with_geometry(Geometry::Point([-74.0060, 40.7128]))
                .property("name", ColumnValue::Text("new york".to_string()))
                .property("TIME_START", ColumnValue::DateTime(1_700_000_360_000)),
        )
        .build_bytes();

    std::fs::write(&args.out, &bytes)?;
    println!("wrote sample package to {}", args.out.display());
    Ok(())
}
