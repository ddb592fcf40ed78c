//! Session and catalog command handlers.

use tracing::{debug, info};

use super::{HandlerResult, ReplySink, WorkerContext};
use crate::catalog::{
    fix_tile_sizes, ColumnDescriptor, FeatureTableDescriptor, TableDescriptor, TileSize,
    TileTableDescriptor,
};
use crate::package::{TileScaling, TileTableInfo};
use crate::protocol::{Envelope, ReplyData};

/// Worker bootstrap. Configures the scratch location for export artifacts
/// when one is supplied. No reply is sent.
pub(crate) fn open_library(
    ctx: &mut WorkerContext,
    env: &Envelope,
    _sink: &ReplySink,
) -> HandlerResult {
    if let Some(path) = &env.payload.path {
        debug!(path = %path.display(), "Using scratch directory from open-library");
        ctx.scratch_dir = path.clone();
    }
    Ok(())
}

/// Opens a package session from raw bytes or a path and registers it under
/// the envelope's correlation id. Any previous handle for the id is fully
/// released first.
pub(crate) fn open(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    if env.id.is_empty() {
        return Err("id must be set".into());
    }

    let package = if let Some(data) = &env.payload.data {
        ctx.library.open_bytes(data.clone())?
    } else if let Some(path) = &env.payload.path {
        ctx.library.open_path(path)?
    } else {
        return Err("data or path must be set".into());
    };

    info!(id = %env.id, "Opened package session");
    ctx.sessions.install(env.id.clone(), package);
    sink.success(env, None);
    Ok(())
}

/// Closes the session for the envelope's id. Idempotent; no reply is sent.
pub(crate) fn close(ctx: &mut WorkerContext, env: &Envelope, _sink: &ReplySink) -> HandlerResult {
    ctx.sessions.close(&env.id);
    Ok(())
}

/// Lists the package's tables as descriptors: tile tables first, then
/// feature tables. A scaling policy is created once per tile table so
/// later tile requests can range outside the native pyramid.
pub(crate) fn list_tables(
    ctx: &mut WorkerContext,
    env: &Envelope,
    sink: &ReplySink,
) -> HandlerResult {
    let WorkerContext {
        sessions,
        tile_scaling,
        ..
    } = ctx;

    let package = sessions.get(&env.id).ok_or("no open package for id")?;

    let mut descriptors = Vec::new();

    for table in package.tile_tables() {
        let info = package.tile_table_info(&table)?;

        // Allow requests from 4 levels below to 25 levels above the native
        // range; packages rarely define the pyramid a display expects.
        tile_scaling
            .entry(table.clone())
            .or_insert_with(TileScaling::standard);

        descriptors.push(TableDescriptor::Tile(tile_descriptor(&info)));
    }

    for table in package.feature_tables() {
        let info = package.feature_table_info(&table)?;

        let columns = info
            .columns
            .iter()
            .map(|col| ColumnDescriptor {
                name: col.surfaced_name().to_string(),
                column_type: col.column_type,
            })
            .collect();

        let (title, description) = titles(&info.contents, &info.table_name);

        descriptors.push(TableDescriptor::Feature(FeatureTableDescriptor {
            table_name: info.table_name,
            title,
            description,
            columns,
            has_geometry: info.has_geometry,
        }));
    }

    debug!(id = %env.id, tables = descriptors.len(), "Listed package tables");
    sink.success(env, Some(ReplyData::Tables(descriptors)));
    Ok(())
}

/// Streams a feature table row by row, ending with a sentinel reply.
pub(crate) fn get_features(
    ctx: &mut WorkerContext,
    env: &Envelope,
    sink: &ReplySink,
) -> HandlerResult {
    let package = ctx.sessions.get(&env.id).ok_or("no open package for id")?;

    let table = env
        .payload
        .table_name
        .as_deref()
        .ok_or("table_name must be set")?;

    for record in package.features(table)? {
        sink.success(env, Some(ReplyData::Feature(record?)));
    }

    sink.success(env, Some(ReplyData::FeaturesDone));
    Ok(())
}

/// Builds a tile descriptor from the package's native matrix metadata.
fn tile_descriptor(info: &TileTableInfo) -> TileTableDescriptor {
    let set = &info.matrix_set;

    let resolutions = info
        .matrices
        .iter()
        .map(|matrix| {
            matrix.as_ref().map(|m| {
                // Prefer the recorded pixel size; compute it from the
                // matrix dimensions otherwise.
                m.pixel_x_size.unwrap_or_else(|| {
                    (set.max_x - set.min_x) / (m.matrix_width as f64 * m.tile_width as f64)
                })
            })
        })
        .collect();

    let mut tile_sizes: Vec<Option<TileSize>> = info
        .matrices
        .iter()
        .map(|matrix| {
            matrix.as_ref().map(|m| TileSize {
                width: m.tile_width,
                height: m.tile_height,
            })
        })
        .collect();
    fix_tile_sizes(&mut tile_sizes);

    let projection = info.srs.as_ref().map(|srs| srs.code());
    let extent_projection =
        Some(projection.unwrap_or_else(|| format!("EPSG:{}", set.srs_id)));

    let (title, description) = titles(&info.contents, &info.table_name);

    TileTableDescriptor {
        table_name: info.table_name.clone(),
        title,
        description,
        min_zoom: info.min_zoom.round() as i32,
        max_zoom: info.max_zoom.round() as i32,
        resolutions,
        tile_sizes,
        extent: Some([set.min_x, set.min_y, set.max_x, set.max_y]),
        extent_projection,
    }
}

/// Title and description for a table: the contents row overrides the table
/// name when it carries an identifier.
fn titles(
    contents: &Option<crate::package::Contents>,
    table_name: &str,
) -> (String, Option<String>) {
    let title = contents
        .as_ref()
        .and_then(|c| c.identifier.clone())
        .unwrap_or_else(|| table_name.to_string());
    let description = contents.as_ref().and_then(|c| c.description.clone());
    (title, description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Contents, SpatialRef, TileMatrix, TileMatrixSet};

    fn info_with_matrices(matrices: Vec<Option<TileMatrix>>) -> TileTableInfo {
        TileTableInfo {
            table_name: "imagery".to_string(),
            min_zoom: 2.0,
            max_zoom: (matrices.len() - 1) as f64,
            matrices,
            matrix_set: TileMatrixSet {
                min_x: -180.0,
                min_y: -90.0,
                max_x: 180.0,
                max_y: 90.0,
                srs_id: 4326,
            },
            srs: Some(SpatialRef {
                organization: "epsg".to_string(),
                coordsys_id: Some(4326),
                id: 4326,
            }),
            contents: Some(Contents {
                identifier: Some("World Imagery".to_string()),
                description: Some("reference layer".to_string()),
            }),
        }
    }

    fn matrix(zoom: u8, pixel_x_size: Option<f64>) -> TileMatrix {
        TileMatrix {
            zoom,
            matrix_width: 1 << zoom,
            matrix_height: 1 << zoom,
            tile_width: 256,
            tile_height: 256,
            pixel_x_size,
        }
    }

    #[test]
    fn test_descriptor_prefers_recorded_pixel_size() {
        let info = info_with_matrices(vec![None, None, Some(matrix(2, Some(0.35)))]);
        let descriptor = tile_descriptor(&info);
        assert_eq!(descriptor.resolutions[2], Some(0.35));
    }

    #[test]
    fn test_descriptor_computes_missing_pixel_size() {
        let info = info_with_matrices(vec![None, None, Some(matrix(2, None))]);
        let descriptor = tile_descriptor(&info);

        // 360 degrees across 4 * 256 pixels.
        let expected = 360.0 / (4.0 * 256.0);
        assert!((descriptor.resolutions[2].unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_descriptor_backfills_leading_tile_sizes() {
        let info = info_with_matrices(vec![None, None, Some(matrix(2, None))]);
        let descriptor = tile_descriptor(&info);

        let expected = TileSize {
            width: 256,
            height: 256,
        };
        assert_eq!(descriptor.tile_sizes[0], Some(expected));
        assert_eq!(descriptor.tile_sizes[1], Some(expected));
        assert_eq!(descriptor.tile_sizes[2], Some(expected));
    }

    #[test]
    fn test_descriptor_contents_overrides_title() {
        let info = info_with_matrices(vec![None, None, Some(matrix(2, None))]);
        let descriptor = tile_descriptor(&info);

        assert_eq!(descriptor.title, "World Imagery");
        assert_eq!(descriptor.description.as_deref(), Some("reference layer"));
        assert_eq!(descriptor.table_name, "imagery");
    }

    #[test]
    fn test_descriptor_extent_and_projection() {
        let info = info_with_matrices(vec![None, None, Some(matrix(2, None))]);
        let descriptor = tile_descriptor(&info);

        assert_eq!(descriptor.extent, Some([-180.0, -90.0, 180.0, 90.0]));
        assert_eq!(descriptor.extent_projection.as_deref(), Some("EPSG:4326"));
    }

    #[test]
    fn test_descriptor_falls_back_to_matrix_set_srs() {
        let mut info = info_with_matrices(vec![None, None, Some(matrix(2, None))]);
        info.srs = None;
        let descriptor = tile_descriptor(&info);
        assert_eq!(descriptor.extent_projection.as_deref(), Some("EPSG:4326"));
    }
}
