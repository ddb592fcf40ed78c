//! Tile retrieval handler.
//!
//! Reconciles the display pyramid's request with the package's native
//! pyramid: the extent is normalized to survive antimeridian-adjacent
//! tiles, the table's scaling policy widens the permitted zoom range, and
//! a location with no data comes back as an explicit empty-tile reply —
//! distinct from an error, so the display renders a blank tile instead of
//! falling back to a parent.

use tracing::debug;

use super::{HandlerResult, ReplySink, WorkerContext};
use crate::coord::{normalize_extent, BoundingBox};
use crate::protocol::{Envelope, ReplyData};

/// Display projection assumed when a request does not name one.
const DEFAULT_PROJECTION: &str = "EPSG:4326";

pub(crate) fn get_tile(ctx: &mut WorkerContext, env: &Envelope, sink: &ReplySink) -> HandlerResult {
    let WorkerContext {
        sessions,
        tile_scaling,
        ..
    } = ctx;

    let package = sessions.get(&env.id).ok_or("no open package for id")?;

    let table = env
        .payload
        .table_name
        .as_deref()
        .ok_or("table_name must be set")?;
    let zoom = env.payload.zoom.ok_or("zoom must be set")?;
    let width = env.payload.width.ok_or("width must be set")?;
    let height = env.payload.height.ok_or("height must be set")?;
    if width == 0 {
        return Err("width must be positive".into());
    }
    if height == 0 {
        return Err("height must be positive".into());
    }
    let extent = env.payload.extent.ok_or("extent must be set")?;

    let projection = env
        .payload
        .projection
        .as_deref()
        .unwrap_or(DEFAULT_PROJECTION);

    // The package format only accepts longitudes in [-180, 180], so
    // normalize before constructing the bounding box.
    let mut extent = extent;
    normalize_extent(&mut extent);
    let bbox = BoundingBox::from_extent(&extent);

    let scaling = tile_scaling.get(table);

    match package.render_tile(table, &bbox, zoom, width, height, projection, scaling)? {
        Some(image) => {
            debug!(id = %env.id, table = %table, zoom, bytes = image.len(), "Rendered tile");
            sink.success(env, Some(ReplyData::Tile(image)));
        }
        None => {
            debug!(id = %env.id, table = %table, zoom, "No tile data at location");
            sink.success(env, Some(ReplyData::EmptyTile));
        }
    }

    Ok(())
}
