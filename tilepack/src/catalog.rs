//! Table descriptors surfaced when listing a package's contents.
//!
//! A package rarely defines the full zoom pyramid a display expects, so the
//! per-zoom metadata it reports is sparse. Two repair passes run before the
//! descriptors reach a consumer:
//!
//! - [`fix_resolutions`] fills gaps in the per-zoom resolution array from
//!   the known entries.
//! - [`fix_tile_sizes`] back-fills leading gaps in the per-zoom tile size
//!   array, since a full pyramid must present a size at every level even
//!   where the package defines none.

use serde::{Deserialize, Serialize};

/// Zoom factor assumed between adjacent levels when only a single
/// resolution is known: each level is half the ground resolution of the
/// previous.
pub const DEFAULT_ZOOM_FACTOR: f64 = 2.0;

/// Semantic column types surfaced for feature tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Free-form text.
    Text,
    /// Whole numbers.
    Integer,
    /// Floating-point numbers.
    Real,
    /// Timestamps.
    DateTime,
}

impl ColumnType {
    /// Lower-case label used on the external surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::DateTime => "datetime",
        }
    }
}

/// Pixel dimensions of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSize {
    /// Tile width in pixels.
    pub width: u32,
    /// Tile height in pixels.
    pub height: u32,
}

/// One column of a feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name (the display name when the package defines one).
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
}

/// Descriptor for a tile table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTableDescriptor {
    /// Table name inside the package.
    pub table_name: String,
    /// Display title (contents identifier when present, else table name).
    pub title: String,
    /// Optional display description.
    pub description: Option<String>,
    /// Native minimum zoom level.
    pub min_zoom: i32,
    /// Native maximum zoom level.
    pub max_zoom: i32,
    /// Per-zoom ground resolutions; sparse until repaired.
    pub resolutions: Vec<Option<f64>>,
    /// Per-zoom tile pixel sizes; leading gaps back-filled.
    pub tile_sizes: Vec<Option<TileSize>>,
    /// Spatial extent of the tile matrix set.
    pub extent: Option<[f64; 4]>,
    /// Spatial reference of `extent`, e.g. `EPSG:4326`.
    pub extent_projection: Option<String>,
}

/// Descriptor for a feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableDescriptor {
    /// Table name inside the package.
    pub table_name: String,
    /// Display title (contents identifier when present, else table name).
    pub title: String,
    /// Optional display description.
    pub description: Option<String>,
    /// Ordered column list.
    pub columns: Vec<ColumnDescriptor>,
    /// Whether the table carries a geometry column.
    pub has_geometry: bool,
}

/// A table surfaced by `list-tables`, discriminated by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableDescriptor {
    /// A raster tile table.
    Tile(TileTableDescriptor),
    /// A vector feature table.
    Feature(FeatureTableDescriptor),
}

impl TableDescriptor {
    /// Table name regardless of kind.
    pub fn table_name(&self) -> &str {
        match self {
            TableDescriptor::Tile(t) => &t.table_name,
            TableDescriptor::Feature(f) => &f.table_name,
        }
    }

    /// Display title regardless of kind.
    pub fn title(&self) -> &str {
        match self {
            TableDescriptor::Tile(t) => &t.title,
            TableDescriptor::Feature(f) => &f.title,
        }
    }
}

/// Fills gaps in a sparse per-zoom resolution array in place.
///
/// With no known entries this is a no-op. With exactly one known entry,
/// every other index is extrapolated from it using
/// [`DEFAULT_ZOOM_FACTOR`]. With two or more, the zoom factor is computed
/// from the first two known entries as `(first / second)^(1 / gap)` and
/// missing entries — including those before the first known index — are
/// extrapolated from the first known value. Entries already present are
/// left untouched, which makes repair idempotent.
pub fn fix_resolutions(resolutions: &mut [Option<f64>]) {
    let mut known = resolutions
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.map(|v| (i, v)));

    let Some((first_idx, first)) = known.next() else {
        return;
    };

    let factor = match known.next() {
        Some((second_idx, second)) => {
            let gap = (second_idx - first_idx) as f64;
            (first / second).powf(1.0 / gap)
        }
        None => DEFAULT_ZOOM_FACTOR,
    };

    for (idx, entry) in resolutions.iter_mut().enumerate() {
        if entry.is_none() {
            let distance = first_idx as i32 - idx as i32;
            *entry = Some(first * factor.powi(distance));
        }
    }
}

/// Back-fills leading gaps in a per-zoom tile size array from the first
/// known size.
pub fn fix_tile_sizes(sizes: &mut [Option<TileSize>]) {
    let Some(first_idx) = sizes.iter().position(|s| s.is_some()) else {
        return;
    };

    let first = sizes[first_idx];
    for entry in sizes.iter_mut().take(first_idx) {
        *entry = first;
    }
}
