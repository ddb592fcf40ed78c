//! Boundary to the wrapped package-format library.
//!
//! The on-disk layout of a package is owned by the format library, not by
//! this crate. Everything the worker needs from it is expressed here as the
//! [`PackageLibrary`] / [`Package`] traits: opening and creating packages,
//! listing tables, rendering tiles against the native tile matrix, iterating
//! and inserting features, and serializing the whole package back to bytes.
//!
//! [`memory::MemoryLibrary`] is the reference backend used by the test
//! suite and the CLI.

mod memory;

pub use memory::{MemoryLibrary, MemoryPackage, MemoryPackageBuilder};

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ColumnType;
use crate::coord::BoundingBox;

/// Errors raised by the package-format library.
///
/// Every call into the library is wrapped so a failure becomes an error
/// reply rather than tearing down the worker.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The supplied bytes or file are not a readable package.
    #[error("not a readable package: {0}")]
    BadFile(String),

    /// The named table does not exist in the package.
    #[error("no such table: {0}")]
    MissingTable(String),

    /// A table exists but its contents could not be read.
    #[error("corrupt table {table}: {reason}")]
    CorruptTable {
        /// Table that failed to read.
        table: String,
        /// Library-reported reason.
        reason: String,
    },

    /// Writing to the package failed.
    #[error("package write failed: {0}")]
    Write(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One zoom level of a package's native tile matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileMatrix {
    /// Zoom level this row describes.
    pub zoom: u8,
    /// Number of tile columns at this level.
    pub matrix_width: u32,
    /// Number of tile rows at this level.
    pub matrix_height: u32,
    /// Tile width in pixels.
    pub tile_width: u32,
    /// Tile height in pixels.
    pub tile_height: u32,
    /// Ground units per pixel, when the package records it explicitly.
    pub pixel_x_size: Option<f64>,
}

/// The spatial bounds and reference of a tile matrix set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileMatrixSet {
    /// Minimum x of the set's extent.
    pub min_x: f64,
    /// Minimum y of the set's extent.
    pub min_y: f64,
    /// Maximum x of the set's extent.
    pub max_x: f64,
    /// Maximum y of the set's extent.
    pub max_y: f64,
    /// Spatial reference id recorded for the set.
    pub srs_id: i64,
}

/// A spatial reference system row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialRef {
    /// Owning organization, e.g. `epsg`.
    pub organization: String,
    /// Organization-scoped coordinate system id.
    pub coordsys_id: Option<i64>,
    /// Package-local id, used when `coordsys_id` is absent.
    pub id: i64,
}

impl SpatialRef {
    /// Formats the reference as `ORG:code` for the external surface.
    pub fn code(&self) -> String {
        format!(
            "{}:{}",
            self.organization.to_uppercase(),
            self.coordsys_id.unwrap_or(self.id)
        )
    }
}

/// Display metadata from a table's contents row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contents {
    /// Display identifier, preferred over the table name as a title.
    pub identifier: Option<String>,
    /// Display description.
    pub description: Option<String>,
}

/// Everything the package reports about one tile table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTableInfo {
    /// Table name.
    pub table_name: String,
    /// Native minimum zoom, as recorded (may be fractional).
    pub min_zoom: f64,
    /// Native maximum zoom, as recorded (may be fractional).
    pub max_zoom: f64,
    /// Tile matrix rows ordered by zoom; levels the package does not
    /// define are `None`.
    pub matrices: Vec<Option<TileMatrix>>,
    /// Bounds and reference of the matrix set.
    pub matrix_set: TileMatrixSet,
    /// Spatial reference row, when present.
    pub srs: Option<SpatialRef>,
    /// Contents row, when present.
    pub contents: Option<Contents>,
}

/// One column the package reports for a feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    /// Raw column name.
    pub name: String,
    /// Display name, which may differ when the package carries a data
    /// columns table.
    pub display_name: Option<String>,
    /// Semantic type.
    pub column_type: ColumnType,
}

impl FeatureColumn {
    /// The name surfaced to consumers: display name when defined, raw name
    /// otherwise.
    pub fn surfaced_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Everything the package reports about one feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTableInfo {
    /// Table name.
    pub table_name: String,
    /// Ordered attribute columns.
    pub columns: Vec<FeatureColumn>,
    /// Whether the table carries a geometry column.
    pub has_geometry: bool,
    /// Contents row, when present.
    pub contents: Option<Contents>,
}

/// Per-table up/down-scaling policy for tile retrieval.
///
/// Packages rarely define the full zoom pyramid a display expects, so a
/// policy created once per table widens the range of display zooms for
/// which a tile may still be synthesized from native data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileScaling {
    /// Levels below the native range a request may reach (upscaled output
    /// blurs quickly, so this stays small).
    pub zoom_out: u8,
    /// Levels above the native range a request may reach.
    pub zoom_in: u8,
}

impl TileScaling {
    /// The policy created for every tile table when a package is listed:
    /// requests may range from 4 levels below to 25 levels above the
    /// table's native range.
    pub fn standard() -> Self {
        Self {
            zoom_out: 4,
            zoom_in: 25,
        }
    }

    /// Resolves a requested zoom to a zoom within the native range, or
    /// `None` when the request is outside the window this policy allows.
    pub fn resolve(&self, requested: u8, native_min: u8, native_max: u8) -> Option<u8> {
        if requested < native_min {
            let below = native_min - requested;
            (below <= self.zoom_out).then_some(native_min)
        } else if requested > native_max {
            let above = requested - native_max;
            (above <= self.zoom_in).then_some(native_max)
        } else {
            Some(requested)
        }
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    /// Absent value.
    Null,
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Real(f64),
    /// Text.
    Text(String),
    /// Raw binary.
    Blob(Vec<u8>),
    /// Native timestamp as milliseconds since the Unix epoch.
    DateTime(i64),
}

/// Vector geometry in the interchange representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    /// A single position as `[lon, lat]`.
    Point([f64; 2]),
    /// Multiple positions.
    MultiPoint(Vec<[f64; 2]>),
    /// An open path.
    LineString(Vec<[f64; 2]>),
    /// A ring list; the first ring is the exterior.
    Polygon(Vec<Vec<[f64; 2]>>),
}

/// One feature in the interchange representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Primary key, when assigned.
    pub id: Option<i64>,
    /// Geometry, when the table has a geometry column.
    pub geometry: Option<Geometry>,
    /// Attribute values keyed by column name.
    pub properties: BTreeMap<String, ColumnValue>,
}

impl FeatureRecord {
    /// Creates a feature with the given geometry and no attributes.
    pub fn with_geometry(geometry: Geometry) -> Self {
        Self {
            id: None,
            geometry: Some(geometry),
            properties: BTreeMap::new(),
        }
    }

    /// Sets an attribute value, consuming and returning the record.
    pub fn property(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// Column definition handed to the library when creating a feature table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
    /// Whether a value is required.
    pub not_null: bool,
    /// Default value for absent entries.
    pub default: Option<ColumnValue>,
}

/// Geometry column definition handed to the library when creating a
/// feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryColumnSpec {
    /// Column name, conventionally `geometry`.
    pub column_name: String,
    /// Geometry type name, conventionally the generic `GEOMETRY`.
    pub geometry_type: String,
    /// Z-coordinate flag (0 prohibited, 1 mandatory, 2 optional).
    pub z: u8,
    /// M-coordinate flag.
    pub m: u8,
}

impl GeometryColumnSpec {
    /// The generic geometry column used for exported tables.
    pub fn generic(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            geometry_type: "GEOMETRY".to_string(),
            z: 2,
            m: 0,
        }
    }
}

/// Iterator over a feature table's rows.
pub type FeatureIter<'a> = Box<dyn Iterator<Item = Result<FeatureRecord, PackageError>> + 'a>;

/// Entry points of the package-format library.
pub trait PackageLibrary: Send + Sync {
    /// Opens a package from raw bytes.
    fn open_bytes(&self, data: Bytes) -> Result<Box<dyn Package>, PackageError>;

    /// Opens a package from a file path.
    fn open_path(&self, path: &Path) -> Result<Box<dyn Package>, PackageError>;

    /// Creates a fresh, empty package backed by the given path.
    fn create(&self, path: &Path) -> Result<Box<dyn Package>, PackageError>;
}

/// One open package handle.
pub trait Package: Send {
    /// Names of the raster tile tables.
    fn tile_tables(&self) -> Vec<String>;

    /// Names of the vector feature tables.
    fn feature_tables(&self) -> Vec<String>;

    /// Metadata for one tile table.
    fn tile_table_info(&self, table: &str) -> Result<TileTableInfo, PackageError>;

    /// Metadata for one feature table.
    fn feature_table_info(&self, table: &str) -> Result<FeatureTableInfo, PackageError>;

    /// Renders a tile of `width`×`height` pixels covering `bbox` at the
    /// requested zoom.
    ///
    /// Returns `Ok(None)` when the package has no data at that location —
    /// an empty tile, distinct from an error. `projection` is the display
    /// projection the encoded tile is destined for; `scaling` widens the
    /// permitted zoom range beyond the table's native pyramid.
    fn render_tile(
        &self,
        table: &str,
        bbox: &BoundingBox,
        zoom: u8,
        width: u32,
        height: u32,
        projection: &str,
        scaling: Option<&TileScaling>,
    ) -> Result<Option<Bytes>, PackageError>;

    /// Iterates a feature table's rows in the interchange representation.
    fn features(&self, table: &str) -> Result<FeatureIter<'_>, PackageError>;

    /// Creates a feature table with a primary key, the given geometry
    /// column, and the given attribute columns.
    fn create_feature_table(
        &mut self,
        table: &str,
        geometry: GeometryColumnSpec,
        columns: Vec<ColumnSpec>,
    ) -> Result<(), PackageError>;

    /// Inserts features in one call.
    ///
    /// Invokes `progress` with the running insert count every
    /// `progress_every` features and once more for the final partial
    /// batch, so a non-empty insert always reports at least once. Returns
    /// the number inserted.
    fn insert_features(
        &mut self,
        table: &str,
        features: Vec<FeatureRecord>,
        progress_every: usize,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, PackageError>;

    /// Serializes the full package to its self-contained binary form.
    fn export_bytes(&self) -> Result<Bytes, PackageError>;

    /// Releases the handle. Safe to call more than once.
    fn close(&mut self);
}
