//! Reference in-memory package backend.
//!
//! Holds tile pyramids and feature tables in plain maps and serializes the
//! whole package to a deterministic `bincode` snapshot — the self-contained
//! binary artifact the export pipeline ships back to the controller. Tile
//! rendering crops the requested bounds out of a per-zoom level image and
//! rescales it to the requested pixel size, honoring the table's scaling
//! policy for zooms outside the native pyramid.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use image::imageops::FilterType;
use image::{ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use super::{
    ColumnSpec, Contents, FeatureColumn, FeatureIter, FeatureRecord, FeatureTableInfo,
    GeometryColumnSpec, Package, PackageError, PackageLibrary, SpatialRef, TileMatrix,
    TileMatrixSet, TileScaling, TileTableInfo,
};
use crate::coord::BoundingBox;

/// One zoom level of an in-memory tile table: a single encoded image
/// covering the table's whole extent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LevelModel {
    tile_width: u32,
    tile_height: u32,
    matrix_width: u32,
    matrix_height: u32,
    pixel_x_size: Option<f64>,
    image: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TileTableModel {
    matrix_set: TileMatrixSet,
    srs: Option<SpatialRef>,
    contents: Option<Contents>,
    levels: BTreeMap<u8, LevelModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeatureTableModel {
    columns: Vec<FeatureColumn>,
    has_geometry: bool,
    contents: Option<Contents>,
    rows: Vec<FeatureRecord>,
    next_id: i64,
}

/// Serializable package state. `BTreeMap` keys keep the snapshot byte
/// layout deterministic for identical inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryModel {
    tile_tables: BTreeMap<String, TileTableModel>,
    feature_tables: BTreeMap<String, FeatureTableModel>,
}

/// The reference [`PackageLibrary`] implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryLibrary;

impl PackageLibrary for MemoryLibrary {
    fn open_bytes(&self, data: Bytes) -> Result<Box<dyn Package>, PackageError> {
        let model: MemoryModel = bincode::deserialize(&data)
            .map_err(|e| PackageError::BadFile(e.to_string()))?;
        Ok(Box::new(MemoryPackage { model, path: None }))
    }

    fn open_path(&self, path: &Path) -> Result<Box<dyn Package>, PackageError> {
        let data = std::fs::read(path)?;
        let model: MemoryModel = bincode::deserialize(&data)
            .map_err(|e| PackageError::BadFile(e.to_string()))?;
        Ok(Box::new(MemoryPackage {
            model,
            path: Some(path.to_path_buf()),
        }))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Package>, PackageError> {
        let model = MemoryModel::default();
        let snapshot =
            bincode::serialize(&model).map_err(|e| PackageError::Write(e.to_string()))?;
        std::fs::write(path, snapshot)?;
        Ok(Box::new(MemoryPackage {
            model,
            path: Some(path.to_path_buf()),
        }))
    }
}

/// One open in-memory package.
#[derive(Debug)]
pub struct MemoryPackage {
    model: MemoryModel,
    path: Option<PathBuf>,
}

impl MemoryPackage {
    /// Starts building a package from scratch.
    pub fn builder() -> MemoryPackageBuilder {
        MemoryPackageBuilder {
            model: MemoryModel::default(),
        }
    }

    /// Encodes a solid-color PNG, handy for seeding tile levels.
    pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(rgba));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("encoding a solid image cannot fail");
        buf
    }

    /// Backing file path, when the package was opened from or created at
    /// one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn tile_table(&self, table: &str) -> Result<&TileTableModel, PackageError> {
        self.model
            .tile_tables
            .get(table)
            .ok_or_else(|| PackageError::MissingTable(table.to_string()))
    }

    fn extent_bbox(set: &TileMatrixSet) -> BoundingBox {
        BoundingBox {
            min_lon: set.min_x,
            max_lon: set.max_x,
            min_lat: set.min_y,
            max_lat: set.max_y,
        }
    }

    /// Picks the populated level nearest to `zoom`.
    fn nearest_level(levels: &BTreeMap<u8, LevelModel>, zoom: u8) -> Option<(u8, &LevelModel)> {
        if let Some(level) = levels.get(&zoom) {
            return Some((zoom, level));
        }

        let below = levels.range(..zoom).next_back();
        let above = levels.range(zoom..).next();
        match (below, above) {
            (Some((&bz, bl)), Some((&az, al))) => {
                if zoom - bz <= az - zoom {
                    Some((bz, bl))
                } else {
                    Some((az, al))
                }
            }
            (Some((&bz, bl)), None) => Some((bz, bl)),
            (None, Some((&az, al))) => Some((az, al)),
            (None, None) => None,
        }
    }
}

impl Package for MemoryPackage {
    fn tile_tables(&self) -> Vec<String> {
        self.model.tile_tables.keys().cloned().collect()
    }

    fn feature_tables(&self) -> Vec<String> {
        self.model.feature_tables.keys().cloned().collect()
    }

    fn tile_table_info(&self, table: &str) -> Result<TileTableInfo, PackageError> {
        let model = self.tile_table(table)?;

        let max_zoom = model.levels.keys().next_back().copied().unwrap_or(0);
        let min_zoom = model.levels.keys().next().copied().unwrap_or(0);

        // Index the matrix rows by zoom so consumers can line them up with
        // resolution arrays.
        let mut matrices: Vec<Option<TileMatrix>> = vec![None; max_zoom as usize + 1];
        for (&zoom, level) in &model.levels {
            matrices[zoom as usize] = Some(TileMatrix {
                zoom,
                matrix_width: level.matrix_width,
                matrix_height: level.matrix_height,
                tile_width: level.tile_width,
                tile_height: level.tile_height,
                pixel_x_size: level.pixel_x_size,
            });
        }

        Ok(TileTableInfo {
            table_name: table.to_string(),
            min_zoom: min_zoom as f64,
            max_zoom: max_zoom as f64,
            matrices,
            matrix_set: model.matrix_set,
            srs: model.srs.clone(),
            contents: model.contents.clone(),
        })
    }

    fn feature_table_info(&self, table: &str) -> Result<FeatureTableInfo, PackageError> {
        let model = self
            .model
            .feature_tables
            .get(table)
            .ok_or_else(|| PackageError::MissingTable(table.to_string()))?;

        Ok(FeatureTableInfo {
            table_name: table.to_string(),
            columns: model.columns.clone(),
            has_geometry: model.has_geometry,
            contents: model.contents.clone(),
        })
    }

    fn render_tile(
        &self,
        table: &str,
        bbox: &BoundingBox,
        zoom: u8,
        width: u32,
        height: u32,
        _projection: &str,
        scaling: Option<&TileScaling>,
    ) -> Result<Option<Bytes>, PackageError> {
        let model = self.tile_table(table)?;

        if model.levels.is_empty() {
            return Ok(None);
        }

        let native_min = *model.levels.keys().next().expect("levels not empty");
        let native_max = *model.levels.keys().next_back().expect("levels not empty");

        // Without a scaling policy only natively populated levels render.
        let resolved = match scaling {
            Some(policy) => match policy.resolve(zoom, native_min, native_max) {
                Some(z) => z,
                None => return Ok(None),
            },
            None => {
                if !model.levels.contains_key(&zoom) {
                    return Ok(None);
                }
                zoom
            }
        };

        let Some((_, level)) = Self::nearest_level(&model.levels, resolved) else {
            return Ok(None);
        };

        let extent = Self::extent_bbox(&model.matrix_set);
        let Some(covered) = bbox.intersection(&extent) else {
            return Ok(None);
        };

        let source = image::load_from_memory(&level.image).map_err(|e| {
            PackageError::CorruptTable {
                table: table.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (img_w, img_h) = (source.width() as f64, source.height() as f64);
        let x = ((covered.min_lon - extent.min_lon) / extent.width() * img_w).floor();
        let y = ((extent.max_lat - covered.max_lat) / extent.height() * img_h).floor();
        let w = (covered.width() / extent.width() * img_w).ceil();
        let h = (covered.height() / extent.height() * img_h).ceil();

        let crop_w = (w as u32).clamp(1, source.width());
        let crop_h = (h as u32).clamp(1, source.height());
        let crop_x = (x as u32).min(source.width() - crop_w);
        let crop_y = (y as u32).min(source.height() - crop_h);

        let tile = source
            .crop_imm(crop_x, crop_y, crop_w, crop_h)
            .resize_exact(width, height, FilterType::Triangle);

        let mut buf = Vec::new();
        tile.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| PackageError::Write(e.to_string()))?;

        Ok(Some(Bytes::from(buf)))
    }

    fn features(&self, table: &str) -> Result<FeatureIter<'_>, PackageError> {
        let model = self
            .model
            .feature_tables
            .get(table)
            .ok_or_else(|| PackageError::MissingTable(table.to_string()))?;

        Ok(Box::new(model.rows.iter().cloned().map(Ok)))
    }

    fn create_feature_table(
        &mut self,
        table: &str,
        _geometry: GeometryColumnSpec,
        columns: Vec<ColumnSpec>,
    ) -> Result<(), PackageError> {
        if self.model.feature_tables.contains_key(table)
            || self.model.tile_tables.contains_key(table)
        {
            return Err(PackageError::Write(format!(
                "table {table} already exists"
            )));
        }

        let columns = columns
            .into_iter()
            .map(|spec| FeatureColumn {
                name: spec.name,
                display_name: None,
                column_type: spec.column_type,
            })
            .collect();

        self.model.feature_tables.insert(
            table.to_string(),
            FeatureTableModel {
                columns,
                has_geometry: true,
                contents: None,
                rows: Vec::new(),
                next_id: 1,
            },
        );

        Ok(())
    }

    fn insert_features(
        &mut self,
        table: &str,
        features: Vec<FeatureRecord>,
        progress_every: usize,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, PackageError> {
        let model = self
            .model
            .feature_tables
            .get_mut(table)
            .ok_or_else(|| PackageError::MissingTable(table.to_string()))?;

        let mut inserted = 0u64;
        for mut feature in features {
            feature.id = Some(model.next_id);
            model.next_id += 1;
            model.rows.push(feature);
            inserted += 1;

            if progress_every > 0 && inserted % progress_every as u64 == 0 {
                progress(inserted);
            }
        }

        // The final partial batch reports too, so every insert call yields
        // at least one progress count.
        if inserted > 0 && (progress_every == 0 || inserted % progress_every as u64 != 0) {
            progress(inserted);
        }

        Ok(inserted)
    }

    fn export_bytes(&self) -> Result<Bytes, PackageError> {
        let data =
            bincode::serialize(&self.model).map_err(|e| PackageError::Write(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    fn close(&mut self) {
        // Nothing to release; dropping the model is enough.
    }
}

/// Builder for seeding an in-memory package with tables and data.
#[derive(Debug)]
pub struct MemoryPackageBuilder {
    model: MemoryModel,
}

impl MemoryPackageBuilder {
    /// Adds a tile table covering `extent` (`[west, south, east, north]`)
    /// in the given spatial reference.
    pub fn tile_table(
        mut self,
        name: impl Into<String>,
        extent: [f64; 4],
        srs: Option<SpatialRef>,
        contents: Option<Contents>,
    ) -> Self {
        let srs_id = srs.as_ref().map(|s| s.id).unwrap_or(4326);
        self.model.tile_tables.insert(
            name.into(),
            TileTableModel {
                matrix_set: TileMatrixSet {
                    min_x: extent[0],
                    min_y: extent[1],
                    max_x: extent[2],
                    max_y: extent[3],
                    srs_id,
                },
                srs,
                contents,
                levels: BTreeMap::new(),
            },
        );
        self
    }

    /// Adds one zoom level to a tile table, backed by a single encoded
    /// image covering the whole table extent.
    ///
    /// The matrix is sized `2^zoom` across; the per-pixel resolution is
    /// left for consumers to derive from the matrix set.
    pub fn tile_level(
        mut self,
        table: &str,
        zoom: u8,
        tile_width: u32,
        tile_height: u32,
        image: Vec<u8>,
    ) -> Self {
        let matrix_dim = 1u32 << zoom.min(20);
        if let Some(model) = self.model.tile_tables.get_mut(table) {
            model.levels.insert(
                zoom,
                LevelModel {
                    tile_width,
                    tile_height,
                    matrix_width: matrix_dim,
                    matrix_height: matrix_dim,
                    pixel_x_size: None,
                    image,
                },
            );
        }
        self
    }

    /// Adds a feature table with the given columns.
    pub fn feature_table(
        mut self,
        name: impl Into<String>,
        columns: Vec<FeatureColumn>,
        has_geometry: bool,
        contents: Option<Contents>,
    ) -> Self {
        self.model.feature_tables.insert(
            name.into(),
            FeatureTableModel {
                columns,
                has_geometry,
                contents,
                rows: Vec::new(),
                next_id: 1,
            },
        );
        self
    }

    /// Appends a feature row to a feature table.
    pub fn feature(mut self, table: &str, mut record: FeatureRecord) -> Self {
        if let Some(model) = self.model.feature_tables.get_mut(table) {
            if record.id.is_none() {
                record.id = Some(model.next_id);
            }
            model.next_id = record.id.unwrap_or(model.next_id) + 1;
            model.rows.push(record);
        }
        self
    }

    /// Finishes the build as an open package.
    pub fn build(self) -> MemoryPackage {
        MemoryPackage {
            model: self.model,
            path: None,
        }
    }

    /// Finishes the build as the package's serialized binary form.
    pub fn build_bytes(self) -> Bytes {
        let data = bincode::serialize(&self.model).expect("in-memory model always serializes");
        Bytes::from(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnType;
    use crate::package::{ColumnValue, Geometry};

    fn sample_package() -> MemoryPackage {
        MemoryPackage::builder()
            .tile_table(
                "imagery",
                [-180.0, -90.0, 180.0, 90.0],
                Some(SpatialRef {
                    organization: "epsg".to_string(),
                    coordsys_id: Some(4326),
                    id: 4326,
                }),
                None,
            )
            .tile_level(
                "imagery",
                3,
                256,
                256,
                MemoryPackage::solid_png(64, 32, [10, 60, 200, 255]),
            )
            .tile_level(
                "imagery",
                5,
                256,
                256,
                MemoryPackage::solid_png(128, 64, [10, 60, 200, 255]),
            )
            .feature_table(
                "tracks",
                vec![FeatureColumn {
                    name: "name".to_string(),
                    display_name: None,
                    column_type: ColumnType::Text,
                }],
                true,
                None,
            )
            .feature(
                "tracks",
                FeatureRecord::with_geometry(Geometry::Point([1.0, 2.0]))
                    .property("name", ColumnValue::Text("alpha".to_string())),
            )
            .build()
    }

    #[test]
    fn test_table_listing() {
        let pkg = sample_package();
        assert_eq!(pkg.tile_tables(), vec!["imagery".to_string()]);
        assert_eq!(pkg.feature_tables(), vec!["tracks".to_string()]);
    }

    #[test]
    fn test_tile_table_info_indexes_matrices_by_zoom() {
        let pkg = sample_package();
        let info = pkg.tile_table_info("imagery").unwrap();

        assert_eq!(info.min_zoom, 3.0);
        assert_eq!(info.max_zoom, 5.0);
        assert_eq!(info.matrices.len(), 6);
        assert!(info.matrices[3].is_some());
        assert!(info.matrices[4].is_none());
        assert!(info.matrices[5].is_some());
    }

    #[test]
    fn test_render_tile_native_zoom() {
        let pkg = sample_package();
        let bbox = BoundingBox::from_extent(&[-10.0, -10.0, 10.0, 10.0]);

        let tile = pkg
            .render_tile("imagery", &bbox, 5, 256, 256, "EPSG:4326", None)
            .unwrap();
        assert!(tile.is_some());
        assert!(!tile.unwrap().is_empty());
    }

    #[test]
    fn test_render_tile_missing_level_without_scaling_is_empty() {
        let pkg = sample_package();
        let bbox = BoundingBox::from_extent(&[-10.0, -10.0, 10.0, 10.0]);

        let tile = pkg
            .render_tile("imagery", &bbox, 9, 256, 256, "EPSG:4326", None)
            .unwrap();
        assert!(tile.is_none());
    }

    #[test]
    fn test_render_tile_below_native_range_with_scaling() {
        let pkg = sample_package();
        let bbox = BoundingBox::from_extent(&[-90.0, -45.0, 90.0, 45.0]);
        let scaling = TileScaling::standard();

        let tile = pkg
            .render_tile("imagery", &bbox, 1, 256, 256, "EPSG:4326", Some(&scaling))
            .unwrap();
        assert!(tile.is_some(), "scaled request inside window renders");
    }

    #[test]
    fn test_render_tile_outside_extent_is_empty() {
        let pkg = MemoryPackage::builder()
            .tile_table("regional", [0.0, 0.0, 10.0, 10.0], None, None)
            .tile_level(
                "regional",
                4,
                256,
                256,
                MemoryPackage::solid_png(32, 32, [0, 0, 0, 255]),
            )
            .build();

        let bbox = BoundingBox::from_extent(&[100.0, 40.0, 110.0, 50.0]);
        let tile = pkg
            .render_tile("regional", &bbox, 4, 256, 256, "EPSG:4326", None)
            .unwrap();
        assert!(tile.is_none());
    }

    #[test]
    fn test_render_tile_unknown_table_errors() {
        let pkg = sample_package();
        let bbox = BoundingBox::from_extent(&[-10.0, -10.0, 10.0, 10.0]);

        let err = pkg
            .render_tile("nope", &bbox, 5, 256, 256, "EPSG:4326", None)
            .unwrap_err();
        assert!(matches!(err, PackageError::MissingTable(_)));
    }

    #[test]
    fn test_insert_features_reports_progress() {
        let mut pkg = MemoryPackage::builder()
            .feature_table("out", Vec::new(), true, None)
            .build();

        let features: Vec<FeatureRecord> = (0..25)
            .map(|_| FeatureRecord::with_geometry(Geometry::Point([0.0, 0.0])))
            .collect();

        let mut reports = Vec::new();
        let inserted = pkg
            .insert_features("out", features, 10, &mut |count| reports.push(count))
            .unwrap();

        assert_eq!(inserted, 25);
        assert_eq!(reports, vec![10, 20, 25]);
    }

    #[test]
    fn test_export_roundtrip() {
        let pkg = sample_package();
        let bytes = pkg.export_bytes().unwrap();

        let reopened = MemoryLibrary.open_bytes(bytes.clone()).unwrap();
        assert_eq!(reopened.tile_tables(), vec!["imagery".to_string()]);
        assert_eq!(reopened.feature_tables(), vec!["tracks".to_string()]);

        // The snapshot is deterministic for identical state.
        assert_eq!(bytes, reopened.export_bytes().unwrap());
    }

    #[test]
    fn test_open_bytes_rejects_garbage() {
        let err = MemoryLibrary
            .open_bytes(Bytes::from_static(b"not a package"))
            .err()
            .unwrap();
        assert!(matches!(err, PackageError::BadFile(_)));
    }

    #[test]
    fn test_create_feature_table_rejects_duplicates() {
        let mut pkg = MemoryPackage::builder()
            .feature_table("dup", Vec::new(), true, None)
            .build();

        let err = pkg
            .create_feature_table("dup", GeometryColumnSpec::generic("geometry"), Vec::new())
            .unwrap_err();
        assert!(matches!(err, PackageError::Write(_)));
    }

    #[test]
    fn test_create_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.tilepack");

        let pkg = MemoryLibrary.create(&path).unwrap();
        assert!(path.exists());
        assert!(pkg.tile_tables().is_empty());
    }
}
