//! Geospatial dataset storage and tiled map rendering.
//!
//! A [`Dataset`] owns tables and feature classes kept in a [`store`]
//! backend, with edit history, attachments and zoom overviews held in
//! auxiliary tables. Feature classes cut their geometry into vector tiles,
//! which the [`render`] layers tessellate into capacity-bounded GPU buffers.
//! Maps group layers and are owned by a host-created [`MapRegistry`].

pub mod config;
pub mod dataset;
pub mod error;
pub mod feature_class;
pub mod geometry;
pub mod logging;
pub mod map;
pub mod notify;
pub mod options;
pub mod progress;
pub mod render;
pub mod store;
pub mod table;
pub mod tile;

pub use config::Settings;
pub use dataset::Dataset;
pub use error::{GeoStoreError, Result};
pub use feature_class::FeatureClass;
pub use geometry::{Envelope, GeometryType};
pub use map::{Map, MapRegistry};
pub use notify::{ChangeCode, Notify};
pub use options::Options;
pub use progress::Progress;
pub use table::Table;
pub use tile::{Tile, VectorTile};
