//! Tile rendering: GPU buffer objects, styles and the layers that fill and
//! draw them.

pub mod buffer;
pub mod layer;
pub mod style;

pub use buffer::{BufferType, GlBuffer, GpuContext, Image, RecordingContext, TileObject};
pub use layer::{
    FeatureLayer, GlTile, RasterLayer, RasterSource, SelectionStyles, TileCache, VectorTileSource,
};
pub use style::{Style, StyleKind, StyleName, StyleRegistry};
