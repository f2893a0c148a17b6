use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::f32::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::str::FromStr;

use crate::error::{GeoStoreError, Result};
use crate::geometry::{Normal, SimplePoint};
use crate::render::buffer::{BufferType, GlBuffer, GpuContext, Image, Primitive, Uniforms};

const NORMAL_45: f32 = std::f32::consts::FRAC_1_SQRT_2;
const NORMAL_60: f32 = 0.866_025_4;
const STAR_INNER_RADIUS: f32 = 0.35;

const DEFAULT_COLOR: Rgba = Rgba::new(0, 255, 0, 255);
const BORDER_COLOR: Rgba = Rgba::new(128, 128, 128, 255);

const EDIT_FILL_COLOR: Rgba = Rgba::new(37, 92, 148, 255);
const EDIT_SELECTED_FILL_COLOR: Rgba = Rgba::new(40, 215, 215, 255);
const EDIT_LINE_COLOR: Rgba = Rgba::new(0, 128, 128, 255);
const EDIT_SELECTED_LINE_COLOR: Rgba = Rgba::new(64, 192, 0, 255);
const EDIT_MEDIAN_POINT_COLOR: Rgba = Rgba::new(224, 64, 255, 255);
const EDIT_SELECTED_MEDIAN_POINT_COLOR: Rgba = Rgba::new(255, 128, 64, 255);
const EDIT_WALK_POINT_COLOR: Rgba = Rgba::new(128, 0, 255, 255);
const EDIT_POINT_COLOR: Rgba = Rgba::new(0, 0, 255, 255);
const EDIT_SELECTED_POINT_COLOR: Rgba = Rgba::new(255, 0, 0, 255);
const EDIT_CROSS_COLOR: Rgba = Rgba::new(255, 0, 0, 255);

/// Icon sets by name, shared by marker styles.
pub type TextureAtlas = HashMap<String, Image>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StyleName {
    SimpleImage,
    SimplePoint,
    SimpleLine,
    SimpleFill,
    SimpleFillBordered,
    PrimitivePoint,
    Marker,
    SimpleLocation,
    MarkerLocation,
    SimpleEditPoint,
    MarkerEditPoint,
    EditLine,
    EditFill,
    SimpleEditCross,
}

impl StyleName {
    pub const ALL: [StyleName; 14] = [
        StyleName::SimpleImage,
        StyleName::SimplePoint,
        StyleName::SimpleLine,
        StyleName::SimpleFill,
        StyleName::SimpleFillBordered,
        StyleName::PrimitivePoint,
        StyleName::Marker,
        StyleName::SimpleLocation,
        StyleName::MarkerLocation,
        StyleName::SimpleEditPoint,
        StyleName::MarkerEditPoint,
        StyleName::EditLine,
        StyleName::EditFill,
        StyleName::SimpleEditCross,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StyleName::SimpleImage => "simpleImage",
            StyleName::SimplePoint => "simplePoint",
            StyleName::SimpleLine => "simpleLine",
            StyleName::SimpleFill => "simpleFill",
            StyleName::SimpleFillBordered => "simpleFillBordered",
            StyleName::PrimitivePoint => "primitivePoint",
            StyleName::Marker => "marker",
            StyleName::SimpleLocation => "simpleLocation",
            StyleName::MarkerLocation => "markerLocation",
            StyleName::SimpleEditPoint => "simpleEditPoint",
            StyleName::MarkerEditPoint => "markerEditPoint",
            StyleName::EditLine => "editLine",
            StyleName::EditFill => "editFill",
            StyleName::SimpleEditCross => "simpleEditCross",
        }
    }
}

impl fmt::Display for StyleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StyleName {
    type Err = GeoStoreError;

    fn from_str(s: &str) -> Result<Self> {
        StyleName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GeoStoreError::NotFound(format!("style {}", s)))
    }
}

/// Shader family a style draws with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StyleKind {
    Point,
    Line,
    Fill,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_gl(self) -> [f32; 4] {
        [
            f32::from(self.r) / 255.0,
            f32::from(self.g) / 255.0,
            f32::from(self.b) / 255.0,
            f32::from(self.a) / 255.0,
        ]
    }
}

impl Default for Rgba {
    fn default() -> Self {
        DEFAULT_COLOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointType {
    Unknown = 0,
    Square = 1,
    Rectangle = 2,
    Circle = 3,
    Triangle = 4,
    Diamond = 5,
    Star = 6,
    Marker = 7,
}

impl PointType {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => PointType::Square,
            2 => PointType::Rectangle,
            3 => PointType::Circle,
            4 => PointType::Triangle,
            5 => PointType::Diamond,
            6 => PointType::Star,
            7 => PointType::Marker,
            _ => PointType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    Butt = 0,
    Round = 1,
    Square = 2,
}

impl CapType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CapType::Butt),
            1 => Some(CapType::Round),
            2 => Some(CapType::Square),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Miter = 0,
    Round = 1,
    Bevel = 2,
}

impl JoinType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JoinType::Miter),
            1 => Some(JoinType::Round),
            2 => Some(JoinType::Bevel),
            _ => None,
        }
    }
}

/// Part of an edited geometry being drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditElementType {
    Point,
    SelectedPoint,
    WalkPoint,
    MedianPoint,
    SelectedMedianPoint,
    Line,
    SelectedLine,
    Polygon,
    SelectedPolygon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationStatus {
    Stay,
    Move,
}

/// Vertices and indices one emission adds to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footprint {
    pub vertices: usize,
    pub indices: usize,
}

impl Footprint {
    pub const fn new(vertices: usize, indices: usize) -> Self {
        Self { vertices, indices }
    }

    pub const NONE: Footprint = Footprint::new(0, 0);
}

pub const SEGMENT_FOOTPRINT: Footprint = Footprint::new(4, 6);

/// Emission record produced by tessellators that have recording enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TessellationEvent {
    Cap,
    Join,
    Segment,
    Point,
}

fn is_equal(a: f32, b: f32) -> bool {
    (a - b).abs() < f32::EPSILON
}

/// Direction of a unit normal in radians, in (-π, π].
fn angle(normal: &Normal) -> f32 {
    if is_equal(normal.y, 0.0) {
        return if normal.x > 0.0 { 0.0 } else { PI };
    }
    if is_equal(normal.x, 0.0) {
        return if normal.y > 0.0 { FRAC_PI_2 } else { -FRAC_PI_2 };
    }

    let angle = normal.y.asin().abs();
    if normal.x < 0.0 && normal.y >= 0.0 {
        PI - angle
    } else if normal.x < 0.0 && normal.y <= 0.0 {
        angle - PI
    } else if normal.x > 0.0 && normal.y <= 0.0 {
        -angle
    } else {
        angle
    }
}

fn add_vertex5(buffer: &mut GlBuffer, pt: &SimplePoint, z: f32, nx: f32, ny: f32) {
    buffer.add_vertex(&[pt.x, pt.y, z, nx, ny]);
}

/// Pushes `count` consecutive indices starting at `index`.
fn add_sequential(buffer: &mut GlBuffer, mut index: u16, count: usize) -> u16 {
    for _ in 0..count {
        buffer.add_index(index);
        index += 1;
    }
    index
}

/// Adds the quad of one polyline segment.
pub fn add_segment(
    pt1: &SimplePoint,
    pt2: &SimplePoint,
    normal: &Normal,
    z: f32,
    index: u16,
    buffer: &mut GlBuffer,
) -> u16 {
    add_vertex5(buffer, pt1, z, -normal.x, -normal.y);
    add_vertex5(buffer, pt2, z, -normal.x, -normal.y);
    add_vertex5(buffer, pt1, z, normal.x, normal.y);
    add_vertex5(buffer, pt2, z, normal.x, normal.y);

    for offset in [0, 1, 2, 1, 2, 3] {
        buffer.add_index(index + offset);
    }
    index + 4
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineParams {
    pub width: f32,
    pub cap: CapType,
    pub join: JoinType,
    pub segment_count: u8,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            width: 1.0,
            cap: CapType::Butt,
            join: JoinType::Bevel,
            segment_count: 6,
        }
    }
}

impl LineParams {
    pub fn cap_footprint(&self) -> Footprint {
        let n = usize::from(self.segment_count);
        match self.cap {
            CapType::Butt => Footprint::NONE,
            CapType::Round => Footprint::new(3 * n, 3 * n),
            CapType::Square => Footprint::new(4, 6),
        }
    }

    pub fn join_footprint(&self) -> Footprint {
        let n = usize::from(self.segment_count);
        match self.join {
            JoinType::Round => Footprint::new(3 * n, 3 * n),
            JoinType::Miter => Footprint::new(6, 6),
            JoinType::Bevel => Footprint::new(3, 3),
        }
    }

    pub fn line_cap_vertices_count(&self) -> usize {
        self.cap_footprint().vertices
    }

    pub fn line_join_vertices_count(&self) -> usize {
        self.join_footprint().vertices
    }

    pub fn add_line_cap(
        &self,
        point: &SimplePoint,
        normal: &Normal,
        z: f32,
        mut index: u16,
        buffer: &mut GlBuffer,
    ) -> u16 {
        match self.cap {
            CapType::Butt => {}
            CapType::Round => {
                let mut start = normal.y.asin();
                if normal.x < 0.0 && normal.y <= 0.0 {
                    start = PI - start;
                } else if normal.x < 0.0 && normal.y >= 0.0 {
                    start += FRAC_PI_2;
                } else if normal.x > 0.0 && normal.y <= 0.0 {
                    start += 2.0 * PI;
                }

                let step = PI / f32::from(self.segment_count);
                let mut current = start;
                for _ in 0..self.segment_count {
                    add_vertex5(buffer, point, z, current.cos(), current.sin());
                    current += step;
                    add_vertex5(buffer, point, z, current.cos(), current.sin());
                    add_vertex5(buffer, point, z, 0.0, 0.0);
                    index = add_sequential(buffer, index, 3);
                }
            }
            CapType::Square => {
                let sc1 = (-(normal.y + normal.x), -(normal.y - normal.x));
                let sc2 = (normal.x - normal.y, normal.x + normal.y);
                add_vertex5(buffer, point, z, sc1.0, sc1.1);
                add_vertex5(buffer, point, z, sc2.0, sc2.1);
                add_vertex5(buffer, point, z, -normal.x, -normal.y);
                add_vertex5(buffer, point, z, normal.x, normal.y);

                for offset in [0, 1, 2, 3, 2, 1] {
                    buffer.add_index(index + offset);
                }
                index += 4;
            }
        }
        index
    }

    pub fn add_line_join(
        &self,
        point: &SimplePoint,
        prev_normal: &Normal,
        normal: &Normal,
        z: f32,
        mut index: u16,
        buffer: &mut GlBuffer,
    ) -> u16 {
        let start = angle(prev_normal);
        let end = angle(normal);
        let delta = end - start;
        let mult = if delta >= 0.0 { -1.0 } else { 1.0 };

        match self.join {
            JoinType::Round => {
                let step = delta / f32::from(self.segment_count);
                let mut current = start;
                for _ in 0..self.segment_count {
                    add_vertex5(buffer, point, z, current.cos() * mult, current.sin() * mult);
                    current += step;
                    add_vertex5(buffer, point, z, current.cos() * mult, current.sin() * mult);
                    add_vertex5(buffer, point, z, 0.0, 0.0);
                    index = add_sequential(buffer, index, 3);
                }
            }
            JoinType::Miter => {
                let mut miter = Normal::new(prev_normal.x + normal.x, prev_normal.y + normal.y);
                let cos_half = miter.x * normal.x + miter.y * normal.y;
                let length = if is_equal(cos_half, 0.0) { 0.0 } else { 1.0 / cos_half };
                miter.x *= length;
                miter.y *= length;

                for side in [prev_normal, normal] {
                    add_vertex5(buffer, point, z, side.x * mult, side.y * mult);
                    add_vertex5(buffer, point, z, miter.x * mult, miter.y * mult);
                    add_vertex5(buffer, point, z, 0.0, 0.0);
                    index = add_sequential(buffer, index, 3);
                }
            }
            JoinType::Bevel => {
                add_vertex5(buffer, point, z, prev_normal.x * mult, prev_normal.y * mult);
                add_vertex5(buffer, point, z, normal.x * mult, normal.y * mult);
                add_vertex5(buffer, point, z, 0.0, 0.0);
                index = add_sequential(buffer, index, 3);
            }
        }
        index
    }

    fn save_into(&self, out: &mut Map<String, Value>) {
        out.insert("line_width".into(), json!(self.width));
        out.insert("cap".into(), json!(self.cap as i64));
        out.insert("join".into(), json!(self.join as i64));
        out.insert("segments".into(), json!(self.segment_count));
    }

    fn load_from(&mut self, value: &Value) {
        self.width = get_f32(value, "line_width", 3.0);
        self.cap = value
            .get("cap")
            .and_then(Value::as_i64)
            .and_then(CapType::from_code)
            .unwrap_or(self.cap);
        self.join = value
            .get("join")
            .and_then(Value::as_i64)
            .and_then(JoinType::from_code)
            .unwrap_or(self.join);
        self.segment_count = get_u8(value, "segments", self.segment_count).max(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointParams {
    pub point_type: PointType,
    pub size: f32,
    pub rotation: f32,
}

impl Default for PointParams {
    fn default() -> Self {
        Self {
            point_type: PointType::Circle,
            size: 6.0,
            rotation: 0.0,
        }
    }
}

impl PointParams {
    fn with_type(point_type: PointType) -> Self {
        Self {
            point_type,
            ..Self::default()
        }
    }

    fn save_into(&self, out: &mut Map<String, Value>) {
        out.insert("type".into(), json!(self.point_type.code()));
        out.insert("size".into(), json!(self.size));
        out.insert("rotate".into(), json!(self.rotation));
    }

    fn load_from(&mut self, value: &Value) {
        if let Some(code) = value.get("type").and_then(Value::as_i64) {
            self.point_type = PointType::from_code(code);
        }
        self.size = get_f32(value, "size", self.size);
        self.rotation = get_f32(value, "rotate", self.rotation);
    }
}

/// Point drawn as a small triangulated shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveParams {
    pub point: PointParams,
    pub segment_count: u8,
    pub star_ends: u8,
}

impl PrimitiveParams {
    fn with_type(point_type: PointType) -> Self {
        Self {
            point: PointParams::with_type(point_type),
            segment_count: 10,
            star_ends: 5,
        }
    }

    pub fn footprint(&self) -> Footprint {
        match self.point.point_type {
            PointType::Square | PointType::Rectangle | PointType::Diamond => Footprint::new(4, 6),
            PointType::Circle => {
                let n = 3 * usize::from(self.segment_count);
                Footprint::new(n, n)
            }
            PointType::Triangle => Footprint::new(3, 3),
            PointType::Star => {
                let n = 3 * usize::from(self.star_ends);
                Footprint::new(n, n)
            }
            PointType::Unknown | PointType::Marker => Footprint::NONE,
        }
    }

    pub fn add_point(&self, pt: &SimplePoint, z: f32, mut index: u16, buffer: &mut GlBuffer) -> u16 {
        match self.point.point_type {
            PointType::Square | PointType::Rectangle => {
                let (hx, hy) = if self.point.point_type == PointType::Square {
                    (NORMAL_45, NORMAL_45)
                } else {
                    (NORMAL_60, 0.5)
                };
                add_vertex5(buffer, pt, z, -hx, -hy);
                add_vertex5(buffer, pt, z, -hx, hy);
                add_vertex5(buffer, pt, z, hx, hy);
                add_vertex5(buffer, pt, z, hx, -hy);
                for offset in [0, 1, 2, 0, 2, 3] {
                    buffer.add_index(index + offset);
                }
                index += 4;
            }
            PointType::Circle => {
                let step = 2.0 * PI / f32::from(self.segment_count);
                let mut current = 0.0f32;
                for _ in 0..self.segment_count {
                    add_vertex5(buffer, pt, z, current.cos(), current.sin());
                    current += step;
                    add_vertex5(buffer, pt, z, current.cos(), current.sin());
                    add_vertex5(buffer, pt, z, 0.0, 0.0);
                    index = add_sequential(buffer, index, 3);
                }
            }
            PointType::Triangle => {
                add_vertex5(buffer, pt, z, 0.0, 1.0);
                add_vertex5(buffer, pt, z, NORMAL_60, -0.5);
                add_vertex5(buffer, pt, z, -NORMAL_60, -0.5);
                index = add_sequential(buffer, index, 3);
            }
            PointType::Diamond => {
                add_vertex5(buffer, pt, z, 0.0, 1.0);
                add_vertex5(buffer, pt, z, NORMAL_45, 0.0);
                add_vertex5(buffer, pt, z, -NORMAL_45, 0.0);
                add_vertex5(buffer, pt, z, 0.0, -1.0);
                for offset in [0, 1, 2, 1, 2, 3] {
                    buffer.add_index(index + offset);
                }
                index += 4;
            }
            PointType::Star => {
                let step = 2.0 * PI / f32::from(self.star_ends);
                let mut current = FRAC_PI_2;
                for _ in 0..self.star_ends {
                    let side = current + FRAC_PI_2;
                    let left = (side.cos() * STAR_INNER_RADIUS, side.sin() * STAR_INNER_RADIUS);
                    add_vertex5(buffer, pt, z, current.cos(), current.sin());
                    add_vertex5(buffer, pt, z, left.0, left.1);
                    add_vertex5(buffer, pt, z, -left.0, -left.1);
                    index = add_sequential(buffer, index, 3);
                    current += step;
                }
            }
            PointType::Unknown | PointType::Marker => {}
        }
        index
    }
}

/// Texture coordinates of one icon inside its atlas.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvRect {
    pub ulx: f32,
    pub uly: f32,
    pub lrx: f32,
    pub lry: f32,
}

impl UvRect {
    /// Locates icon `index` in a square atlas of `atlas_size` pixels laid
    /// out row by row. `inset` pulls the far edge in by one pixel.
    pub fn for_icon(index: u16, icon_width: u8, icon_height: u8, atlas_size: u32, inset: bool) -> Self {
        if atlas_size == 0 || icon_width == 0 {
            return Self::default();
        }
        let iw = u32::from(icon_width);
        let ih = u32::from(icon_height);
        let icons_in_line = (atlas_size / iw).max(1);
        let line = u32::from(index) / icons_in_line;
        let icon_in_line = u32::from(index) - line * icons_in_line;
        let w = icon_in_line * iw;
        let h = line * ih;
        let off = if inset { 1 } else { 0 };
        let size = atlas_size as f32;
        Self {
            ulx: (w + iw - off) as f32 / size,
            uly: (h + ih - off) as f32 / size,
            lrx: w as f32 / size,
            lry: h as f32 / size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerParams {
    pub point: PointParams,
    pub icon_index: u16,
    pub icon_width: u8,
    pub icon_height: u8,
    pub iconset_name: String,
    pub uv: UvRect,
    icon: Option<Image>,
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            point: PointParams::with_type(PointType::Marker),
            icon_index: 0,
            icon_width: 16,
            icon_height: 16,
            iconset_name: String::new(),
            uv: UvRect::default(),
            icon: None,
        }
    }
}

impl MarkerParams {
    pub const FOOTPRINT: Footprint = Footprint::new(4, 6);

    pub fn has_icon(&self) -> bool {
        self.icon.is_some()
    }

    pub fn set_icon(&mut self, atlas: &TextureAtlas, name: &str, index: u16, width: u8, height: u8) {
        self.iconset_name = name.to_string();
        self.icon_index = index;
        self.icon_width = width;
        self.icon_height = height;
        self.icon = atlas.get(name).cloned();
        let atlas_size = self.icon.as_ref().map_or(0, |image| image.width);
        self.uv = UvRect::for_icon(index, width, height, atlas_size, true);
    }

    /// Switches to another icon of the current set.
    pub fn set_index(&mut self, index: u16) {
        if let Some(image) = &self.icon {
            self.uv = UvRect::for_icon(index, self.icon_width, self.icon_height, image.width, false);
        }
    }

    pub fn add_point(&self, pt: &SimplePoint, z: f32, index: u16, buffer: &mut GlBuffer) -> u16 {
        let height = f32::from(self.icon_height.max(1));
        let alpha = (f32::from(self.icon_width) / height).atan();
        let rotation = (180.0 - self.point.rotation).to_radians();

        let n1 = ((alpha + rotation).cos(), (alpha + rotation).sin());
        let n2 = ((PI - alpha + rotation).cos(), (PI - alpha + rotation).sin());
        let uv = self.uv;

        buffer.add_vertex(&[pt.x, pt.y, z, n1.0, n1.1, uv.lrx, uv.uly]);
        buffer.add_vertex(&[pt.x, pt.y, z, n2.0, n2.1, uv.ulx, uv.uly]);
        buffer.add_vertex(&[pt.x, pt.y, z, -n1.0, -n1.1, uv.ulx, uv.lry]);
        buffer.add_vertex(&[pt.x, pt.y, z, -n2.0, -n2.1, uv.lrx, uv.lry]);

        for offset in [0, 1, 2, 0, 2, 3] {
            buffer.add_index(index + offset);
        }
        index + 4
    }

    fn save_into(&self, out: &mut Map<String, Value>) {
        self.point.save_into(out);
        out.insert("icon_index".into(), json!(self.icon_index));
        out.insert("icon_width".into(), json!(self.icon_width));
        out.insert("icon_height".into(), json!(self.icon_height));
        out.insert("iconset_name".into(), json!(self.iconset_name));
    }

    fn load_from(&mut self, value: &Value) {
        self.point.load_from(value);
        self.point.point_type = PointType::Marker;
        self.icon_index = get_u16(value, "icon_index", 0);
        self.icon_width = get_u8(value, "icon_width", 16);
        self.icon_height = get_u8(value, "icon_height", 16);
        self.iconset_name = value
            .get("iconset_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }
}

/// Outline drawn around fills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Border {
    pub line: LineParams,
    pub color: Rgba,
}

/// Icon indices a marker edit point switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditIcons {
    pub point: u16,
    pub selected_point: u16,
    pub walk_point: u16,
    pub median_point: u16,
    pub selected_median_point: u16,
}

impl EditIcons {
    fn index_for(&self, element: EditElementType) -> Option<u16> {
        match element {
            EditElementType::Point => Some(self.point),
            EditElementType::SelectedPoint => Some(self.selected_point),
            EditElementType::WalkPoint => Some(self.walk_point),
            EditElementType::MedianPoint => Some(self.median_point),
            EditElementType::SelectedMedianPoint => Some(self.selected_median_point),
            _ => None,
        }
    }
}

fn edit_point_color(element: EditElementType) -> Option<Rgba> {
    match element {
        EditElementType::Point => Some(EDIT_POINT_COLOR),
        EditElementType::SelectedPoint => Some(EDIT_SELECTED_POINT_COLOR),
        EditElementType::WalkPoint => Some(EDIT_WALK_POINT_COLOR),
        EditElementType::MedianPoint => Some(EDIT_MEDIAN_POINT_COLOR),
        EditElementType::SelectedMedianPoint => Some(EDIT_SELECTED_MEDIAN_POINT_COLOR),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StyleBody {
    Image,
    SimplePoint(PointParams),
    PrimitivePoint(PrimitiveParams),
    Marker(MarkerParams),
    Line(LineParams),
    Fill {
        border: Option<Border>,
    },
    /// Current position marker.
    Location {
        status: LocationStatus,
        base: Box<StyleBody>,
        stay_index: u16,
        move_index: u16,
    },
    /// Vertex handles of an edited geometry. Marker bases switch icons,
    /// primitive bases switch colours.
    EditPoint {
        base: Box<StyleBody>,
        icons: Option<EditIcons>,
    },
    EditLine {
        line: LineParams,
        line_color: Rgba,
        selected_line_color: Rgba,
    },
    EditFill {
        fill_color: Rgba,
        selected_fill_color: Rgba,
    },
}

impl StyleBody {
    fn kind(&self) -> StyleKind {
        match self {
            StyleBody::Image => StyleKind::Image,
            StyleBody::SimplePoint(_)
            | StyleBody::PrimitivePoint(_)
            | StyleBody::Marker(_)
            | StyleBody::Location { .. }
            | StyleBody::EditPoint { .. } => StyleKind::Point,
            StyleBody::Line(_) | StyleBody::EditLine { .. } => StyleKind::Line,
            StyleBody::Fill { .. } | StyleBody::EditFill { .. } => StyleKind::Fill,
        }
    }

    /// The drawable point body, looking through location and edit wrappers.
    fn point_body(&self) -> &StyleBody {
        match self {
            StyleBody::Location { base, .. } | StyleBody::EditPoint { base, .. } => base.point_body(),
            other => other,
        }
    }

    fn marker_mut(&mut self) -> Option<&mut MarkerParams> {
        match self {
            StyleBody::Marker(marker) => Some(marker),
            StyleBody::Location { base, .. } | StyleBody::EditPoint { base, .. } => base.marker_mut(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    name: StyleName,
    kind: StyleKind,
    color: Rgba,
    body: StyleBody,
}

impl Style {
    fn new(name: StyleName, body: StyleBody) -> Self {
        Self {
            name,
            kind: body.kind(),
            color: DEFAULT_COLOR,
            body,
        }
    }

    fn with_color(mut self, color: Rgba) -> Self {
        self.color = color;
        self
    }

    pub fn simple_image() -> Self {
        Self::new(StyleName::SimpleImage, StyleBody::Image)
    }

    pub fn simple_point() -> Self {
        Self::new(StyleName::SimplePoint, StyleBody::SimplePoint(PointParams::default()))
    }

    pub fn primitive_point() -> Self {
        Self::new(
            StyleName::PrimitivePoint,
            StyleBody::PrimitivePoint(PrimitiveParams::with_type(PointType::Circle)),
        )
    }

    pub fn marker() -> Self {
        Self::new(StyleName::Marker, StyleBody::Marker(MarkerParams::default()))
    }

    pub fn simple_line() -> Self {
        Self::new(StyleName::SimpleLine, StyleBody::Line(LineParams::default()))
    }

    pub fn simple_fill() -> Self {
        Self::new(StyleName::SimpleFill, StyleBody::Fill { border: None })
    }

    pub fn simple_fill_bordered() -> Self {
        Self::new(
            StyleName::SimpleFillBordered,
            StyleBody::Fill {
                border: Some(Border {
                    line: LineParams::default(),
                    color: BORDER_COLOR,
                }),
            },
        )
    }

    pub fn simple_location() -> Self {
        Self::new(
            StyleName::SimpleLocation,
            StyleBody::Location {
                status: LocationStatus::Stay,
                base: Box::new(StyleBody::PrimitivePoint(PrimitiveParams::with_type(
                    PointType::Circle,
                ))),
                stay_index: 0,
                move_index: 0,
            },
        )
    }

    pub fn marker_location() -> Self {
        Self::new(
            StyleName::MarkerLocation,
            StyleBody::Location {
                status: LocationStatus::Stay,
                base: Box::new(StyleBody::Marker(MarkerParams::default())),
                stay_index: 0,
                move_index: 0,
            },
        )
    }

    pub fn simple_edit_point() -> Self {
        Self::new(
            StyleName::SimpleEditPoint,
            StyleBody::EditPoint {
                base: Box::new(StyleBody::PrimitivePoint(PrimitiveParams::with_type(
                    PointType::Star,
                ))),
                icons: None,
            },
        )
        .with_color(EDIT_POINT_COLOR)
    }

    pub fn marker_edit_point() -> Self {
        Self::new(
            StyleName::MarkerEditPoint,
            StyleBody::EditPoint {
                base: Box::new(StyleBody::Marker(MarkerParams::default())),
                icons: Some(EditIcons::default()),
            },
        )
    }

    pub fn edit_line() -> Self {
        Self::new(
            StyleName::EditLine,
            StyleBody::EditLine {
                line: LineParams {
                    width: 10.0,
                    ..LineParams::default()
                },
                line_color: EDIT_LINE_COLOR,
                selected_line_color: EDIT_SELECTED_LINE_COLOR,
            },
        )
        .with_color(EDIT_LINE_COLOR)
    }

    pub fn edit_fill() -> Self {
        Self::new(
            StyleName::EditFill,
            StyleBody::EditFill {
                fill_color: EDIT_FILL_COLOR,
                selected_fill_color: EDIT_SELECTED_FILL_COLOR,
            },
        )
        .with_color(EDIT_FILL_COLOR)
    }

    pub fn simple_edit_cross() -> Self {
        Self::new(
            StyleName::SimpleEditCross,
            StyleBody::SimplePoint(PointParams::with_type(PointType::Circle)),
        )
        .with_color(EDIT_CROSS_COLOR)
    }

    pub fn name(&self) -> StyleName {
        self.name
    }

    pub fn kind(&self) -> StyleKind {
        self.kind
    }

    pub fn color(&self) -> Rgba {
        self.color
    }

    pub fn set_color(&mut self, color: Rgba) {
        self.color = color;
    }

    pub fn body(&self) -> &StyleBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut StyleBody {
        &mut self.body
    }

    /// Buffer type the style's points, lines or fills are written to.
    pub fn buffer_type(&self) -> BufferType {
        match self.kind {
            StyleKind::Point => BufferType::Point,
            StyleKind::Line => BufferType::Line,
            StyleKind::Fill => BufferType::Fill,
            StyleKind::Image => BufferType::Texture,
        }
    }

    /// Stroke parameters for line styles and bordered fills.
    pub fn line(&self) -> Option<&LineParams> {
        match &self.body {
            StyleBody::Line(line) | StyleBody::EditLine { line, .. } => Some(line),
            StyleBody::Fill {
                border: Some(border),
            } => Some(&border.line),
            _ => None,
        }
    }

    pub fn point_footprint(&self) -> Footprint {
        match self.body.point_body() {
            StyleBody::SimplePoint(_) => Footprint::new(1, 1),
            StyleBody::PrimitivePoint(primitive) => primitive.footprint(),
            StyleBody::Marker(_) => MarkerParams::FOOTPRINT,
            _ => Footprint::NONE,
        }
    }

    pub fn point_vertices_count(&self) -> usize {
        self.point_footprint().vertices
    }

    pub fn line_cap_vertices_count(&self) -> usize {
        self.line().map_or(0, LineParams::line_cap_vertices_count)
    }

    pub fn line_join_vertices_count(&self) -> usize {
        self.line().map_or(0, LineParams::line_join_vertices_count)
    }

    pub fn add_point(&self, pt: &SimplePoint, z: f32, index: u16, buffer: &mut GlBuffer) -> u16 {
        match self.body.point_body() {
            StyleBody::SimplePoint(_) => {
                buffer.add_vertex(&[pt.x, pt.y, z]);
                buffer.add_index(index);
                index + 1
            }
            StyleBody::PrimitivePoint(primitive) => primitive.add_point(pt, z, index, buffer),
            StyleBody::Marker(marker) => marker.add_point(pt, z, index, buffer),
            _ => index,
        }
    }

    pub fn add_line_cap(
        &self,
        point: &SimplePoint,
        normal: &Normal,
        z: f32,
        index: u16,
        buffer: &mut GlBuffer,
    ) -> u16 {
        match self.line() {
            Some(line) => line.add_line_cap(point, normal, z, index, buffer),
            None => index,
        }
    }

    pub fn add_line_join(
        &self,
        point: &SimplePoint,
        prev_normal: &Normal,
        normal: &Normal,
        z: f32,
        index: u16,
        buffer: &mut GlBuffer,
    ) -> u16 {
        match self.line() {
            Some(line) => line.add_line_join(point, prev_normal, normal, z, index, buffer),
            None => index,
        }
    }

    pub fn add_segment(
        &self,
        pt1: &SimplePoint,
        pt2: &SimplePoint,
        normal: &Normal,
        z: f32,
        index: u16,
        buffer: &mut GlBuffer,
    ) -> u16 {
        add_segment(pt1, pt2, normal, z, index, buffer)
    }

    pub fn set_edit_element(&mut self, element: EditElementType) {
        let color = match &mut self.body {
            StyleBody::EditPoint {
                icons: Some(icons),
                base,
            } => {
                if let (Some(index), Some(marker)) = (icons.index_for(element), base.marker_mut()) {
                    marker.set_index(index);
                }
                None
            }
            StyleBody::EditPoint { icons: None, .. } => edit_point_color(element),
            StyleBody::EditLine {
                line_color,
                selected_line_color,
                ..
            } => match element {
                EditElementType::Line => Some(*line_color),
                EditElementType::SelectedLine => Some(*selected_line_color),
                _ => None,
            },
            StyleBody::EditFill {
                fill_color,
                selected_fill_color,
            } => match element {
                EditElementType::Polygon => Some(*fill_color),
                EditElementType::SelectedPolygon => Some(*selected_fill_color),
                _ => None,
            },
            _ => None,
        };
        if let Some(color) = color {
            self.color = color;
        }
    }

    pub fn set_location_status(&mut self, new_status: LocationStatus) {
        if let StyleBody::Location {
            status,
            base,
            stay_index,
            move_index,
        } = &mut self.body
        {
            *status = new_status;
            let index = match new_status {
                LocationStatus::Stay => *stay_index,
                LocationStatus::Move => *move_index,
            };
            if let Some(marker) = base.marker_mut() {
                marker.set_index(index);
            }
        }
    }

    /// Points marker styles at an icon set.
    pub fn set_icon(&mut self, atlas: &TextureAtlas, name: &str, index: u16, width: u8, height: u8) {
        if let Some(marker) = self.body.marker_mut() {
            marker.set_icon(atlas, name, index, width, height);
        }
        self.refresh_icon_index();
    }

    /// Resolves the stored icon set name of a loaded marker style.
    pub fn attach_icons(&mut self, atlas: &TextureAtlas) {
        let Some(marker) = self.body.marker_mut() else {
            return;
        };
        let name = marker.iconset_name.clone();
        let (index, width, height) = (marker.icon_index, marker.icon_width, marker.icon_height);
        marker.set_icon(atlas, &name, index, width, height);
        self.refresh_icon_index();
    }

    fn refresh_icon_index(&mut self) {
        match &mut self.body {
            StyleBody::Location {
                base, stay_index, status, move_index,
            } => {
                let index = match status {
                    LocationStatus::Stay => *stay_index,
                    LocationStatus::Move => *move_index,
                };
                if let Some(marker) = base.marker_mut() {
                    marker.set_index(index);
                }
            }
            StyleBody::EditPoint {
                base,
                icons: Some(icons),
            } => {
                if let Some(marker) = base.marker_mut() {
                    marker.set_index(icons.point);
                }
            }
            _ => {}
        }
    }

    fn primitive(&self) -> Primitive {
        match self.body.point_body() {
            StyleBody::SimplePoint(_) => Primitive::Points,
            _ => Primitive::Triangles,
        }
    }

    /// Selects the program for `buffer_type` and uploads the uniforms.
    pub fn prepare(
        &mut self,
        ctx: &mut dyn GpuContext,
        scene_matrix: &Matrix4<f32>,
        inv_view_matrix: &Matrix4<f32>,
        buffer_type: BufferType,
    ) -> bool {
        let mut kind = self.kind;
        let mut uniforms = Uniforms::new(scene_matrix, inv_view_matrix, self.color.to_gl());

        match &self.body {
            StyleBody::Image => uniforms.texture_unit = 0,
            StyleBody::Line(line) | StyleBody::EditLine { line, .. } => {
                uniforms.line_width = line.width;
            }
            StyleBody::Fill {
                border: Some(border),
            } if buffer_type == BufferType::Line => {
                kind = StyleKind::Line;
                uniforms.color = border.color.to_gl();
                uniforms.line_width = border.line.width;
            }
            body => match body.point_body() {
                StyleBody::SimplePoint(point) => {
                    uniforms.size = point.size;
                    uniforms.point_type = point.point_type.code() as i32;
                }
                StyleBody::PrimitivePoint(primitive) => {
                    uniforms.line_width = primitive.point.size;
                }
                StyleBody::Marker(marker) => {
                    uniforms.texture_unit = 0;
                    uniforms.line_width = marker.point.size;
                }
                _ => {}
            },
        }

        if let Some(marker) = self.body.marker_mut() {
            if let Some(icon) = marker.icon.as_mut() {
                icon.bind(ctx);
            }
        }

        ctx.use_program(kind, &uniforms)
    }

    pub fn draw(&self, ctx: &mut dyn GpuContext, buffer: &GlBuffer) {
        if buffer.is_empty() {
            return;
        }
        let Some(id) = buffer.gpu_id() else {
            return;
        };
        if let StyleBody::Marker(marker) = self.body.point_body() {
            match &marker.icon {
                Some(icon) if icon.is_bound() => icon.rebind(ctx),
                _ => return,
            }
        }
        ctx.draw_elements(self.primitive(), id, buffer.index_count());
    }

    /// Releases GPU resources owned by the style.
    pub fn destroy(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(icon) = self.body.marker_mut().and_then(|m| m.icon.as_mut()) {
            icon.destroy(ctx);
        }
    }

    pub fn save(&self) -> Value {
        if let StyleBody::Fill {
            border: Some(border),
        } = &self.body
        {
            let mut line = Map::new();
            line.insert("color".into(), color_value(border.color));
            border.line.save_into(&mut line);
            return json!({
                "fill": { "color": color_value(self.color) },
                "line": Value::Object(line),
            });
        }

        let mut out = Map::new();
        out.insert("color".into(), color_value(self.color));

        match &self.body {
            StyleBody::Image | StyleBody::Fill { .. } => {}
            StyleBody::SimplePoint(point) => point.save_into(&mut out),
            StyleBody::PrimitivePoint(primitive) => save_primitive(primitive, &mut out),
            StyleBody::Marker(marker) => marker.save_into(&mut out),
            StyleBody::Line(line) => line.save_into(&mut out),
            StyleBody::Location {
                base,
                stay_index,
                move_index,
                ..
            } => {
                save_point_body(base, &mut out);
                if matches!(**base, StyleBody::Marker(_)) {
                    out.insert("stay_index".into(), json!(stay_index));
                    out.insert("move_index".into(), json!(move_index));
                }
            }
            StyleBody::EditPoint { base, icons } => {
                save_point_body(base, &mut out);
                if let Some(icons) = icons {
                    out.insert("point_index".into(), json!(icons.point));
                    out.insert("selected_point_index".into(), json!(icons.selected_point));
                    out.insert("walk_point_index".into(), json!(icons.walk_point));
                    out.insert("median_point_index".into(), json!(icons.median_point));
                    out.insert(
                        "selected_median_point_index".into(),
                        json!(icons.selected_median_point),
                    );
                }
            }
            StyleBody::EditLine {
                line,
                line_color,
                selected_line_color,
            } => {
                line.save_into(&mut out);
                out.insert("line_color".into(), color_value(*line_color));
                out.insert("selected_line_color".into(), color_value(*selected_line_color));
            }
            StyleBody::EditFill {
                fill_color,
                selected_fill_color,
            } => {
                out.insert("fill_color".into(), color_value(*fill_color));
                out.insert("selected_fill_color".into(), color_value(*selected_fill_color));
            }
        }
        Value::Object(out)
    }

    /// Restores settings written by [`Style::save`]. Marker styles keep the
    /// icon set name only; call [`Style::attach_icons`] to resolve it.
    pub fn load(&mut self, value: &Value) -> Result<()> {
        if !value.is_object() {
            return Err(GeoStoreError::Unsupported(format!("style {}", self.name)));
        }
        if let StyleBody::Fill {
            border: Some(border),
        } = &mut self.body
        {
            let fill = value.get("fill").unwrap_or(&Value::Null);
            self.color = get_color(fill, "color", self.color);
            if let Some(line) = value.get("line") {
                border.color = get_color(line, "color", border.color);
                border.line.load_from(line);
            }
            return Ok(());
        }

        self.color = get_color(value, "color", self.color);
        match &mut self.body {
            StyleBody::Image | StyleBody::Fill { .. } => {}
            StyleBody::SimplePoint(point) => point.load_from(value),
            StyleBody::PrimitivePoint(primitive) => load_primitive(primitive, value),
            StyleBody::Marker(marker) => marker.load_from(value),
            StyleBody::Line(line) => line.load_from(value),
            StyleBody::Location {
                base,
                stay_index,
                move_index,
                ..
            } => {
                load_point_body(base, value);
                *stay_index = get_u16(value, "stay_index", 0);
                *move_index = get_u16(value, "move_index", 0);
            }
            StyleBody::EditPoint { base, icons } => {
                load_point_body(base, value);
                if let Some(icons) = icons {
                    icons.point = get_u16(value, "point_index", 0);
                    icons.selected_point = get_u16(value, "selected_point_index", 0);
                    icons.walk_point = get_u16(value, "walk_point_index", 0);
                    icons.median_point = get_u16(value, "median_point_index", 0);
                    icons.selected_median_point = get_u16(value, "selected_median_point_index", 0);
                }
            }
            StyleBody::EditLine {
                line,
                line_color,
                selected_line_color,
            } => {
                line.load_from(value);
                *line_color = get_color(value, "line_color", *line_color);
                *selected_line_color = get_color(value, "selected_line_color", *selected_line_color);
                self.color = *line_color;
            }
            StyleBody::EditFill {
                fill_color,
                selected_fill_color,
            } => {
                *fill_color = get_color(value, "fill_color", *fill_color);
                *selected_fill_color = get_color(value, "selected_fill_color", *selected_fill_color);
                self.color = *fill_color;
            }
        }
        Ok(())
    }
}

fn save_primitive(primitive: &PrimitiveParams, out: &mut Map<String, Value>) {
    primitive.point.save_into(out);
    out.insert("segments".into(), json!(primitive.segment_count));
    out.insert("starEnds".into(), json!(primitive.star_ends));
}

fn load_primitive(primitive: &mut PrimitiveParams, value: &Value) {
    primitive.point.load_from(value);
    primitive.segment_count = get_u8(value, "segments", primitive.segment_count).max(1);
    primitive.star_ends = get_u8(value, "starEnds", primitive.star_ends).max(1);
}

fn save_point_body(body: &StyleBody, out: &mut Map<String, Value>) {
    match body {
        StyleBody::SimplePoint(point) => point.save_into(out),
        StyleBody::PrimitivePoint(primitive) => save_primitive(primitive, out),
        StyleBody::Marker(marker) => marker.save_into(out),
        _ => {}
    }
}

fn load_point_body(body: &mut StyleBody, value: &Value) {
    match body {
        StyleBody::SimplePoint(point) => point.load_from(value),
        StyleBody::PrimitivePoint(primitive) => load_primitive(primitive, value),
        StyleBody::Marker(marker) => marker.load_from(value),
        _ => {}
    }
}

fn color_value(color: Rgba) -> Value {
    json!({ "r": color.r, "g": color.g, "b": color.b, "a": color.a })
}

fn get_color(value: &Value, key: &str, default: Rgba) -> Rgba {
    value
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(default)
}

fn get_f32(value: &Value, key: &str, default: f32) -> f32 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .map_or(default, |v| v as f32)
}

fn get_u8(value: &Value, key: &str, default: u8) -> u8 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok())
        .unwrap_or(default)
}

fn get_u16(value: &Value, key: &str, default: u16) -> u16 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(default)
}

type StyleConstructor = fn() -> Style;

/// Builds styles by name. Owned by the host next to the map registry.
pub struct StyleRegistry {
    constructors: HashMap<StyleName, StyleConstructor>,
    atlas: TextureAtlas,
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StyleRegistry {
    pub fn new() -> Self {
        Self::with_atlas(TextureAtlas::new())
    }

    pub fn with_atlas(atlas: TextureAtlas) -> Self {
        let constructors: HashMap<StyleName, StyleConstructor> = [
            (StyleName::SimpleImage, Style::simple_image as StyleConstructor),
            (StyleName::SimplePoint, Style::simple_point),
            (StyleName::SimpleLine, Style::simple_line),
            (StyleName::SimpleFill, Style::simple_fill),
            (StyleName::SimpleFillBordered, Style::simple_fill_bordered),
            (StyleName::PrimitivePoint, Style::primitive_point),
            (StyleName::Marker, Style::marker),
            (StyleName::SimpleLocation, Style::simple_location),
            (StyleName::MarkerLocation, Style::marker_location),
            (StyleName::SimpleEditPoint, Style::simple_edit_point),
            (StyleName::MarkerEditPoint, Style::marker_edit_point),
            (StyleName::EditLine, Style::edit_line),
            (StyleName::EditFill, Style::edit_fill),
            (StyleName::SimpleEditCross, Style::simple_edit_cross),
        ]
        .into_iter()
        .collect();
        Self { constructors, atlas }
    }

    pub fn atlas(&self) -> &TextureAtlas {
        &self.atlas
    }

    pub fn add_iconset(&mut self, name: &str, image: Image) {
        self.atlas.insert(name.to_string(), image);
    }

    pub fn create(&self, name: StyleName) -> Result<Style> {
        self.constructors
            .get(&name)
            .map(|construct| construct())
            .ok_or_else(|| GeoStoreError::NotFound(format!("style {}", name)))
    }

    pub fn create_by_name(&self, name: &str) -> Result<Style> {
        self.create(name.parse()?)
    }

    /// Creates the named style and restores its saved settings.
    pub fn load(&self, name: &str, value: &Value) -> Result<Style> {
        let mut style = self.create_by_name(name)?;
        style.load(value)?;
        style.attach_icons(&self.atlas);
        Ok(style)
    }
}
