// GPU-side objects: vertex/index buffers, textures and the context trait the
// host implements to upload and draw them.
use bytemuck::{Pod, Zeroable};
use nalgebra::Matrix4;

use crate::render::style::StyleKind;

/// Vertices addressable by a 16-bit index buffer.
pub const MAX_VERTICES: usize = 65535;
pub const MAX_INDICES: usize = MAX_VERTICES * 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Point,
    Line,
    Fill,
    Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Points,
    Triangles,
}

/// Per-draw shader inputs, uploaded as one block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    pub ms_matrix: [[f32; 4]; 4],
    pub vs_matrix: [[f32; 4]; 4],
    pub color: [f32; 4],
    pub size: f32,
    pub line_width: f32,
    pub point_type: i32,
    pub texture_unit: i32,
}

impl Uniforms {
    pub fn new(scene_matrix: &Matrix4<f32>, inv_view_matrix: &Matrix4<f32>, color: [f32; 4]) -> Self {
        Self {
            ms_matrix: (*scene_matrix).into(),
            vs_matrix: (*inv_view_matrix).into(),
            color,
            size: 0.0,
            line_width: 0.0,
            point_type: 0,
            texture_unit: -1,
        }
    }
}

/// Host graphics backend.
///
/// Buffer payloads arrive as raw bytes; vertices are tightly packed `f32`
/// records and indices are `u16`.
pub trait GpuContext {
    fn create_buffer(&mut self, vertices: &[u8], indices: &[u8]) -> u32;
    fn update_buffer(&mut self, id: u32, vertices: &[u8], indices: &[u8]);
    fn bind_buffer(&mut self, id: u32);
    fn delete_buffer(&mut self, id: u32);
    fn create_texture(&mut self, image: &Image) -> u32;
    fn bind_texture(&mut self, id: u32);
    fn delete_texture(&mut self, id: u32);
    /// Selects (compiling on first use) the program for `kind`. Returns false
    /// when the program is unavailable.
    fn use_program(&mut self, kind: StyleKind, uniforms: &Uniforms) -> bool;
    fn draw_elements(&mut self, primitive: Primitive, buffer_id: u32, count: usize);
}

#[derive(Debug, Clone)]
pub struct GlBuffer {
    buffer_type: BufferType,
    vertices: Vec<f32>,
    indices: Vec<u16>,
    vertex_count: usize,
    gpu_id: Option<u32>,
}

impl GlBuffer {
    pub fn new(buffer_type: BufferType) -> Self {
        Self {
            buffer_type,
            vertices: Vec::new(),
            indices: Vec::new(),
            vertex_count: 0,
            gpu_id: None,
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Appends one vertex record.
    pub fn add_vertex(&mut self, record: &[f32]) {
        self.vertices.extend_from_slice(record);
        self.vertex_count += 1;
    }

    pub fn add_index(&mut self, index: u16) {
        self.indices.push(index);
    }

    pub fn can_store(&self, vertices: usize, indices: usize) -> bool {
        self.vertex_count + vertices <= MAX_VERTICES && self.indices.len() + indices <= MAX_INDICES
    }

    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn is_bound(&self) -> bool {
        self.gpu_id.is_some()
    }

    pub fn gpu_id(&self) -> Option<u32> {
        self.gpu_id
    }

    pub fn bind(&mut self, ctx: &mut dyn GpuContext) {
        if self.gpu_id.is_some() || self.indices.is_empty() {
            return;
        }
        let id = ctx.create_buffer(
            bytemuck::cast_slice(&self.vertices),
            bytemuck::cast_slice(&self.indices),
        );
        self.gpu_id = Some(id);
    }

    pub fn rebind(&self, ctx: &mut dyn GpuContext) {
        if let Some(id) = self.gpu_id {
            ctx.bind_buffer(id);
        }
    }

    /// Re-uploads the current contents into the existing GPU buffer.
    pub fn update(&self, ctx: &mut dyn GpuContext) {
        if let Some(id) = self.gpu_id {
            ctx.update_buffer(
                id,
                bytemuck::cast_slice(&self.vertices),
                bytemuck::cast_slice(&self.indices),
            );
        }
    }

    pub fn destroy(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(id) = self.gpu_id.take() {
            ctx.delete_buffer(id);
        }
    }
}

/// A chain of buffers of one type being filled, plus the running index into
/// the current one. A buffer that cannot take the next emission is closed and
/// a fresh one started with the index reset to 0.
#[derive(Debug)]
pub struct BufferSet {
    buffer_type: BufferType,
    done: Vec<GlBuffer>,
    current: GlBuffer,
    pub index: u16,
}

impl BufferSet {
    pub fn new(buffer_type: BufferType) -> Self {
        Self {
            buffer_type,
            done: Vec::new(),
            current: GlBuffer::new(buffer_type),
            index: 0,
        }
    }

    /// Makes room for an emission of the given size. Returns true when the
    /// current buffer was flushed.
    pub fn reserve(&mut self, vertices: usize, indices: usize) -> bool {
        if self.current.can_store(vertices, indices) {
            return false;
        }
        let full = std::mem::replace(&mut self.current, GlBuffer::new(self.buffer_type));
        self.done.push(full);
        self.index = 0;
        true
    }

    pub fn buffer(&mut self) -> &mut GlBuffer {
        &mut self.current
    }

    /// Number of buffers closed so far.
    pub fn flushes(&self) -> usize {
        self.done.len()
    }

    /// All buffers, the partially filled one last.
    pub fn finish(mut self) -> Vec<GlBuffer> {
        self.done.push(self.current);
        self.done
    }
}

/// RGBA8 pixel block uploaded as a texture.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub smooth: bool,
    gpu_id: Option<u32>,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
            smooth: false,
            gpu_id: None,
        }
    }

    pub fn gpu_id(&self) -> Option<u32> {
        self.gpu_id
    }

    pub fn is_bound(&self) -> bool {
        self.gpu_id.is_some()
    }

    pub fn bind(&mut self, ctx: &mut dyn GpuContext) {
        if self.gpu_id.is_none() {
            self.gpu_id = Some(ctx.create_texture(self));
        }
    }

    pub fn rebind(&self, ctx: &mut dyn GpuContext) {
        if let Some(id) = self.gpu_id {
            ctx.bind_texture(id);
        }
    }

    pub fn destroy(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(id) = self.gpu_id.take() {
            ctx.delete_texture(id);
        }
    }
}

// Pixel identity only; upload state is not part of an image's value.
impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.smooth == other.smooth
            && self.pixels == other.pixels
    }
}

/// Filled GPU payload for one tile of one layer.
#[derive(Debug, Clone)]
pub enum TileObject {
    Vector {
        buffers: Vec<GlBuffer>,
    },
    Selectable {
        buffers: Vec<GlBuffer>,
        selection: Vec<GlBuffer>,
    },
    Raster {
        buffer: GlBuffer,
        image: Image,
    },
}

impl TileObject {
    pub fn bind(&mut self, ctx: &mut dyn GpuContext) {
        match self {
            TileObject::Vector { buffers } => buffers.iter_mut().for_each(|b| b.bind(ctx)),
            TileObject::Selectable { buffers, selection } => {
                buffers.iter_mut().for_each(|b| b.bind(ctx));
                selection.iter_mut().for_each(|b| b.bind(ctx));
            }
            TileObject::Raster { buffer, image } => {
                image.bind(ctx);
                buffer.bind(ctx);
            }
        }
    }

    pub fn rebind(&self, ctx: &mut dyn GpuContext) {
        match self {
            TileObject::Vector { buffers } => buffers.iter().for_each(|b| b.rebind(ctx)),
            TileObject::Selectable { buffers, selection } => {
                buffers.iter().for_each(|b| b.rebind(ctx));
                selection.iter().for_each(|b| b.rebind(ctx));
            }
            TileObject::Raster { buffer, image } => {
                image.rebind(ctx);
                buffer.rebind(ctx);
            }
        }
    }

    pub fn destroy(&mut self, ctx: &mut dyn GpuContext) {
        match self {
            TileObject::Vector { buffers } => buffers.iter_mut().for_each(|b| b.destroy(ctx)),
            TileObject::Selectable { buffers, selection } => {
                buffers.iter_mut().for_each(|b| b.destroy(ctx));
                selection.iter_mut().for_each(|b| b.destroy(ctx));
            }
            TileObject::Raster { buffer, image } => {
                image.destroy(ctx);
                buffer.destroy(ctx);
            }
        }
    }

    /// Uploads whatever is not on the GPU yet and rebinds the rest.
    pub fn activate(&mut self, ctx: &mut dyn GpuContext) {
        fn activate_buffer(buffer: &mut GlBuffer, ctx: &mut dyn GpuContext) {
            if buffer.is_bound() {
                buffer.rebind(ctx);
            } else {
                buffer.bind(ctx);
            }
        }

        match self {
            TileObject::Vector { buffers } => {
                buffers.iter_mut().for_each(|b| activate_buffer(b, ctx));
            }
            TileObject::Selectable { buffers, selection } => {
                buffers.iter_mut().for_each(|b| activate_buffer(b, ctx));
                selection.iter_mut().for_each(|b| activate_buffer(b, ctx));
            }
            TileObject::Raster { buffer, image } => {
                if image.is_bound() {
                    image.rebind(ctx);
                } else {
                    image.bind(ctx);
                }
                activate_buffer(buffer, ctx);
            }
        }
    }

    /// Buffers drawn with the layer style.
    pub fn buffers(&self) -> &[GlBuffer] {
        match self {
            TileObject::Vector { buffers } | TileObject::Selectable { buffers, .. } => buffers,
            TileObject::Raster { buffer, .. } => std::slice::from_ref(buffer),
        }
    }

    pub fn selection(&self) -> &[GlBuffer] {
        match self {
            TileObject::Selectable { selection, .. } => selection,
            _ => &[],
        }
    }
}

/// Call log entry of [`RecordingContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateBuffer { id: u32, vertex_bytes: usize, index_bytes: usize },
    UpdateBuffer(u32),
    BindBuffer(u32),
    DeleteBuffer(u32),
    CreateTexture { id: u32, width: u32, height: u32 },
    BindTexture(u32),
    DeleteTexture(u32),
    UseProgram(StyleKind, Uniforms),
    DrawElements(Primitive, u32, usize),
}

/// Backend that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingContext {
    pub calls: Vec<GpuCall>,
    next_id: u32,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn draws(&self) -> Vec<(Primitive, u32, usize)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                GpuCall::DrawElements(p, id, count) => Some((*p, *id, *count)),
                _ => None,
            })
            .collect()
    }

    pub fn programs(&self) -> Vec<(StyleKind, Uniforms)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                GpuCall::UseProgram(kind, u) => Some((*kind, *u)),
                _ => None,
            })
            .collect()
    }
}

impl GpuContext for RecordingContext {
    fn create_buffer(&mut self, vertices: &[u8], indices: &[u8]) -> u32 {
        let id = self.next();
        self.calls.push(GpuCall::CreateBuffer {
            id,
            vertex_bytes: vertices.len(),
            index_bytes: indices.len(),
        });
        id
    }

    fn update_buffer(&mut self, id: u32, _vertices: &[u8], _indices: &[u8]) {
        self.calls.push(GpuCall::UpdateBuffer(id));
    }

    fn bind_buffer(&mut self, id: u32) {
        self.calls.push(GpuCall::BindBuffer(id));
    }

    fn delete_buffer(&mut self, id: u32) {
        self.calls.push(GpuCall::DeleteBuffer(id));
    }

    fn create_texture(&mut self, image: &Image) -> u32 {
        let id = self.next();
        self.calls.push(GpuCall::CreateTexture {
            id,
            width: image.width,
            height: image.height,
        });
        id
    }

    fn bind_texture(&mut self, id: u32) {
        self.calls.push(GpuCall::BindTexture(id));
    }

    fn delete_texture(&mut self, id: u32) {
        self.calls.push(GpuCall::DeleteTexture(id));
    }

    fn use_program(&mut self, kind: StyleKind, uniforms: &Uniforms) -> bool {
        self.calls.push(GpuCall::UseProgram(kind, *uniforms));
        true
    }

    fn draw_elements(&mut self, primitive: Primitive, buffer_id: u32, count: usize) {
        self.calls.push(GpuCall::DrawElements(primitive, buffer_id, count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_points(set: &mut BufferSet, count: usize) {
        for i in 0..count {
            set.reserve(1, 1);
            let index = set.index;
            let buffer = set.buffer();
            buffer.add_vertex(&[i as f32, 0.0, 0.0]);
            buffer.add_index(index);
            set.index = index.wrapping_add(1);
        }
    }

    #[test]
    fn exactly_max_vertices_fit_in_one_buffer() {
        let mut set = BufferSet::new(BufferType::Point);
        fill_points(&mut set, MAX_VERTICES);
        assert_eq!(set.flushes(), 0);
        let buffers = set.finish();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].vertex_count(), MAX_VERTICES);
    }

    #[test]
    fn one_more_vertex_flushes_once() {
        let mut set = BufferSet::new(BufferType::Point);
        fill_points(&mut set, MAX_VERTICES + 1);
        assert_eq!(set.flushes(), 1);
        let buffers = set.finish();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[1].vertex_count(), 1);
        assert_eq!(buffers[1].indices(), &[0]);
    }

    #[test]
    fn index_ceiling_is_checked() {
        let mut buffer = GlBuffer::new(BufferType::Fill);
        buffer.add_vertex(&[0.0, 0.0, 0.0]);
        assert!(buffer.can_store(0, MAX_INDICES));
        buffer.add_index(0);
        assert!(!buffer.can_store(0, MAX_INDICES));
        assert!(!buffer.can_store(MAX_VERTICES, 0));
    }

    #[test]
    fn bind_uploads_once_and_destroy_releases() {
        let mut ctx = RecordingContext::new();
        let mut buffer = GlBuffer::new(BufferType::Line);
        buffer.add_vertex(&[0.0, 0.0, 0.0, 1.0, 0.0]);
        buffer.add_index(0);

        buffer.bind(&mut ctx);
        buffer.bind(&mut ctx);
        assert_eq!(
            ctx.calls,
            vec![GpuCall::CreateBuffer {
                id: 1,
                vertex_bytes: 20,
                index_bytes: 2
            }]
        );

        buffer.rebind(&mut ctx);
        buffer.destroy(&mut ctx);
        assert!(!buffer.is_bound());
        assert_eq!(ctx.calls[1..], [GpuCall::BindBuffer(1), GpuCall::DeleteBuffer(1)]);
    }

    #[test]
    fn uniforms_are_plain_bytes() {
        let uniforms = Uniforms::new(&Matrix4::identity(), &Matrix4::identity(), [1.0; 4]);
        let bytes: &[u8] = bytemuck::bytes_of(&uniforms);
        assert_eq!(bytes.len(), std::mem::size_of::<Uniforms>());
        assert_eq!(uniforms.ms_matrix[0][0], 1.0);
        assert_eq!(uniforms.ms_matrix[1][0], 0.0);
    }
}
