use std::mem;

/// Vertex layout shared by the raster path and the acceleration structure
/// builds. Positions come first so the triangle data can be consumed in
/// place with a plain stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

#[derive(Clone, Debug)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Four vertices, four faces. The classic demo solid of the hybrid scene.
pub fn tetrahedron_mesh() -> MeshData {
    MeshData {
        vertices: vec![
            Vertex {
                position: [0.0, 0.7, 0.0],
                color: [1.0, 0.2, 0.2, 1.0],
            },
            Vertex {
                position: [-0.7, -0.7, 0.7],
                color: [0.2, 1.0, 0.2, 1.0],
            },
            Vertex {
                position: [0.7, -0.7, 0.7],
                color: [0.2, 0.2, 1.0, 1.0],
            },
            Vertex {
                position: [0.0, -0.7, -0.7],
                color: [1.0, 1.0, 0.2, 1.0],
            },
        ],
        indices: vec![0, 1, 2, 0, 2, 3, 0, 3, 1, 1, 3, 2],
    }
}

/// Unit quad in the XZ plane; the floor instance scales it up.
pub fn plane_mesh() -> MeshData {
    let color = [0.7, 0.7, 0.7, 1.0];
    MeshData {
        vertices: vec![
            Vertex {
                position: [-1.0, 0.0, -1.0],
                color,
            },
            Vertex {
                position: [1.0, 0.0, -1.0],
                color,
            },
            Vertex {
                position: [1.0, 0.0, 1.0],
                color,
            },
            Vertex {
                position: [-1.0, 0.0, 1.0],
                color,
            },
        ],
        indices: vec![0, 2, 1, 0, 3, 2],
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MeshHandle(usize);

impl MeshHandle {
    #[cfg(test)]
    pub(crate) fn for_test(index: usize) -> Self {
        Self(index)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MeshBuffers {
    pub vertex_buf: crate::Buffer,
    pub vertex_count: u32,
    pub index_buf: Option<crate::Buffer>,
    pub index_count: u32,
}

impl MeshBuffers {
    pub fn triangle_count(&self) -> u32 {
        match self.index_buf {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

/// Owns the vertex/index buffers of every distinct mesh for the process
/// lifetime. Everything else references them.
pub struct GeometryStore {
    meshes: Vec<MeshBuffers>,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self { meshes: Vec::new() }
    }

    pub fn upload(
        &mut self,
        gpu: &crate::Context,
        name: &str,
        vertices: &[Vertex],
        indices: Option<&[u32]>,
    ) -> Result<MeshHandle, crate::Error> {
        if vertices.is_empty() {
            return Err(crate::Error::EmptyGeometry);
        }

        let vertex_buf = gpu.create_buffer(crate::BufferDesc {
            name,
            size: (vertices.len() * mem::size_of::<Vertex>()) as u64,
            memory: crate::Memory::Shared,
        })?;
        vertex_buf.write_slice(0, vertices);

        let index_buf = match indices {
            Some(indices) if !indices.is_empty() => {
                let buf = gpu.create_buffer(crate::BufferDesc {
                    name,
                    size: (indices.len() * mem::size_of::<u32>()) as u64,
                    memory: crate::Memory::Shared,
                })?;
                buf.write_slice(0, indices);
                Some(buf)
            }
            _ => None,
        };

        log::debug!(
            "Uploaded mesh {:?}: {} vertices, {} indices",
            name,
            vertices.len(),
            indices.map_or(0, <[u32]>::len),
        );
        self.meshes.push(MeshBuffers {
            vertex_buf,
            vertex_count: vertices.len() as u32,
            index_buf,
            index_count: indices.map_or(0, <[u32]>::len) as u32,
        });
        Ok(MeshHandle(self.meshes.len() - 1))
    }

    pub fn mesh(&self, handle: MeshHandle) -> &MeshBuffers {
        &self.meshes[handle.0]
    }

    pub fn destroy(&mut self, gpu: &crate::Context) {
        for mesh in self.meshes.drain(..) {
            gpu.destroy_buffer(mesh.vertex_buf);
            if let Some(index_buf) = mesh.index_buf {
                gpu.destroy_buffer(index_buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_meshes_are_triangle_lists() {
        let tet = tetrahedron_mesh();
        assert_eq!(tet.vertices.len(), 4);
        assert_eq!(tet.indices.len(), 12);
        assert!(tet.indices.iter().all(|&i| (i as usize) < tet.vertices.len()));

        let plane = plane_mesh();
        assert_eq!(plane.vertices.len(), 4);
        assert_eq!(plane.indices.len(), 6);
        assert!(plane
            .indices
            .iter()
            .all(|&i| (i as usize) < plane.vertices.len()));
    }

    #[test]
    fn vertex_is_tightly_packed() {
        // The acceleration structure build and the raster vertex fetch both
        // assume this stride.
        assert_eq!(mem::size_of::<Vertex>(), 28);
    }
}
