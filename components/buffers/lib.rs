/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The buffer registry: imports client pixel sources into renderer buffers.
//!
//! Three kinds of sources exist. Shared-memory pools are mapped, guarded
//! against truncation through the bus-fault registry, and validated with
//! overflow-safe arithmetic before a pixmap is created on them. dma-bufs
//! are matched against the negotiated format/modifier table and imported
//! synchronously or optimistically. Single-pixel buffers become 1×1 solid
//! pixmaps.

pub mod formats;
pub mod shm;

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use base::{FxHashMap, SerialGen};
use drm_fourcc::DrmFourcc;
use fault::BusFaultGuard;
use log::debug;
use renderer::{BufferId, BufferOps, DmaBufImport, DmaBufPlane, RenderError, ShmImport};
use rustix::io::fcntl_dupfd_cloexec;
use thiserror::Error;

pub use crate::formats::{DrmFormat, ShmFormat, negotiate_formats};
pub use crate::shm::{ShmError, validate_shm};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("unknown pool")]
    UnknownPool,
    #[error("format not advertised: {0:?}")]
    UnsupportedFormat(DrmFourcc),
    #[error("modifier {0:#x} not advertised for {1:?}")]
    UnsupportedModifier(u64, DrmFourcc),
    #[error("pool descriptor: {0}")]
    Pool(#[from] rustix::io::Errno),
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolId(u64);

/// A client shared-memory pool, mapped for the compositor's own reads and
/// registered with the bus-fault guard so a client truncating it cannot
/// kill us.
struct ShmPool {
    fd: OwnedFd,
    mapping: *mut std::ffi::c_void,
    size: u32,
}

/// Geometry of one buffer inside a pool, as supplied by the client.
#[derive(Clone, Copy, Debug)]
pub struct ShmBufferSpec {
    pub offset: i32,
    pub stride: i32,
    pub width: i32,
    pub height: i32,
    pub format: ShmFormat,
}

#[derive(Debug)]
pub struct DmaBufSpec {
    pub planes: Vec<DmaBufPlane>,
    pub modifier: u64,
    pub fourcc: DrmFourcc,
    pub width: u16,
    pub height: u16,
    /// The client asserted the contents are fully opaque (e.g. an X-channel
    /// format).
    pub opaque: bool,
}

pub struct BufferRegistry {
    fault: Rc<RefCell<BusFaultGuard>>,
    drm_formats: Vec<DrmFormat>,
    shm_formats: Vec<ShmFormat>,
    pools: FxHashMap<PoolId, ShmPool>,
    pool_ids: SerialGen,
}

impl BufferRegistry {
    /// Negotiates the format tables against the host and returns the
    /// registry. `extra_modifiers` come from the user's configuration.
    pub fn new(
        fault: Rc<RefCell<BusFaultGuard>>,
        renderer: &mut dyn BufferOps,
        extra_modifiers: &[u64],
    ) -> Result<Self, ImportError> {
        let drm_formats = negotiate_formats(renderer, extra_modifiers)?;
        let shm_formats = formats::shm_formats(renderer);
        debug!(
            "negotiated {} drm formats, {} shm formats",
            drm_formats.len(),
            shm_formats.len()
        );
        Ok(Self {
            fault,
            drm_formats,
            shm_formats,
            pools: FxHashMap::default(),
            pool_ids: SerialGen::default(),
        })
    }

    pub fn drm_formats(&self) -> &[DrmFormat] {
        &self.drm_formats
    }

    /// The shm formats advertised to clients. ARGB8888 and XRGB8888 are
    /// mandatory; anything else depends on the host's picture formats.
    pub fn shm_formats(&self) -> &[ShmFormat] {
        &self.shm_formats
    }

    pub fn create_pool(&mut self, fd: OwnedFd, size: u32) -> Result<PoolId, ImportError> {
        let mapping = map_pool(&fd, size)?;
        self.fault.borrow_mut().record(mapping as usize, size as usize);
        let id = PoolId(self.pool_ids.next());
        self.pools.insert(
            id,
            ShmPool {
                fd,
                mapping,
                size,
            },
        );
        Ok(id)
    }

    /// Grows a pool in place. Pools never shrink; the protocol layer
    /// rejects that before calling here.
    pub fn resize_pool(&mut self, pool: PoolId, size: u32) -> Result<(), ImportError> {
        let state = self.pools.get_mut(&pool).ok_or(ImportError::UnknownPool)?;
        if size <= state.size {
            return Ok(());
        }
        self.fault.borrow_mut().forget(state.mapping as usize);
        unsafe {
            let _ = rustix::mm::munmap(state.mapping, state.size as usize);
        }
        state.mapping = map_pool(&state.fd, size)?;
        state.size = size;
        self.fault.borrow_mut().record(state.mapping as usize, size as usize);
        Ok(())
    }

    pub fn destroy_pool(&mut self, pool: PoolId) {
        if let Some(state) = self.pools.remove(&pool) {
            self.fault.borrow_mut().forget(state.mapping as usize);
            unsafe {
                let _ = rustix::mm::munmap(state.mapping, state.size as usize);
            }
        }
    }

    /// The pool bytes, for the few consumers that read pixels directly
    /// (cursor images). Reads are bus-fault-guarded: a truncated pool
    /// yields zeroes, not a crash.
    pub fn pool_bytes(&self, pool: PoolId) -> Option<&[u8]> {
        let state = self.pools.get(&pool)?;
        Some(unsafe {
            std::slice::from_raw_parts(state.mapping.cast::<u8>(), state.size as usize)
        })
    }

    pub fn create_shm_buffer(
        &mut self,
        renderer: &mut dyn BufferOps,
        pool: PoolId,
        spec: ShmBufferSpec,
    ) -> Result<BufferId, ImportError> {
        let state = self.pools.get(&pool).ok_or(ImportError::UnknownPool)?;
        let format = formats::shm_format_info(renderer, spec.format)
            .ok_or(ImportError::UnsupportedFormat(spec.format.fourcc()))?;
        validate_shm(
            spec.offset,
            spec.stride,
            spec.width,
            spec.height,
            state.size,
            u32::from(format.bpp),
            u32::from(format.scanline_pad),
        )?;
        let pool_fd = fcntl_dupfd_cloexec(&state.fd, 0)?;
        let buffer = renderer.create_shm_buffer(ShmImport {
            pool_fd,
            pool_size: state.size,
            offset: spec.offset as u32,
            stride: spec.stride as u32,
            width: spec.width as u16,
            height: spec.height as u16,
            depth: format.depth,
            pictformat: format.id,
            opaque: spec.format.is_opaque(),
        })?;
        Ok(buffer)
    }

    fn dmabuf_import(&self, spec: DmaBufSpec) -> Result<DmaBufImport, ImportError> {
        let format = self
            .drm_formats
            .iter()
            .find(|format| format.fourcc == spec.fourcc)
            .ok_or(ImportError::UnsupportedFormat(spec.fourcc))?;
        if !format.modifiers.contains(&spec.modifier) {
            // Returning here drops `spec`, closing every plane fd exactly
            // once.
            return Err(ImportError::UnsupportedModifier(spec.modifier, spec.fourcc));
        }
        Ok(DmaBufImport {
            planes: spec.planes,
            modifier: spec.modifier,
            width: spec.width,
            height: spec.height,
            depth: format.depth,
            bpp: format.bpp,
            pictformat: format.pictformat,
            opaque: spec.opaque || !format.has_alpha,
        })
    }

    pub fn create_dmabuf_buffer(
        &mut self,
        renderer: &mut dyn BufferOps,
        spec: DmaBufSpec,
    ) -> Result<BufferId, ImportError> {
        let import = self.dmabuf_import(spec)?;
        Ok(renderer.create_dmabuf_buffer(import)?)
    }

    /// The optimistic path for the common case where errors are rare: the
    /// pixmap request is issued immediately and a forced round trip resolves
    /// `done` once the host has accepted or rejected it.
    pub fn create_dmabuf_buffer_async(
        &mut self,
        renderer: &mut dyn BufferOps,
        spec: DmaBufSpec,
        done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
    ) -> Result<(), ImportError> {
        let import = self.dmabuf_import(spec)?;
        renderer.create_dmabuf_buffer_async(import, done)?;
        Ok(())
    }

    /// A solid-color buffer from 32-bit channel values, scaled to the
    /// 16-bit channels of the host fill request.
    pub fn create_single_pixel_buffer(
        &mut self,
        renderer: &mut dyn BufferOps,
        red: u32,
        green: u32,
        blue: u32,
        alpha: u32,
    ) -> Result<BufferId, ImportError> {
        Ok(renderer.create_single_pixel_buffer(
            (red >> 16) as u16,
            (green >> 16) as u16,
            (blue >> 16) as u16,
            (alpha >> 16) as u16,
        )?)
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        let pools: Vec<PoolId> = self.pools.keys().copied().collect();
        for pool in pools {
            self.destroy_pool(pool);
        }
    }
}

fn map_pool(fd: &OwnedFd, size: u32) -> Result<*mut std::ffi::c_void, ImportError> {
    let mapping = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size as usize,
            rustix::mm::ProtFlags::READ,
            rustix::mm::MapFlags::SHARED,
            fd,
            0,
        )
    }?;
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use renderer::{BufferFlags, IdleHandle, PictureFormat};
    use rustix::fs::{MemfdFlags, memfd_create};

    use super::*;

    /// Records imports; geometry and formats mimic a stock 24/32-bit host.
    #[derive(Default)]
    struct ImportHost {
        formats: Vec<PictureFormat>,
        shm_imports: Rc<RefCell<Vec<(u32, u32, u16, u16)>>>,
        dmabuf_plane_counts: Rc<RefCell<Vec<usize>>>,
        single_pixels: Rc<RefCell<Vec<[u16; 4]>>>,
        next_buffer: u64,
    }

    impl ImportHost {
        fn new() -> Self {
            let argb = PictureFormat {
                id: 1,
                depth: 32,
                bpp: 32,
                scanline_pad: 32,
                red_mask: 0xff,
                green_mask: 0xff,
                blue_mask: 0xff,
                alpha_mask: 0xff,
                red_shift: 16,
                green_shift: 8,
                blue_shift: 0,
                alpha_shift: 24,
            };
            let xrgb = PictureFormat {
                id: 2,
                depth: 24,
                alpha_mask: 0,
                alpha_shift: 0,
                ..argb
            };
            ImportHost {
                formats: vec![argb, xrgb],
                ..Default::default()
            }
        }
    }

    impl BufferOps for ImportHost {
        fn create_shm_buffer(&mut self, import: ShmImport) -> Result<BufferId, RenderError> {
            self.shm_imports.borrow_mut().push((
                import.offset,
                import.stride,
                import.width,
                import.height,
            ));
            self.next_buffer += 1;
            Ok(BufferId(self.next_buffer))
        }

        fn create_dmabuf_buffer(&mut self, import: DmaBufImport) -> Result<BufferId, RenderError> {
            self.dmabuf_plane_counts.borrow_mut().push(import.planes.len());
            self.next_buffer += 1;
            Ok(BufferId(self.next_buffer))
        }

        fn create_dmabuf_buffer_async(
            &mut self,
            import: DmaBufImport,
            done: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
        ) -> Result<(), RenderError> {
            done(self.create_dmabuf_buffer(import));
            Ok(())
        }

        fn create_single_pixel_buffer(
            &mut self,
            red: u16,
            green: u16,
            blue: u16,
            alpha: u16,
        ) -> Result<BufferId, RenderError> {
            self.single_pixels.borrow_mut().push([red, green, blue, alpha]);
            self.next_buffer += 1;
            Ok(BufferId(self.next_buffer))
        }

        fn free_buffer(&mut self, _buffer: BufferId) {}

        fn buffer_flags(&self, _buffer: BufferId) -> BufferFlags {
            BufferFlags::empty()
        }

        fn add_idle_callback(
            &mut self,
            _buffer: BufferId,
            _target: renderer::TargetId,
            _callback: renderer::IdleCallback,
        ) -> IdleHandle {
            unimplemented!("not used by the registry")
        }

        fn cancel_idle_callback(&mut self, _handle: IdleHandle) {}

        fn is_buffer_idle(&self, _buffer: BufferId, _target: renderer::TargetId) -> bool {
            true
        }

        fn wait_for_idle(
            &mut self,
            _buffer: BufferId,
            _target: renderer::TargetId,
        ) -> Result<(), RenderError> {
            Ok(())
        }

        fn set_need_wait_for_idle(&mut self, _target: renderer::TargetId, _needed: bool) {}

        fn picture_formats(&self) -> &[PictureFormat] {
            &self.formats
        }

        fn supported_modifiers(&mut self, _depth: u8, _bpp: u8) -> Result<Vec<u64>, RenderError> {
            Ok(vec![0x0100_0000_0000_0002])
        }

        fn render_device_fd(&mut self) -> Result<OwnedFd, RenderError> {
            Err(RenderError::Unsupported)
        }
    }

    fn pool_fd(size: u64) -> OwnedFd {
        let fd = memfd_create("test-pool", MemfdFlags::CLOEXEC).expect("memfd");
        rustix::fs::ftruncate(&fd, size).expect("size pool");
        fd
    }

    fn plane(fd_size: u64) -> DmaBufPlane {
        DmaBufPlane {
            fd: pool_fd(fd_size),
            offset: 0,
            stride: 256,
        }
    }

    #[test]
    fn registry_validates_and_imports() {
        let guard = Rc::new(RefCell::new(fault::BusFaultGuard::new_untrapped()));
        let mut host = ImportHost::new();
        let mut registry =
            BufferRegistry::new(guard, &mut host, &[]).expect("negotiate");
        assert_eq!(registry.drm_formats().len(), 2);
        assert_eq!(
            registry.shm_formats(),
            &[ShmFormat::Argb8888, ShmFormat::Xrgb8888]
        );

        // A valid 64x64 ARGB buffer inside a pool.
        let pool = registry
            .create_pool(pool_fd(64 * 256), 64 * 256)
            .expect("pool");
        let spec = ShmBufferSpec {
            offset: 0,
            stride: 256,
            width: 64,
            height: 64,
            format: ShmFormat::Argb8888,
        };
        registry
            .create_shm_buffer(&mut host, pool, spec)
            .expect("import");
        assert_eq!(*host.shm_imports.borrow(), vec![(0, 256, 64, 64)]);

        // Bad stride is rejected before the renderer sees anything.
        let bad = ShmBufferSpec {
            stride: 260,
            ..spec
        };
        match registry.create_shm_buffer(&mut host, pool, bad) {
            Err(ImportError::Shm(ShmError::BadStride { expected: 256, .. })) => {},
            other => panic!("expected stride rejection, got {other:?}"),
        }
        assert_eq!(host.shm_imports.borrow().len(), 1);

        // Growing the pool keeps the mapping registered.
        registry.resize_pool(pool, 128 * 256).expect("resize");
        assert_eq!(
            registry.pool_bytes(pool).map(|bytes| bytes.len()),
            Some(128 * 256)
        );
        registry.destroy_pool(pool);
    }

    #[test]
    fn unknown_modifier_is_rejected_and_plane_fds_close_once() {
        let guard = Rc::new(RefCell::new(fault::BusFaultGuard::new_untrapped()));
        let mut host = ImportHost::new();
        let mut registry =
            BufferRegistry::new(guard, &mut host, &[]).expect("negotiate");

        let spec = DmaBufSpec {
            planes: vec![plane(4096), plane(4096)],
            modifier: 0xdead_beef,
            fourcc: DrmFourcc::Argb8888,
            width: 64,
            height: 64,
            opaque: false,
        };
        match registry.create_dmabuf_buffer(&mut host, spec) {
            Err(ImportError::UnsupportedModifier(0xdead_beef, DrmFourcc::Argb8888)) => {},
            other => panic!("expected modifier rejection, got {other:?}"),
        }
        // The rejection closed the plane fds; nothing reached the renderer.
        assert!(host.dmabuf_plane_counts.borrow().is_empty());

        // The advertised modifier goes through, asynchronously.
        let done = Rc::new(RefCell::new(None));
        let done_in_callback = done.clone();
        let spec = DmaBufSpec {
            planes: vec![plane(4096)],
            modifier: 0x0100_0000_0000_0002,
            fourcc: DrmFourcc::Argb8888,
            width: 64,
            height: 64,
            opaque: false,
        };
        registry
            .create_dmabuf_buffer_async(
                &mut host,
                spec,
                Box::new(move |result| {
                    *done_in_callback.borrow_mut() = Some(result.expect("import"));
                }),
            )
            .expect("async import");
        assert!(done.borrow().is_some());
        assert_eq!(*host.dmabuf_plane_counts.borrow(), vec![1]);
    }

    #[test]
    fn single_pixel_channels_scale_to_sixteen_bits() {
        let guard = Rc::new(RefCell::new(fault::BusFaultGuard::new_untrapped()));
        let mut host = ImportHost::new();
        let mut registry =
            BufferRegistry::new(guard, &mut host, &[]).expect("negotiate");
        registry
            .create_single_pixel_buffer(&mut host, u32::MAX, 0, 0x8000_0000, u32::MAX)
            .expect("single pixel");
        assert_eq!(
            *host.single_pixels.borrow(),
            vec![[0xffff, 0, 0x8000, 0xffff]]
        );
    }
}
