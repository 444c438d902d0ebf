/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Format negotiation: the host's picture formats are matched against a
//! table of DRM formats by depth, channel layout and bits per pixel; each
//! match is crossed with the host's modifier list plus the implicit
//! modifier, and optionally extra modifier codes from configuration.

use drm_fourcc::{DrmFourcc, DrmModifier};
use renderer::{BufferOps, PictureFormat};

/// The shared-memory formats the registry understands. The first two are
/// mandatory for every client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShmFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
}

impl ShmFormat {
    pub const ALL: [ShmFormat; 3] = [ShmFormat::Argb8888, ShmFormat::Xrgb8888, ShmFormat::Rgb565];

    pub fn fourcc(self) -> DrmFourcc {
        match self {
            ShmFormat::Argb8888 => DrmFourcc::Argb8888,
            ShmFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
            ShmFormat::Rgb565 => DrmFourcc::Rgb565,
        }
    }

    pub fn is_opaque(self) -> bool {
        !layout_for(self.fourcc()).map_or(false, |layout| layout.has_alpha)
    }
}

/// Channel layout of one DRM format, used to identify the matching host
/// picture format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ChannelLayout {
    depth: u8,
    bpp: u8,
    red: (u16, u16),
    green: (u16, u16),
    blue: (u16, u16),
    alpha: (u16, u16),
    has_alpha: bool,
}

const fn channels(
    depth: u8,
    bpp: u8,
    red: (u16, u16),
    green: (u16, u16),
    blue: (u16, u16),
    alpha: (u16, u16),
) -> ChannelLayout {
    ChannelLayout {
        depth,
        bpp,
        red,
        green,
        blue,
        alpha,
        has_alpha: alpha.1 != 0,
    }
}

/// (shift, mask) pairs per channel, masks in the down-shifted convention of
/// the render extension.
const LAYOUTS: &[(DrmFourcc, ChannelLayout)] = &[
    (
        DrmFourcc::Argb8888,
        channels(32, 32, (16, 0xff), (8, 0xff), (0, 0xff), (24, 0xff)),
    ),
    (
        DrmFourcc::Abgr8888,
        channels(32, 32, (0, 0xff), (8, 0xff), (16, 0xff), (24, 0xff)),
    ),
    (
        DrmFourcc::Xrgb8888,
        channels(24, 32, (16, 0xff), (8, 0xff), (0, 0xff), (0, 0)),
    ),
    (
        DrmFourcc::Xbgr8888,
        channels(24, 32, (0, 0xff), (8, 0xff), (16, 0xff), (0, 0)),
    ),
    (
        DrmFourcc::Rgb565,
        channels(16, 16, (11, 0x1f), (5, 0x3f), (0, 0x1f), (0, 0)),
    ),
    (
        DrmFourcc::Xrgb2101010,
        channels(30, 32, (20, 0x3ff), (10, 0x3ff), (0, 0x3ff), (0, 0)),
    ),
];

fn layout_for(fourcc: DrmFourcc) -> Option<ChannelLayout> {
    LAYOUTS
        .iter()
        .find(|(candidate, _)| *candidate == fourcc)
        .map(|(_, layout)| *layout)
}

fn matches(format: &PictureFormat, layout: &ChannelLayout) -> bool {
    format.depth == layout.depth &&
        format.bpp == layout.bpp &&
        (format.red_shift, format.red_mask) == layout.red &&
        (format.green_shift, format.green_mask) == layout.green &&
        (format.blue_shift, format.blue_mask) == layout.blue &&
        (format.alpha_shift, format.alpha_mask) == layout.alpha
}

/// A DRM format the registry advertises: the host picture format it maps
/// to and every modifier accepted for it.
#[derive(Clone, Debug)]
pub struct DrmFormat {
    pub fourcc: DrmFourcc,
    pub pictformat: u32,
    pub depth: u8,
    pub bpp: u8,
    pub has_alpha: bool,
    pub modifiers: Vec<u64>,
}

/// Builds the advertised format list. Every matched format carries the
/// host's explicit modifiers, the implicit-modifier entry, and any extra
/// codes from configuration.
pub fn negotiate_formats(
    renderer: &mut dyn BufferOps,
    extra_modifiers: &[u64],
) -> Result<Vec<DrmFormat>, renderer::RenderError> {
    let mut formats = Vec::new();
    for (fourcc, layout) in LAYOUTS {
        let Some(pictformat) = renderer
            .picture_formats()
            .iter()
            .find(|format| matches(format, layout))
            .map(|format| format.id)
        else {
            continue;
        };
        let mut modifiers = renderer
            .supported_modifiers(layout.depth, layout.bpp)
            .unwrap_or_default();
        let implicit = u64::from(DrmModifier::Invalid);
        if !modifiers.contains(&implicit) {
            modifiers.push(implicit);
        }
        for &extra in extra_modifiers {
            if !modifiers.contains(&extra) {
                modifiers.push(extra);
            }
        }
        formats.push(DrmFormat {
            fourcc: *fourcc,
            pictformat,
            depth: layout.depth,
            bpp: layout.bpp,
            has_alpha: layout.has_alpha,
            modifiers,
        });
    }
    Ok(formats)
}

/// The shm formats the host can actually back with a picture format.
pub fn shm_formats(renderer: &dyn BufferOps) -> Vec<ShmFormat> {
    ShmFormat::ALL
        .into_iter()
        .filter(|format| shm_format_info(renderer, *format).is_some())
        .collect()
}

/// The host picture format for an shm format, when the host has one.
pub fn shm_format_info(renderer: &dyn BufferOps, format: ShmFormat) -> Option<PictureFormat> {
    let layout = layout_for(format.fourcc())?;
    renderer
        .picture_formats()
        .iter()
        .find(|candidate| matches(candidate, &layout))
        .copied()
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;

    use renderer::{
        BufferFlags, BufferId, DmaBufImport, IdleCallback, IdleHandle, RenderError, ShmImport,
        TargetId,
    };

    use super::*;

    /// The fragment of a host that format negotiation sees.
    struct FormatHost {
        formats: Vec<PictureFormat>,
        modifiers: Vec<u64>,
    }

    impl FormatHost {
        fn with_standard_formats() -> Self {
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
            Self {
                formats: vec![argb, xrgb],
                modifiers: vec![0x0100_0000_0000_0001],
            }
        }
    }

    impl BufferOps for FormatHost {
        fn create_shm_buffer(&mut self, _: ShmImport) -> Result<BufferId, RenderError> {
            Err(RenderError::Unsupported)
        }
        fn create_dmabuf_buffer(&mut self, _: DmaBufImport) -> Result<BufferId, RenderError> {
            Err(RenderError::Unsupported)
        }
        fn create_dmabuf_buffer_async(
            &mut self,
            _: DmaBufImport,
            _: Box<dyn FnOnce(Result<BufferId, RenderError>)>,
        ) -> Result<(), RenderError> {
            Err(RenderError::Unsupported)
        }
        fn create_single_pixel_buffer(
            &mut self,
            _: u16,
            _: u16,
            _: u16,
            _: u16,
        ) -> Result<BufferId, RenderError> {
            Err(RenderError::Unsupported)
        }
        fn free_buffer(&mut self, _: BufferId) {}
        fn buffer_flags(&self, _: BufferId) -> BufferFlags {
            BufferFlags::empty()
        }
        fn add_idle_callback(
            &mut self,
            _: BufferId,
            _: TargetId,
            _: IdleCallback,
        ) -> IdleHandle {
            unimplemented!("not used by negotiation")
        }
        fn cancel_idle_callback(&mut self, _: IdleHandle) {}
        fn is_buffer_idle(&self, _: BufferId, _: TargetId) -> bool {
            true
        }
        fn wait_for_idle(&mut self, _: BufferId, _: TargetId) -> Result<(), RenderError> {
            Ok(())
        }
        fn set_need_wait_for_idle(&mut self, _: TargetId, _: bool) {}
        fn picture_formats(&self) -> &[PictureFormat] {
            &self.formats
        }
        fn supported_modifiers(&mut self, _: u8, _: u8) -> Result<Vec<u64>, RenderError> {
            Ok(self.modifiers.clone())
        }
        fn render_device_fd(&mut self) -> Result<OwnedFd, RenderError> {
            Err(RenderError::Unsupported)
        }
    }

    #[test]
    fn negotiation_matches_by_channel_layout() {
        let mut host = FormatHost::with_standard_formats();
        let formats = negotiate_formats(&mut host, &[]).expect("negotiate");
        let fourccs: Vec<DrmFourcc> = formats.iter().map(|f| f.fourcc).collect();
        assert_eq!(fourccs, vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888]);
        assert_eq!(formats[0].pictformat, 1);
        assert_eq!(formats[1].pictformat, 2);
        assert!(formats[0].has_alpha);
        assert!(!formats[1].has_alpha);
    }

    #[test]
    fn every_format_carries_the_implicit_modifier() {
        let mut host = FormatHost::with_standard_formats();
        let formats = negotiate_formats(&mut host, &[]).expect("negotiate");
        for format in &formats {
            assert!(format.modifiers.contains(&u64::from(DrmModifier::Invalid)));
            assert!(format.modifiers.contains(&0x0100_0000_0000_0001));
        }
    }

    #[test]
    fn extra_modifiers_from_configuration_are_added_once() {
        let mut host = FormatHost::with_standard_formats();
        let formats =
            negotiate_formats(&mut host, &[42, 42, 0x0100_0000_0000_0001]).expect("negotiate");
        let modifiers = &formats[0].modifiers;
        assert_eq!(modifiers.iter().filter(|&&m| m == 42).count(), 1);
        assert_eq!(
            modifiers
                .iter()
                .filter(|&&m| m == 0x0100_0000_0000_0001)
                .count(),
            1
        );
    }

    #[test]
    fn mandatory_shm_formats_are_reported() {
        let host = FormatHost::with_standard_formats();
        let formats = shm_formats(&host);
        assert!(formats.contains(&ShmFormat::Argb8888));
        assert!(formats.contains(&ShmFormat::Xrgb8888));
        assert!(!formats.contains(&ShmFormat::Rgb565));
    }

    #[test]
    fn shm_format_info_reports_geometry() {
        let host = FormatHost::with_standard_formats();
        let info = shm_format_info(&host, ShmFormat::Xrgb8888).expect("format");
        assert_eq!((info.depth, info.bpp, info.scanline_pad), (24, 32, 32));
        assert!(ShmFormat::Xrgb8888.is_opaque());
        assert!(!ShmFormat::Argb8888.is_opaque());
    }
}
