// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of component capabilities into the codec definitions exposed to the pipeline.
//!
//! Every video decoder a [`ComponentManager`] advertises becomes a [`CodecDefinition`] named
//! `<package>.<component>`. Sessions are later created from that name, and
//! [`parse_component_name`] recovers the component part of it.

use std::sync::Arc;

use crate::error::CodecError;
use crate::error::CodecResult;
use crate::protocol::CodecKind;
use crate::protocol::ComponentCapability;
use crate::protocol::ComponentRole;
use crate::session::CodecSession;
use crate::session::VideoPixelFormat;
use crate::ComponentManager;

/// Rank given to every hardware decoder.
pub const DEFAULT_RANK: u32 = 100;

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_RAW: &str = "video/raw";
pub const MIME_VIDEO_UNKNOWN: &str = "video/unknown";

/// Layout of a compressed bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitStreamFormat {
    /// Start-code delimited NAL units.
    AnnexB,
}

/// Media accepted or produced by one side of a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    pub mime: &'static str,
    pub bitstream_formats: Vec<BitStreamFormat>,
    /// Supported layouts of raw frames, `None` if unspecified.
    pub pixel_formats: Option<Vec<VideoPixelFormat>>,
}

/// A codec the pipeline can instantiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDefinition {
    /// `<package>.<component>`.
    pub name: String,
    pub kind: CodecKind,
    pub rank: u32,
    pub in_caps: Caps,
    pub out_caps: Caps,
}

impl CodecDefinition {
    /// Creates a session for this codec on top of `manager`.
    pub fn create_session<M: ComponentManager>(&self, manager: Arc<M>) -> CodecSession<M> {
        CodecSession::new(self.name.clone(), manager)
    }
}

/// Returns the component part of a `<package>.<component>` name: everything after the first dot.
pub fn parse_component_name(plugin_name: &str) -> CodecResult<&str> {
    match plugin_name.split_once('.') {
        Some((_, component)) => Ok(component),
        None => {
            log::error!("invalid codec name {}", plugin_name);
            Err(CodecError::InvalidParameter(format!(
                "codec name {} has no package prefix",
                plugin_name
            )))
        }
    }
}

fn input_caps(role: ComponentRole) -> Caps {
    match role {
        ComponentRole::VideoAvc => Caps {
            mime: MIME_VIDEO_AVC,
            bitstream_formats: vec![BitStreamFormat::AnnexB],
            pixel_formats: None,
        },
        ComponentRole::VideoHevc | ComponentRole::Unknown => Caps {
            mime: MIME_VIDEO_UNKNOWN,
            bitstream_formats: Vec::new(),
            pixel_formats: None,
        },
    }
}

/// The list of colour formats ends at the first 0 entry.
fn output_caps(color_formats: &[u32]) -> Caps {
    let pixel_formats: Vec<_> = color_formats
        .iter()
        .take_while(|&&format| format != 0)
        .map(|&format| VideoPixelFormat::from_color_format(format))
        .filter(|&format| format != VideoPixelFormat::Unknown)
        .collect();

    Caps {
        mime: MIME_VIDEO_RAW,
        bitstream_formats: Vec::new(),
        pixel_formats: (!pixel_formats.is_empty()).then_some(pixel_formats),
    }
}

/// Translates `capability` into a codec definition of `package`.
///
/// Returns `None` for anything but video decoders.
pub fn translate_capability(
    capability: &ComponentCapability,
    package: &str,
) -> Option<CodecDefinition> {
    if capability.kind != CodecKind::VideoDecoder {
        log::debug!(
            "skipping {} component {}",
            match capability.kind {
                CodecKind::VideoEncoder => "video encoder",
                CodecKind::AudioDecoder => "audio decoder",
                CodecKind::AudioEncoder => "audio encoder",
                CodecKind::VideoDecoder => "video decoder",
            },
            capability.name
        );
        return None;
    }

    Some(CodecDefinition {
        name: format!("{}.{}", package, capability.name),
        kind: capability.kind,
        rank: DEFAULT_RANK,
        in_caps: input_caps(capability.role),
        out_caps: output_caps(&capability.color_formats),
    })
}

/// Returns the definitions of every video decoder `manager` offers, named after `package`.
pub fn register_codec_package<M: ComponentManager>(
    manager: &M,
    package: &str,
) -> Vec<CodecDefinition> {
    let definitions: Vec<_> = manager
        .capabilities()
        .iter()
        .filter_map(|capability| translate_capability(capability, package))
        .collect();
    log::info!(
        "registered {} codecs for package {}",
        definitions.len(),
        package
    );

    definitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingManager;
    use crate::protocol::ColorFormat;

    fn capability(
        kind: CodecKind,
        role: ComponentRole,
        color_formats: Vec<u32>,
    ) -> ComponentCapability {
        ComponentCapability {
            name: "OMX.vendor.video".into(),
            kind,
            role,
            color_formats,
        }
    }

    #[test]
    fn component_name() {
        assert_eq!(
            parse_component_name("vendor.OMX.hisi.video.decoder.avc").unwrap(),
            "OMX.hisi.video.decoder.avc"
        );
        assert_eq!(parse_component_name("vendor.").unwrap(), "");
        assert!(matches!(
            parse_component_name("OMX"),
            Err(CodecError::InvalidParameter(_))
        ));
    }

    #[test]
    fn avc_decoder() {
        let def = translate_capability(
            &capability(
                CodecKind::VideoDecoder,
                ComponentRole::VideoAvc,
                vec![
                    ColorFormat::Yuv420SemiPlanar as u32,
                    12345,
                    ColorFormat::Argb8888 as u32,
                    0,
                    ColorFormat::Yuv420Planar as u32,
                ],
            ),
            "vendor",
        )
        .unwrap();

        assert_eq!(def.name, "vendor.OMX.vendor.video");
        assert_eq!(def.rank, DEFAULT_RANK);
        assert_eq!(def.in_caps.mime, MIME_VIDEO_AVC);
        assert_eq!(def.in_caps.bitstream_formats, vec![BitStreamFormat::AnnexB]);
        assert_eq!(def.out_caps.mime, MIME_VIDEO_RAW);
        assert_eq!(
            def.out_caps.pixel_formats,
            Some(vec![VideoPixelFormat::Nv12, VideoPixelFormat::Rgba])
        );
    }

    #[test]
    fn other_roles_and_kinds() {
        let def = translate_capability(
            &capability(CodecKind::VideoDecoder, ComponentRole::VideoHevc, vec![0]),
            "vendor",
        )
        .unwrap();
        assert_eq!(def.in_caps.mime, MIME_VIDEO_UNKNOWN);
        assert!(def.in_caps.bitstream_formats.is_empty());
        assert_eq!(def.out_caps.pixel_formats, None);

        for kind in [
            CodecKind::VideoEncoder,
            CodecKind::AudioDecoder,
            CodecKind::AudioEncoder,
        ] {
            assert_eq!(
                translate_capability(&capability(kind, ComponentRole::Unknown, vec![]), "vendor"),
                None
            );
        }
    }

    #[test]
    fn package_registration() {
        let manager = RecordingManager::new();
        let defs = register_codec_package(&manager, "test");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "test.OMX.test.video_decoder.avc");

        let session = defs[0].create_session(Arc::new(manager));
        assert_eq!(session.plugin_name(), "test.OMX.test.video_decoder.avc");
        session.init().unwrap();
    }
}
