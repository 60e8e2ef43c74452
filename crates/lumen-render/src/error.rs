// SPDX-License-Identifier: CEPL-1.0
use std::{io, path::PathBuf};

use thiserror::Error;

use crate::transition::{ImageState, Stages};

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// Whether the caller may retry after rebuilding surface-dependent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("presentation surface is stale and must be rebuilt")]
    SurfaceStale,

    #[error("surface extent {width}x{height} cannot back any image")]
    DegenerateExtent { width: u32, height: u32 },

    #[error("no transition rule for {resource}: {from:?} -> {to:?}")]
    UnsupportedTransition {
        resource: String,
        from: ImageState,
        to: ImageState,
    },

    #[error("{resource}: transition into {to:?} does not order a use at {stage:?}")]
    StageNotCovered {
        resource: String,
        to: ImageState,
        stage: Stages,
    },

    #[error("no memory type satisfies type bits {type_bits:#x} with {properties}")]
    NoMemoryType { type_bits: u32, properties: String },

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("shader binary {} could not be read", path.display())]
    ShaderMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shader binary {} is malformed: {reason}", path.display())]
    ShaderInvalid { path: PathBuf, reason: String },

    #[error("wait on frame slot {slot} failed: {reason}")]
    FenceWait { slot: usize, reason: String },

    #[error("queue submission failed: {0}")]
    Submit(String),

    #[error("{call} failed: {reason}")]
    Device { call: &'static str, reason: String },

    #[error("out-of-order use: {0}")]
    InvalidState(String),
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::SurfaceStale | RenderError::DegenerateExtent { .. } => {
                ErrorClass::Recoverable
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    pub fn device(call: &'static str, reason: impl ToString) -> Self {
        RenderError::Device {
            call,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_errors_are_recoverable() {
        assert!(RenderError::SurfaceStale.is_recoverable());
        assert!(RenderError::DegenerateExtent {
            width: 0,
            height: 600
        }
        .is_recoverable());
    }

    #[test]
    fn everything_else_is_fatal() {
        let fatal = [
            RenderError::UnsupportedTransition {
                resource: "albedo".into(),
                from: ImageState::Present,
                to: ImageState::ShaderRead,
            },
            RenderError::NoMemoryType {
                type_bits: 0b1010,
                properties: "HOST_VISIBLE".into(),
            },
            RenderError::FenceWait {
                slot: 1,
                reason: "timeout".into(),
            },
            RenderError::StageNotCovered {
                resource: "depth".into(),
                to: ImageState::DepthAttachment,
                stage: Stages::VERTEX_SHADER,
            },
            RenderError::Submit("lost".into()),
            RenderError::device("vkCreateImage", "out of device memory"),
        ];
        for e in fatal {
            assert_eq!(e.class(), ErrorClass::Fatal, "{e}");
        }
    }

    #[test]
    fn messages_name_the_resource() {
        let e = RenderError::UnsupportedTransition {
            resource: "gbuffer.normal".into(),
            from: ImageState::Undefined,
            to: ImageState::Present,
        };
        assert!(e.to_string().contains("gbuffer.normal"));
    }
}
