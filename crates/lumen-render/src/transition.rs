// SPDX-License-Identifier: CEPL-1.0
//! Image state transitions.
//!
//! Every layout change an image goes through is looked up in one static
//! table. A pair that is not in the table is an error; callers never build
//! stage or access masks by hand.

use bitflags::bitflags;

use crate::error::{RenderError, Result};
use crate::gpu::{Aspect, ImageBarrier, ImageHandle};

bitflags! {
    /// Pipeline stages a barrier waits on or blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Stages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_SHADER = 1 << 1;
        const EARLY_FRAGMENT_TESTS = 1 << 2;
        const LATE_FRAGMENT_TESTS = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 5;
        const BOTTOM_OF_PIPE = 1 << 6;

        const FRAGMENT_TESTS = Self::EARLY_FRAGMENT_TESTS.bits() | Self::LATE_FRAGMENT_TESTS.bits();
    }
}

bitflags! {
    /// Memory accesses made available or visible by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const COLOR_ATTACHMENT_READ = 1 << 0;
        const COLOR_ATTACHMENT_WRITE = 1 << 1;
        const DEPTH_STENCIL_READ = 1 << 2;
        const DEPTH_STENCIL_WRITE = 1 << 3;
        const SHADER_SAMPLED_READ = 1 << 4;
        const UNIFORM_READ = 1 << 5;

        const COLOR_ATTACHMENT = Self::COLOR_ATTACHMENT_READ.bits() | Self::COLOR_ATTACHMENT_WRITE.bits();
        const DEPTH_STENCIL = Self::DEPTH_STENCIL_READ.bits() | Self::DEPTH_STENCIL_WRITE.bits();
    }
}

impl Access {
    pub const WRITES: Access =
        Access::COLOR_ATTACHMENT_WRITE.union(Access::DEPTH_STENCIL_WRITE);

    pub fn writes(self) -> Access {
        self & Self::WRITES
    }
}

/// Logical usage state of an image. Maps one to one onto a device layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageState {
    Undefined,
    ColorAttachment,
    DepthAttachment,
    ShaderRead,
    Present,
}

impl ImageState {
    pub const ALL: [ImageState; 5] = [
        ImageState::Undefined,
        ImageState::ColorAttachment,
        ImageState::DepthAttachment,
        ImageState::ShaderRead,
        ImageState::Present,
    ];

    /// Stages and accesses the device performs while an image sits in this state.
    pub fn usage(self) -> Option<(Stages, Access)> {
        match self {
            ImageState::Undefined => None,
            ImageState::ColorAttachment => {
                Some((Stages::COLOR_ATTACHMENT_OUTPUT, Access::COLOR_ATTACHMENT))
            }
            ImageState::DepthAttachment => Some((Stages::FRAGMENT_TESTS, Access::DEPTH_STENCIL)),
            ImageState::ShaderRead => Some((Stages::FRAGMENT_SHADER, Access::SHADER_SAMPLED_READ)),
            ImageState::Present => Some((Stages::BOTTOM_OF_PIPE, Access::empty())),
        }
    }
}

/// Synchronization scope for one transition.
///
/// `discard` means prior contents need not survive, so the device may treat
/// the old layout as undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionScope {
    pub src_stages: Stages,
    pub src_access: Access,
    pub dst_stages: Stages,
    pub dst_access: Access,
    pub discard: bool,
}

struct Rule {
    from: ImageState,
    to: ImageState,
    scope: TransitionScope,
}

const fn rule(
    from: ImageState,
    to: ImageState,
    src: (Stages, Access),
    dst: (Stages, Access),
    discard: bool,
) -> Rule {
    Rule {
        from,
        to,
        scope: TransitionScope {
            src_stages: src.0,
            src_access: src.1,
            dst_stages: dst.0,
            dst_access: dst.1,
            discard,
        },
    }
}

const COLOR_OUT: Stages = Stages::COLOR_ATTACHMENT_OUTPUT;
const NONE: Access = Access::empty();

static RULES: &[Rule] = &[
    // First use of a freshly created color image.
    rule(
        ImageState::Undefined,
        ImageState::ColorAttachment,
        (COLOR_OUT, NONE),
        (COLOR_OUT, Access::COLOR_ATTACHMENT),
        true,
    ),
    rule(
        ImageState::Undefined,
        ImageState::DepthAttachment,
        (Stages::FRAGMENT_TESTS, NONE),
        (Stages::FRAGMENT_TESTS, Access::DEPTH_STENCIL),
        true,
    ),
    // Geometry output becomes lighting input.
    rule(
        ImageState::ColorAttachment,
        ImageState::ShaderRead,
        (COLOR_OUT, Access::COLOR_ATTACHMENT_WRITE),
        (Stages::FRAGMENT_SHADER, Access::SHADER_SAMPLED_READ),
        false,
    ),
    // Next frame's geometry pass overwrites what lighting sampled.
    rule(
        ImageState::ShaderRead,
        ImageState::ColorAttachment,
        (Stages::FRAGMENT_SHADER, NONE),
        (COLOR_OUT, Access::COLOR_ATTACHMENT),
        true,
    ),
    rule(
        ImageState::ColorAttachment,
        ImageState::Present,
        (COLOR_OUT, Access::COLOR_ATTACHMENT_WRITE),
        (Stages::BOTTOM_OF_PIPE, NONE),
        false,
    ),
    // Chains with the acquire semaphore wait at color output.
    rule(
        ImageState::Present,
        ImageState::ColorAttachment,
        (COLOR_OUT, NONE),
        (COLOR_OUT, Access::COLOR_ATTACHMENT),
        true,
    ),
    rule(
        ImageState::DepthAttachment,
        ImageState::DepthAttachment,
        (Stages::FRAGMENT_TESTS, Access::DEPTH_STENCIL_WRITE),
        (Stages::FRAGMENT_TESTS, Access::DEPTH_STENCIL),
        false,
    ),
    rule(
        ImageState::ColorAttachment,
        ImageState::ColorAttachment,
        (COLOR_OUT, Access::COLOR_ATTACHMENT_WRITE),
        (COLOR_OUT, Access::COLOR_ATTACHMENT),
        false,
    ),
];

/// Looks up the scope for `from -> to`, if the pair is supported.
pub fn scope_for(from: ImageState, to: ImageState) -> Option<TransitionScope> {
    RULES
        .iter()
        .find(|r| r.from == from && r.to == to)
        .map(|r| r.scope)
}

/// Every supported pair, in table order.
pub fn supported() -> impl Iterator<Item = (ImageState, ImageState, TransitionScope)> {
    RULES.iter().map(|r| (r.from, r.to, r.scope))
}

/// An image whose current state is tracked on the host.
pub trait TrackedImage {
    fn label(&self) -> &str;
    fn image(&self) -> ImageHandle;
    fn aspect(&self) -> Aspect;
    fn state(&self) -> ImageState;
    fn set_state(&mut self, state: ImageState);
}

/// Plans the barrier that moves `target` into `to` ahead of its first use at
/// `stage`, and records the new state.
///
/// `stage` must lie inside the rule's destination scope, otherwise the
/// barrier would not order that use. Returns `Ok(None)` when the image
/// already is in a read-only state and no barrier is needed.
pub fn transition<T: TrackedImage + ?Sized>(
    target: &mut T,
    to: ImageState,
    stage: Stages,
) -> Result<Option<ImageBarrier>> {
    let from = target.state();
    let Some(scope) = scope_for(from, to) else {
        if from == to && matches!(to, ImageState::ShaderRead | ImageState::Present) {
            return Ok(None);
        }
        return Err(RenderError::UnsupportedTransition {
            resource: target.label().to_owned(),
            from,
            to,
        });
    };
    if stage.is_empty() || !scope.dst_stages.contains(stage) {
        return Err(RenderError::StageNotCovered {
            resource: target.label().to_owned(),
            to,
            stage,
        });
    }

    let barrier = ImageBarrier {
        image: target.image(),
        aspect: target.aspect(),
        old: if scope.discard {
            ImageState::Undefined
        } else {
            from
        },
        new: to,
        scope,
    };
    target.set_state(to);
    Ok(Some(barrier))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tracked {
        state: ImageState,
    }

    impl TrackedImage for Tracked {
        fn label(&self) -> &str {
            "test image"
        }
        fn image(&self) -> ImageHandle {
            ImageHandle(7)
        }
        fn aspect(&self) -> Aspect {
            Aspect::Color
        }
        fn state(&self) -> ImageState {
            self.state
        }
        fn set_state(&mut self, state: ImageState) {
            self.state = state;
        }
    }

    #[test]
    fn table_has_no_duplicate_pairs() {
        let pairs: Vec<_> = supported().map(|(f, t, _)| (f, t)).collect();
        for (i, p) in pairs.iter().enumerate() {
            assert!(!pairs[i + 1..].contains(p), "duplicate rule {p:?}");
        }
    }

    #[test]
    fn unsupported_pair_is_rejected_and_state_kept() {
        let mut img = Tracked {
            state: ImageState::Present,
        };
        let err = transition(&mut img, ImageState::ShaderRead, Stages::FRAGMENT_SHADER).unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnsupportedTransition {
                from: ImageState::Present,
                to: ImageState::ShaderRead,
                ..
            }
        ));
        assert_eq!(img.state, ImageState::Present);
    }

    #[test]
    fn nothing_transitions_into_undefined() {
        for from in ImageState::ALL {
            assert!(scope_for(from, ImageState::Undefined).is_none());
        }
    }

    #[test]
    fn discard_rules_emit_undefined_old_layout() {
        let mut img = Tracked {
            state: ImageState::ShaderRead,
        };
        let b = transition(&mut img, ImageState::ColorAttachment, COLOR_OUT)
            .unwrap()
            .unwrap();
        assert_eq!(b.old, ImageState::Undefined);
        assert_eq!(b.new, ImageState::ColorAttachment);
        assert_eq!(img.state, ImageState::ColorAttachment);
    }

    #[test]
    fn intended_stage_must_be_ordered_by_the_rule() {
        let mut img = Tracked {
            state: ImageState::ColorAttachment,
        };
        let err = transition(&mut img, ImageState::ShaderRead, Stages::VERTEX_SHADER).unwrap_err();
        assert!(matches!(
            err,
            RenderError::StageNotCovered {
                to: ImageState::ShaderRead,
                stage: Stages::VERTEX_SHADER,
                ..
            }
        ));
        assert_eq!(img.state, ImageState::ColorAttachment);
        assert!(transition(&mut img, ImageState::ShaderRead, Stages::empty()).is_err());

        let b = transition(&mut img, ImageState::ShaderRead, Stages::FRAGMENT_SHADER)
            .unwrap()
            .unwrap();
        assert!(b.scope.src_stages.contains(COLOR_OUT));
        assert_eq!(img.state, ImageState::ShaderRead);
    }

    #[test]
    fn every_rule_accepts_its_target_usage_stage() {
        for (from, to, _) in supported() {
            let (stage, _) = to.usage().expect("targets are never Undefined");
            let mut img = Tracked { state: from };
            assert!(transition(&mut img, to, stage).is_ok(), "{from:?}->{to:?}");
        }
    }

    #[test]
    fn repeated_read_needs_no_barrier() {
        let mut img = Tracked {
            state: ImageState::ShaderRead,
        };
        assert!(transition(&mut img, ImageState::ShaderRead, Stages::FRAGMENT_SHADER)
            .unwrap()
            .is_none());
    }

    #[test]
    fn every_rule_orders_prior_writes_before_next_use() {
        for (from, to, scope) in supported() {
            if let (Some((stages, access)), false) = (from.usage(), scope.discard) {
                assert!(scope.src_stages.contains(stages), "{from:?}->{to:?}");
                assert!(scope.src_access.contains(access.writes()), "{from:?}->{to:?}");
            }
            let (stages, access) = to.usage().expect("targets are never Undefined");
            assert!(scope.dst_stages.contains(stages), "{from:?}->{to:?}");
            assert!(scope.dst_access.contains(access), "{from:?}->{to:?}");
        }
    }

    #[test]
    fn discarding_rules_still_wait_on_prior_stage() {
        for (from, to, scope) in supported().filter(|(f, _, s)| s.discard && *f != ImageState::Undefined) {
            let (stages, _) = from.usage().unwrap();
            // Present images are handed back through the acquire semaphore,
            // which waits at color output.
            let expected = if from == ImageState::Present {
                Stages::COLOR_ATTACHMENT_OUTPUT
            } else {
                stages
            };
            assert!(scope.src_stages.contains(expected), "{from:?}->{to:?}");
        }
    }
}
