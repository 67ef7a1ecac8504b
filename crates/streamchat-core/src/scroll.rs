//! Scroll-follow state machine.
//!
//! Decides whether new output should keep the view pinned to the bottom.
//! Any explicit user gesture detaches; following resumes only when the view
//! is back within `threshold` of the bottom and the last move was downward.
//! Programmatic scrolls performed for a render tick never re-engage
//! following on their own.

/// Whether the view auto-follows new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowState {
    /// New content scrolls the view to the bottom.
    #[default]
    Following,
    /// The user scrolled away; new content does not move the view.
    Detached,
}

/// Snapshot of the scroll state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollState {
    /// Follow mode.
    pub follow: FollowState,
    /// Whether the view is within the threshold of the bottom.
    pub is_near_bottom: bool,
    /// Offset reported by the last scroll event.
    pub last_offset: u32,
}

impl ScrollState {
    /// Whether the user has scrolled away from the live tail.
    #[must_use]
    pub const fn user_has_scrolled_away(&self) -> bool {
        matches!(self.follow, FollowState::Detached)
    }
}

/// Scroll-follow tracker for one view.
#[derive(Debug, Clone)]
pub struct ScrollFollow {
    threshold: u32,
    follow: FollowState,
    near_bottom: bool,
    last_offset: u32,
}

impl ScrollFollow {
    /// Create a tracker that starts out following.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            threshold,
            follow: FollowState::Following,
            near_bottom: true,
            last_offset: 0,
        }
    }

    /// Current snapshot.
    #[must_use]
    pub const fn state(&self) -> ScrollState {
        ScrollState {
            follow: self.follow,
            is_near_bottom: self.near_bottom,
            last_offset: self.last_offset,
        }
    }

    /// An explicit user wheel, key or drag gesture.
    pub fn on_user_gesture(&mut self) {
        if self.follow == FollowState::Following {
            tracing::trace!("Scroll follow detached");
        }
        self.follow = FollowState::Detached;
    }

    /// The view's offset changed. `offset` is measured from the top.
    pub fn on_scroll(&mut self, offset: u32, content_height: u32, viewport_height: u32) {
        let bottom = content_height.saturating_sub(viewport_height);
        self.near_bottom = bottom.saturating_sub(offset) <= self.threshold;
        let moved_down = offset > self.last_offset;

        if self.follow == FollowState::Detached && self.near_bottom && moved_down {
            tracing::trace!(offset, "Scroll follow re-engaged");
            self.follow = FollowState::Following;
        }
        self.last_offset = offset;
    }

    /// Called on every render. Returns `true` when the view should be
    /// scrolled to the bottom.
    pub fn on_render_tick(&mut self) -> bool {
        if self.follow == FollowState::Following {
            self.near_bottom = true;
            true
        } else {
            false
        }
    }

    /// The user asked to jump to the latest output.
    pub fn jump_to_bottom(&mut self) {
        self.follow = FollowState::Following;
        self.near_bottom = true;
    }

    /// Whether a "jump to bottom" indicator should be shown.
    #[must_use]
    pub const fn show_jump_affordance(&self) -> bool {
        matches!(self.follow, FollowState::Detached) && !self.near_bottom
    }
}
