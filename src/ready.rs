use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` is used both as the interest mask of a [`Channel`] (which events
/// its looper should watch the fd for) and as the `revents` the poller
/// reports back before dispatch. Unlike an interest-only type it admits the
/// empty set: a channel's interest legitimately drops to [`Ready::NONE`]
/// while its write buffer is drained.
///
/// Error and hang-up conditions reported by a backend are folded into *both*
/// [`READABLE`] and [`WRITABLE`] so that whichever callback runs first
/// observes the condition and can tear the connection down.
///
/// [`Channel`]: crate::Channel
/// [`READABLE`]: Ready::READABLE
/// [`WRITABLE`]: Ready::WRITABLE
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Ready(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Ready {
    /// The empty set.
    pub const NONE: Ready = Ready(0);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Both readable and writable readiness.
    pub const ALL: Ready = Ready(READABLE | WRITABLE);

    /// Add together two `Ready` sets.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    /// Remove `other` from the set.
    pub const fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }

    /// Returns true if the set is empty.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable readiness.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if the set contains all of `other`.
    pub const fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for Ready {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Self;

    #[inline]
    fn bitand(self, other: Self) -> Self {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Ready(self.0 & !other.0)
    }
}

impl ops::SubAssign for Ready {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(fmt, "NONE");
        }
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}
