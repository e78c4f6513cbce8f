use std::{fmt, ops};

/// A set of readiness conditions reported by the [backend](crate::backend).
///
/// `Ready` is the interest mask and the readiness mask in one type: it is
/// used both to tell the backend what a descriptor should be watched for,
/// and to report back what actually became ready. Only `READABLE` and
/// `WRITABLE` are requested explicitly; `ERROR` and `HUP` are always
/// reported when the kernel sets them, regardless of what was requested.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash, Default)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;
const READY_ALL: usize = READABLE | WRITABLE | ERROR | HUP;

impl Ready {
    /// The empty set.
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// Peer/socket error. Treat as a hint, not all backends distinguish it.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Hang-up: the peer closed or half-closed the connection.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// True if `self` includes every bit set in `other`.
    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(bits: usize) -> Ready {
        Ready(bits & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        write!(fmt, "Ready {{")?;
        let mut one = false;
        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }
        write!(fmt, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn combine_and_query() {
        let ready = Ready::readable() | Ready::writable();
        assert!(ready.is_readable());
        assert!(ready.is_writable());
        assert!(!ready.is_error());
    }

    #[test]
    fn remove_bit() {
        let mut ready = Ready::readable() | Ready::hup();
        ready.remove(Ready::readable());
        assert!(!ready.is_readable());
        assert!(ready.is_hup());
    }

    #[test]
    fn not_is_bounded_to_known_flags() {
        let inverted = !Ready::readable();
        assert!(!inverted.is_readable());
        assert!(inverted.is_writable());
        assert!(inverted.is_error());
        assert!(inverted.is_hup());
    }
}
