//! Virtual handle identifiers
//!
//! One newtype per socket kind so a connection handle can never be passed
//! where an acceptor is expected. `-1` is the invalid handle.

use core::fmt;

macro_rules! virtual_handle {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const INVALID: $name = $name(-1);

            #[inline]
            pub const fn from_int(id: i64) -> Self {
                $name(id)
            }

            #[inline]
            pub const fn id(self) -> i64 {
                self.0
            }

            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != -1
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}({})", stringify!($name), self.0)
                } else {
                    write!(f, "{}(INVALID)", stringify!($name))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $tag, self.0)
            }
        }
    };
}

virtual_handle!(
    /// A stream connection (scribe)
    ConnectionHandle,
    "conn"
);
virtual_handle!(
    /// A listening acceptor (doorman)
    AcceptHandle,
    "accept"
);
virtual_handle!(
    /// A bidirectional datagram endpoint
    EndpointHandle,
    "endpoint"
);
virtual_handle!(DatagramSinkHandle, "sink");
virtual_handle!(DatagramSourceHandle, "source");

/// Any handle, for notifications that are not specific to one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyHandle {
    Connection(ConnectionHandle),
    Accept(AcceptHandle),
    Endpoint(EndpointHandle),
    DatagramSink(DatagramSinkHandle),
    DatagramSource(DatagramSourceHandle),
}

macro_rules! any_handle_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AnyHandle {
                fn from(h: $ty) -> Self {
                    AnyHandle::$variant(h)
                }
            }
        )*
    };
}

any_handle_from! {
    Connection => ConnectionHandle,
    Accept => AcceptHandle,
    Endpoint => EndpointHandle,
    DatagramSink => DatagramSinkHandle,
    DatagramSource => DatagramSourceHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_default() {
        assert_eq!(ConnectionHandle::default(), ConnectionHandle::INVALID);
        assert!(!AcceptHandle::INVALID.is_valid());
        assert!(EndpointHandle::from_int(0).is_valid());
        assert_eq!(format!("{:?}", DatagramSinkHandle::INVALID), "DatagramSinkHandle(INVALID)");
        assert_eq!(format!("{}", ConnectionHandle::from_int(4)), "conn#4");
    }

    #[test]
    fn test_any_handle() {
        let h: AnyHandle = DatagramSourceHandle::from_int(2).into();
        assert_eq!(h, AnyHandle::DatagramSource(DatagramSourceHandle::from_int(2)));
    }
}
