use core::fmt::{self, Debug, Display};

mod private {
    #[derive(Debug)]
    pub enum Private {}
}

/// The error type used by the flash area adapter.
///
/// This can encapsulate an error reported by the raw flash driver, and adds
/// the adapter's own checks on top of that.
pub enum Error<E> {
    /// The raw flash driver reported an error.
    Device(E),

    /// The requested offset and length do not fit inside the flash area.
    ///
    /// The device is not accessed in this case.
    OutOfBounds,

    /// The driver transferred fewer bytes than requested.
    ShortTransfer,

    /// The device reported a geometry the adapter cannot work with (eg. a
    /// sector size of zero, or an area size that overflows).
    InvalidGeometry,

    #[doc(hidden)]
    __NonExhaustive(private::Private),
}

impl<E> Error<E> {
    /// The flat status code reported to FCB style callers.
    ///
    /// Every failure maps to `-1`; success is `0`.
    pub fn code(&self) -> i32 {
        -1
    }
}

impl<E> Debug for Error<E>
where
    E: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device(dev) => write!(f, "Error::Device({:?})", dev),
            Error::OutOfBounds => f.write_str("Error::OutOfBounds"),
            Error::ShortTransfer => f.write_str("Error::ShortTransfer"),
            Error::InvalidGeometry => f.write_str("Error::InvalidGeometry"),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl<E> Display for Error<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device(dev) => write!(f, "raw flash error: {}", dev),
            Error::OutOfBounds => f.write_str("access outside of the flash area"),
            Error::ShortTransfer => f.write_str("raw flash transferred fewer bytes than requested"),
            Error::InvalidGeometry => f.write_str("unsupported raw flash geometry"),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl<E> std::error::Error for Error<E> where E: Debug + Display {}
