use std::{error, fmt, result};

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
pub enum Error {
    /// API misuse detectable at the call site, like a zero value
    /// size or an out of range index.
    BadArgument(String, String),
    /// Legal API invoked in the wrong state, like commit without
    /// begin or bulk loading a non-empty tree.
    BadOperation(String, String),
    /// Cursor used after it was invalidated or its tree destroyed.
    BadCursor(String, String),
    /// On-disk invariant violated, magic/version/size mismatch,
    /// header round-trip failure, torn record.
    Corruption(String, String),
    /// Underlying file operation failed.
    IOError(String, String),
    /// Mutating operation attempted on a read-only instance.
    ReadOnly(String, String),
    /// Request outside this layer's capabilities.
    Unsupported(String, String),
    /// Failure in type conversion.
    FailConvert(String, String),
    /// Invariant failed, typically a bug in this package.
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            BadArgument(p, m) => write!(f, "BadArgument:{} {}", p, m),
            BadOperation(p, m) => write!(f, "BadOperation:{} {}", p, m),
            BadCursor(p, m) => write!(f, "BadCursor:{} {}", p, m),
            Corruption(p, m) => write!(f, "Corruption:{} {}", p, m),
            IOError(p, m) => write!(f, "IOError:{} {}", p, m),
            ReadOnly(p, m) => write!(f, "ReadOnly:{} {}", p, m),
            Unsupported(p, m) => write!(f, "Unsupported:{} {}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert:{} {}", p, m),
            Fatal(p, m) => write!(f, "Fatal:{} {}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
