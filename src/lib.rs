//! Edms provide an embedded, single-process storage foundation. A
//! database lives inside a single file, viewed as an array of fixed
//! size blocks, and hosts a collection of persistent data structures
//! that applications compose into indexes and object stores.
//!
//! The crate is organised as a stack of layers, each layer consuming
//! only the ones below it:
//!
//! * [vfs] - positional file input/output, the only blocking layer.
//! * [engine] - block paging, caching, pin/unpin protocol and the
//!   write-ahead journal giving atomic multi-block transactions.
//! * [alloc] - free-space management of contiguous block runs.
//! * [btree] - ordered index over fixed-size values with stable
//!   cursors and a bulk loader.
//! * [heap] - variable-sized blobs behind stable references, reclaimed
//!   by mark-and-sweep collection.
//!
//! [codec] implements the fixed-size big-endian serialization used by
//! every persisted structure. [format] ties a database file together,
//! block 0 holding the file header and the anchors for all root
//! structures.
//!
//! All operations are synchronous and single threaded. Instances
//! backed by different files are fully independent and can live in
//! separate threads.

use std::result;

/// Short form to compose Error values.
///
/// Here are few possible ways,
///
/// ```ignore
/// use edms::Error;
/// err_at!(BadArgument, msg: "invalid block size {}", n)
/// ```
///
/// ```ignore
/// use edms::Error;
/// err_at!(IOError, fd.read(&mut buf))
/// ```
///
/// ```ignore
/// use edms::Error;
/// err_at!(IOError, fd.read(&mut buf), "reading block {}", index)
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod alloc;
pub mod anchor;
pub mod btree;
pub mod codec;
pub mod config;
pub mod engine;
mod error;
pub mod format;
pub mod heap;
pub mod util;
pub mod vfs;

pub use crate::error::Error;

/// Type alias for Result returns from this package's methods and functions.
pub type Result<T> = result::Result<T, Error>;

/// Block indices start from ZERO; this value marks the absence of a block.
pub const NIL_BLOCK: u64 = u64::MAX;
