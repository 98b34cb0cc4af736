use std::fmt;
use std::io;

/// Every wire reply opens with an `int32 status`; `Success` is the only non-negative value.
pub const STATUS_SUCCESS: i32 = 0;

pub type PmixResult<T> = Result<T, PmixError>;

/// The taxonomy of things that can go wrong while servicing a peer, independent of any one
/// host upcall's own failure mode.
#[derive(Debug, Eq, PartialEq)]
pub enum PmixError {
    /// Not a failure: a non-blocking operation has no more data or no more capacity right now.
    Wait,
    /// Handshake arrived from a socket with no matching entry in the peer table.
    Unknown,
    /// The requested operation has no host upcall registered, or the handshake version
    /// string did not match the server's.
    NotSupported,
    /// A decode failed mid-command, or the handshake payload exceeded `MAX_CRED_SIZE`.
    BadParam,
    /// An allocation or capacity limit was hit.
    OutOfResource,
    /// A peer socket failed to read or write and must be torn down.
    Unreach,
    /// An authentication token was required but absent.
    InvalidArg,
    /// A lower-level I/O failure not otherwise classified above.
    Io(io::ErrorKind),
}

impl PmixError {
    /// The status code written into the reply header for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            PmixError::Wait => STATUS_SUCCESS,
            PmixError::Unknown => -1,
            PmixError::NotSupported => -2,
            PmixError::BadParam => -3,
            PmixError::OutOfResource => -4,
            PmixError::Unreach => -5,
            PmixError::InvalidArg => -6,
            PmixError::Io(_) => -7,
        }
    }
}

impl fmt::Display for PmixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmixError::Wait => write!(f, "operation would block"),
            PmixError::Unknown => write!(f, "unrecognized peer"),
            PmixError::NotSupported => write!(f, "operation not supported"),
            PmixError::BadParam => write!(f, "bad parameter"),
            PmixError::OutOfResource => write!(f, "out of resource"),
            PmixError::Unreach => write!(f, "peer unreachable"),
            PmixError::InvalidArg => write!(f, "invalid argument"),
            PmixError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

impl std::error::Error for PmixError {}

impl From<io::Error> for PmixError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => PmixError::Wait,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => PmixError::Unreach,
            kind => PmixError::Io(kind),
        }
    }
}

/// Distinguishes "try again later" from every other failure, the way callers in the reactor
/// need to: a `Wait` is not logged or surfaced as a reply, anything else is.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for PmixResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(PmixError::Wait) => false,
            _ => true,
        }
    }
}
