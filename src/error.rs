use std::fmt;

/// I/O result codes shared by every layer in the runtime.
///
/// These intentionally mirror the portable subset of OS socket errors. A
/// layer maps raw `errno` values through [`IoError::from_errno`] and reports
/// the mapped value; anything unrecognized collapses to [`IoError::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    Success,
    WouldBlock,
    Interrupted,
    NotConnected,
    NotPerm,
    ConnReset,
    ConnAborted,
    Disconnect,
    AddrInUse,
    ProtoNotSupported,
    ConnRefused,
    NetUnreachable,
    TimedOut,
    NoSysResources,
    NotFound,
    Invalid,
    Error,
}

impl IoError {
    /// Map a POSIX `errno` value to a portable error code.
    pub fn from_errno(err: i32) -> IoError {
        if err == 0 {
            return IoError::Success;
        }
        if err == libc::EAGAIN || err == libc::EWOULDBLOCK || err == libc::EINPROGRESS {
            return IoError::WouldBlock;
        }
        match err {
            libc::EINTR => IoError::Interrupted,
            libc::ENOTCONN => IoError::NotConnected,
            libc::EACCES | libc::EPERM => IoError::NotPerm,
            libc::ECONNRESET | libc::ENETRESET => IoError::ConnReset,
            libc::ECONNABORTED => IoError::ConnAborted,
            libc::EPIPE => IoError::Disconnect,
            libc::EADDRINUSE => IoError::AddrInUse,
            libc::EAFNOSUPPORT | libc::EPROTONOSUPPORT => IoError::ProtoNotSupported,
            libc::ECONNREFUSED => IoError::ConnRefused,
            libc::ENETUNREACH | libc::EHOSTUNREACH | libc::ENETDOWN => IoError::NetUnreachable,
            libc::ETIMEDOUT => IoError::TimedOut,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => IoError::NoSysResources,
            _ => IoError::Error,
        }
    }

    /// Map an `std::io::Error`, preferring the raw OS error when present.
    pub fn from_io_error(err: &std::io::Error) -> IoError {
        match err.raw_os_error() {
            Some(errno) => IoError::from_errno(errno),
            None => IoError::Error,
        }
    }

    /// Whether this code represents a condition worth retrying after the
    /// next readiness event.
    pub fn is_transient(self) -> bool {
        matches!(self, IoError::WouldBlock | IoError::Interrupted)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoError::Success => "Success",
            IoError::WouldBlock => "Operation would block",
            IoError::Interrupted => "Interrupted by signal",
            IoError::NotConnected => "Not connected",
            IoError::NotPerm => "Operation not permitted",
            IoError::ConnReset => "Connection reset by peer",
            IoError::ConnAborted => "Connection aborted",
            IoError::Disconnect => "Disconnected",
            IoError::AddrInUse => "Address in use",
            IoError::ProtoNotSupported => "Protocol not supported",
            IoError::ConnRefused => "Connection refused",
            IoError::NetUnreachable => "Network unreachable",
            IoError::TimedOut => "Operation timed out",
            IoError::NoSysResources => "Out of system resources",
            IoError::NotFound => "Not found",
            IoError::Invalid => "Invalid argument",
            IoError::Error => "Generic error",
        };
        f.write_str(s)
    }
}

impl std::error::Error for IoError {}

/// Result codes for timezone parsing and database operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TzError {
    /// Duplicate zone name.
    Dup,
    /// Malformed INI data.
    Ini,
    /// Bad year in a DST rule.
    Year,
    /// Bad standard offset.
    Offset,
    /// Bad DST offset.
    DstOffset,
    /// Bad standard abbreviation.
    Abbr,
    /// Bad DST abbreviation.
    DstAbbr,
    /// Bad date in a DST change descriptor.
    Date,
    /// Bad time in a DST change descriptor.
    Time,
    /// Bad combined date/time.
    Datetime,
    /// Invalid arguments.
    Invalid,
    /// Generic failure.
    Error,
}

impl fmt::Display for TzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for TzError {}
