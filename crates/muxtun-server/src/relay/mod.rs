//! Server-side flow relays

pub(crate) mod ip;
pub(crate) mod tcp;
pub(crate) mod udp;

use muxtun_proto::ResultCode;
use std::io;

/// Map a socket error onto the open-result code the peer understands.
pub(crate) fn open_result_for(error: &io::Error) -> ResultCode {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ResultCode::Refused,
        io::ErrorKind::TimedOut => ResultCode::Timeout,
        io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            ResultCode::NoSuchHost
        }
        _ => ResultCode::InternalError,
    }
}
