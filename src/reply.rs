//! Control-channel reply catalog.
//!
//! Every line the server can send lives here, CRLF-terminated at the
//! definition site so no call path can forget the terminator. Several codes
//! deliberately deviate from RFC 959 conventions (for example `501 File does
//! not exist` on data commands); deployed clients depend on these exact
//! strings, so they are kept byte for byte.

#![allow(missing_docs)]

use std::net::SocketAddrV4;
use std::path::Path;

/// Three-line banner sent as soon as a control connection is accepted.
pub const GREETING: &str =
    "220-Connection Established\r\n220-Note that this server accepts only\r\n220 anonymous access mode.\r\n";

pub const USER_OK: &str = "230 User Name OK\r\n";
pub const USER_INCORRECT: &str = "530 User Name Incorrect\r\n";
pub const NOT_LOGGED_IN: &str = "530 Not Logged In\r\n";

pub const OK: &str = "200 Ok\r\n";
pub const BYE: &str = "221 Bye\r\n";
pub const INCORRECT_COMMAND: &str = "500 Incorrect Command\r\n";
pub const COMMAND_UNAVAILABLE: &str = "500 Command unavailable\r\n";

pub const DIRECTORY_CHANGED: &str = "200 Directory changed\r\n";
pub const TYPE_CHANGED: &str = "200 Type changed\r\n";
pub const STRUCTURE_CHANGED: &str = "200 Structure changed\r\n";
pub const MODE_CHANGED: &str = "200 Mode changed\r\n";
pub const INVALID_TYPE: &str = "501 Invalid/Unsupported TYPE parameter\r\n";
pub const INVALID_STRUCTURE: &str = "501 Invalid/Unsupported STRUcture parameter\r\n";
pub const INVALID_MODE: &str = "501 Invalid/Unsupported MODE parameter\r\n";

pub const ILLEGAL_PATH: &str = "550 Illegal path\r\n";
pub const FILE_DOES_NOT_EXIST: &str = "550 File does not exist\r\n";
pub const NOT_A_DIRECTORY: &str = "550 Specified path is not a directory\r\n";
pub const PATH_NOT_FOUND: &str = "550 Path not found\r\n";

// Data-command variants of the path failures, kept on 501 for wire
// compatibility.
pub const DATA_ILLEGAL_PATH: &str = "501 Illegal path\r\n";
pub const DATA_FILE_DOES_NOT_EXIST: &str = "501 File does not exist\r\n";
pub const DATA_IS_A_DIRECTORY: &str = "501 Specified path is a directory\r\n";
pub const LIST_NOT_A_DIRECTORY: &str = "501 specified path is not a directory\r\n";

pub const OPENED_DATA_CONNECTION: &str = "150 Opened data connection\r\n";
pub const OPERATION_SUCCESSFUL: &str = "250 Operation successful\r\n";
pub const USE_PASV_FIRST: &str = "425 Use PASV first.\r\n";

/// `227` reply announcing where the passive listener is bound.
pub fn entering_passive_mode(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let [p1, p2] = addr.port().to_be_bytes();
    format!(
        "227 Entering Passive Mode ({},{},{},{},{},{}).\r\n",
        h1, h2, h3, h4, p1, p2
    )
}

/// `200` reply carrying the working directory, always rendered from `/`.
pub fn working_directory(pwd: &Path) -> String {
    if pwd.as_os_str().is_empty() {
        "200 /\r\n".to_string()
    } else {
        format!("200 /{}\r\n", pwd.display())
    }
}
