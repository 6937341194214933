//! Line-based request/response protocol.
//!
//! # Wire format
//!
//! ```text
//! line    := bytes* '\n'                  (no NUL, delimiter stripped on read)
//! file    := mode-line size-line bytes{size}
//! ```
//!
//! Requests flow client -> server, responses server -> client. A session is
//! `Root`, any number of configuring requests, then one terminal command
//! answered by response lines ending in `ok` or `error`.

pub mod codec;
pub mod vocab;

pub use codec::{
    checksum_hex, expect_line, parse_checksum, parse_mode, read_line, recv_file, send_file,
    write_line, Connection, MAX_FILE_SIZE, MAX_LINE_LEN,
};
pub use vocab::{
    is_writing_command, lookup_request, split_line, valid_requests, valid_responses,
    RequestClass, RequestSpec, REQUESTS, RESPONSES,
};
