//! Wire message type bytes (§6).
//!
//! Integers on the wire are big-endian; strings are u32-length-prefixed
//! UTF-8 unless a message is documented otherwise.

/// Client -> server.
pub mod client {
    pub const HANDSHAKE: u8 = b'0';
    pub const PARSE: u8 = b'P';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const OPPORTUNISTIC_EXECUTE: u8 = b'O';
    pub const SIMPLE_QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const LEGACY: u8 = b'L';
    pub const FLUSH: u8 = b'H';
}

/// Server -> client.
pub mod server {
    pub const AUTH: u8 = b'R';
    pub const BACKEND_KEY: u8 = b'K';
    pub const PARAM_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const TYPE_DESCRIBE: u8 = b'T';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const LEGACY_RESULT: u8 = b'L';
    pub const ERROR_RESPONSE: u8 = b'E';
}

/// Describe message `kind` byte (§4.4).
pub const DESCRIBE_KIND_TYPE_SPEC: u8 = b'T';

/// Output mode bytes carried by Parse/OpportunisticExecute (§4.4).
pub const OUTPUT_MODE_JSON: u8 = b'j';
pub const OUTPUT_MODE_BINARY: u8 = b'b';

/// `ReadyForQuery` transaction-status bytes (§4.6 / GLOSSARY).
pub const TX_STATUS_IDLE: u8 = b'I';
pub const TX_STATUS_IN_TRANSACTION: u8 = b'T';
pub const TX_STATUS_IN_ERROR: u8 = b'E';

/// Legacy graphql sub-language byte (§4.4).
pub const LEGACY_LANG_GRAPHQL: u8 = b'g';
