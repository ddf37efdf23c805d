//! Translates thrown errors into wire error messages (§4.6).

use bytes::BytesMut;

use crate::backend::QueryCompiler;
use crate::error::{self, Error, ProtocolError};
use crate::protocol::wire;

/// Builds the `'E'` message for `err`, consulting `compiler` to interpret
/// backend-originated errors (§4.6 step 1). Never fails itself: if
/// interpretation throws, substitutes a generic internal-server error.
pub async fn build<C: QueryCompiler>(compiler: &mut C, db_version: u64, err: &Error) -> BytesMut {
    let (code, message, attrs) = describe(compiler, db_version, err).await;
    wire::error_response(code, &message, &attrs)
}

/// Used for errors raised before a backend/compiler exists yet (pre-auth
/// handshake failures) — no compiler to interpret through.
pub fn build_pre_auth(err: &Error) -> BytesMut {
    let (code, message) = match err {
        Error::Protocol(p) => (error::CODE_BINARY_PROTOCOL, p.to_string()),
        Error::Auth(a) => (error::CODE_BINARY_PROTOCOL, a.to_string()),
        _ => (
            error::CODE_INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
        ),
    };
    wire::error_response(code, &message, &[])
}

async fn describe<C: QueryCompiler>(
    compiler: &mut C,
    db_version: u64,
    err: &Error,
) -> (u32, String, Vec<(u8, String)>) {
    match err {
        Error::Backend(backend_err) => {
            match compiler
                .interpret_backend_error(db_version, backend_err)
                .await
            {
                Ok((code, attrs)) => (code, backend_err.to_string(), attrs),
                Err(_) => (
                    error::CODE_INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                    Vec::new(),
                ),
            }
        }
        // Graphql-in-a-transaction is rejected at the protocol layer, but
        // it is a TransactionError class, not a BinaryProtocol one: it
        // behaves like any other statement attempted while the dbview is
        // about to be marked tx-error (§8 scenario 5), not a malformed
        // message.
        Error::Protocol(ProtocolError::GraphqlInTransaction) => {
            (error::CODE_TRANSACTION_ERROR, err.to_string(), Vec::new())
        }
        Error::Protocol(p) => (error::CODE_BINARY_PROTOCOL, p.to_string(), Vec::new()),
        Error::Auth(a) => (error::CODE_BINARY_PROTOCOL, a.to_string(), Vec::new()),
        Error::InTransaction => (error::CODE_TRANSACTION_ERROR, err.to_string(), Vec::new()),
        Error::Compiler(_) | Error::Config(_) | Error::Internal(_) => (
            error::CODE_INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
            Vec::new(),
        ),
        Error::ConnectionAborted | Error::ShuttingDown => (
            error::CODE_INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
            Vec::new(),
        ),
    }
}
