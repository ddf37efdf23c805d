//! The two external collaborators the core is written against (§1, §11):
//! the SQL backend connection and the out-of-process query compiler. Both
//! are out of scope to *implement* here — the core only consumes the
//! interfaces below, the way the teacher's client-handling code is written
//! against `Server` rather than reimplementing Postgres.

use async_trait::async_trait;
use bytes::BytesMut;

use crate::error::{AuthError, BackendError, CompilerError};

pub mod rows;
pub mod stub;

/// Transaction status as reported by the SQL backend connection (§4.4, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InError,
}

/// One compiled statement, produced by the external compiler (§3). The
/// core uses but never constructs the type descriptors; `sql_hash`
/// presence is what lets the core ask the backend to reuse a prepared
/// statement (§4.4 execute core, step 4).
#[derive(Debug, Clone)]
pub struct QueryUnit {
    pub sql: Vec<Vec<u8>>,
    pub in_type_id: [u8; 16],
    pub out_type_id: [u8; 16],
    pub in_type_data: Vec<u8>,
    pub out_type_data: Vec<u8>,
    pub has_result: bool,
    pub singleton_result: bool,
    pub cacheable: bool,
    pub sql_hash: Option<u64>,
    pub tx_rollback: bool,
    pub tx_savepoint_rollback: bool,
}

impl QueryUnit {
    /// Bit layout consumed by `'1'` ParseComplete (§4.4).
    pub fn parse_complete_flags(&self) -> i32 {
        let mut flags = 0;
        if self.has_result {
            flags |= 1;
        }
        if self.singleton_result {
            flags |= 2;
        }
        flags
    }

    /// A unit is rollback-shaped if it (or its leading statement) undoes
    /// the current transaction or steps back to a savepoint (§4.3, §4.4).
    pub fn is_rollback_shaped(&self) -> bool {
        self.tx_rollback || self.tx_savepoint_rollback
    }
}

/// The SQL backend connection bundled per-Connection (§3, §11). Mirrors
/// the shape of the teacher's `Server`: an owned stream handle that also
/// tracks its own transaction status, but the wire format spoken to the
/// real SQL engine is not this crate's concern.
#[async_trait]
pub trait SqlBackend: Send {
    /// Prepares (when `parse`) and optionally runs (`execute`) a unit.
    /// When `execute` is true, row/data messages are streamed directly
    /// onto the caller-supplied write buffer. `send_sync` asks the
    /// backend to fold its own sync into this round-trip (§9 peek-ahead).
    async fn parse_execute(
        &mut self,
        parse: bool,
        execute: bool,
        unit: &QueryUnit,
        bind_data: Option<&[u8]>,
        send_sync: bool,
        use_prep_stmt: bool,
        out: &mut BytesMut,
    ) -> Result<(), BackendError>;

    /// Runs raw SQL text directly (used by simple-query, legacy graphql,
    /// and rollback-only recovery paths). `ignore_data` suppresses row
    /// streaming when the caller only cares about completion.
    async fn simple_query(
        &mut self,
        sql: &[u8],
        ignore_data: bool,
        out: &mut BytesMut,
    ) -> Result<(), BackendError>;

    /// Issues a Sync and returns the resulting transaction status (§4.4).
    async fn sync(&mut self) -> Result<TransactionStatus, BackendError>;

    /// Current transaction status without a round-trip.
    fn transaction_status(&self) -> TransactionStatus;

    fn in_transaction(&self) -> bool {
        self.transaction_status() == TransactionStatus::InTransaction
    }

    /// Tears the connection down; called from `Connection::abort()` (§5).
    async fn close(&mut self);

    /// Address shown to developer-mode clients via the `'pgaddr'` param
    /// status during auth (§4.3). Default: unknown.
    fn display_address(&self) -> String {
        "unknown".to_string()
    }
}

/// The out-of-process query compiler (§11). An IPC-shaped one-shot-RPC-
/// per-call trait; no transport is implemented here (out of scope, §1).
#[async_trait]
pub trait QueryCompiler: Send {
    /// Compiles `eql` outside of a transaction.
    async fn compile_eql(
        &mut self,
        db_version: u64,
        eql: &[u8],
        aliases: &crate::dbview::AliasMap,
        config: &crate::dbview::ConfigMap,
        json_mode: bool,
        stmt_mode: StatementMode,
    ) -> Result<Vec<QueryUnit>, CompilerError>;

    /// Compiles `eql` while a transaction is already open on the backend.
    async fn compile_eql_in_tx(
        &mut self,
        txid: u64,
        eql: &[u8],
        json_mode: bool,
        stmt_mode: StatementMode,
    ) -> Result<Vec<QueryUnit>, CompilerError>;

    /// Attempts to compile `eql` as (at least starting with) a rollback.
    /// Returns the rollback unit plus the count of statements beyond it.
    async fn try_compile_rollback(
        &mut self,
        db_version: u64,
        eql: &[u8],
    ) -> Result<(QueryUnit, usize), CompilerError>;

    async fn compile_graphql(
        &mut self,
        db_version: u64,
        query: &[u8],
    ) -> Result<QueryUnit, CompilerError>;

    /// Translates a backend-originated error into the code/attrs pair the
    /// error writer emits (§4.6).
    async fn interpret_backend_error(
        &mut self,
        db_version: u64,
        fields: &BackendError,
    ) -> Result<(u32, Vec<(u8, String)>), CompilerError>;

    /// Decodes one configuration value previously recovered from the
    /// backend's state table (§4.5).
    fn setting_val_from_eql(&self, raw: &[u8]) -> String;
}

/// `compile_eql`/`compile_eql_in_tx` statement-grouping mode (§4.4, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementMode {
    Single,
    All,
    SkipFirst,
}

/// Bundles dbview construction and backend-connection opening behind one
/// call (§4.3: "Construct the dbview...; open a backend SQL connection
/// bound to the dbview's database version"). The seam a `Connection`
/// calls once per handshake, analogous to the teacher's
/// `ConnectionPool::from_config`/`get_pool` construction step.
#[async_trait]
pub trait Connector<D, B, C>: Send + Sync
where
    D: crate::dbview::DbView,
    B: SqlBackend,
    C: QueryCompiler,
{
    async fn connect(&self, database: &str, user: &str) -> Result<(D, B, C), AuthError>;
}
