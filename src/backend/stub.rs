//! Placeholder `SqlBackend`/`QueryCompiler`/`Connector` used by the thin
//! process entrypoint (§10.4) so the crate is runnable out of the box.
//! Real deployments substitute their own implementations of the traits
//! defined in the parent module — the SQL backend driver and compiler
//! IPC are out of scope for the core (§1).

use async_trait::async_trait;
use bytes::BytesMut;

use super::{Connector, QueryCompiler, QueryUnit, SqlBackend, StatementMode, TransactionStatus};
use crate::dbview::{AliasMap, ConfigMap, MemoryDbView};
use crate::error::{AuthError, BackendError, CompilerError};

/// A `SqlBackend` with no real backend behind it; every call that would
/// need one fails with `BackendError::Gone`.
#[derive(Debug, Default)]
pub struct UnimplementedSqlBackend;

#[async_trait]
impl SqlBackend for UnimplementedSqlBackend {
    async fn parse_execute(
        &mut self,
        _parse: bool,
        _execute: bool,
        _unit: &QueryUnit,
        _bind_data: Option<&[u8]>,
        _send_sync: bool,
        _use_prep_stmt: bool,
        _out: &mut BytesMut,
    ) -> Result<(), BackendError> {
        Err(BackendError::Gone)
    }

    async fn simple_query(
        &mut self,
        _sql: &[u8],
        _ignore_data: bool,
        _out: &mut BytesMut,
    ) -> Result<(), BackendError> {
        Err(BackendError::Gone)
    }

    async fn sync(&mut self) -> Result<TransactionStatus, BackendError> {
        Ok(TransactionStatus::Idle)
    }

    fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::Idle
    }

    async fn close(&mut self) {}
}

/// A `QueryCompiler` with no compiler process behind it; every call is
/// rejected. Present so the crate has a runnable default that doesn't
/// ship the out-of-process compiler IPC.
#[derive(Debug, Default)]
pub struct UnimplementedQueryCompiler;

#[async_trait]
impl QueryCompiler for UnimplementedQueryCompiler {
    async fn compile_eql(
        &mut self,
        _db_version: u64,
        _eql: &[u8],
        _aliases: &AliasMap,
        _config: &ConfigMap,
        _json_mode: bool,
        _stmt_mode: StatementMode,
    ) -> Result<Vec<QueryUnit>, CompilerError> {
        Err(CompilerError::Rpc("no compiler endpoint configured".into()))
    }

    async fn compile_eql_in_tx(
        &mut self,
        _txid: u64,
        _eql: &[u8],
        _json_mode: bool,
        _stmt_mode: StatementMode,
    ) -> Result<Vec<QueryUnit>, CompilerError> {
        Err(CompilerError::Rpc("no compiler endpoint configured".into()))
    }

    async fn try_compile_rollback(
        &mut self,
        _db_version: u64,
        _eql: &[u8],
    ) -> Result<(QueryUnit, usize), CompilerError> {
        Err(CompilerError::Rpc("no compiler endpoint configured".into()))
    }

    async fn compile_graphql(
        &mut self,
        _db_version: u64,
        _query: &[u8],
    ) -> Result<QueryUnit, CompilerError> {
        Err(CompilerError::Rpc("no compiler endpoint configured".into()))
    }

    async fn interpret_backend_error(
        &mut self,
        _db_version: u64,
        _fields: &BackendError,
    ) -> Result<(u32, Vec<(u8, String)>), CompilerError> {
        Err(CompilerError::Rpc("no compiler endpoint configured".into()))
    }

    fn setting_val_from_eql(&self, raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).into_owned()
    }
}

/// Builds a fresh `MemoryDbView` plus the unimplemented backend/compiler
/// pair for every new connection (§4.3's "construct the dbview... open a
/// backend SQL connection" step, with no real SQL engine to bind to).
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    pub default_module_alias: String,
    pub query_cache_capacity: usize,
}

#[async_trait]
impl Connector<MemoryDbView, UnimplementedSqlBackend, UnimplementedQueryCompiler>
    for DefaultConnector
{
    async fn connect(
        &self,
        _database: &str,
        _user: &str,
    ) -> Result<(MemoryDbView, UnimplementedSqlBackend, UnimplementedQueryCompiler), AuthError>
    {
        let dbview = MemoryDbView::with_cache_capacity(
            1,
            &self.default_module_alias,
            self.query_cache_capacity,
        );
        Ok((dbview, UnimplementedSqlBackend, UnimplementedQueryCompiler))
    }
}
