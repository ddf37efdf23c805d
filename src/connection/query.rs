//! Query lifecycle (§4.4): parse, describe, execute, opportunistic
//! execute, simple-query, legacy graphql, sync, and the execute core and
//! in-tx-error recovery paths shared between them.

use bytes::{Bytes, BytesMut};

use super::{bind, Connection};
use crate::backend::{rows, QueryCompiler, QueryUnit, SqlBackend, StatementMode, TransactionStatus};
use crate::dbview::DbView;
use crate::error::{Error, ProtocolError};
use crate::framing::ReadBuffer;
use crate::protocol::tags::{self, client};
use crate::protocol::wire;

fn read_type_id(rb: &mut ReadBuffer) -> Result<[u8; 16], Error> {
    let bytes = rb.read_bytes(16)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes);
    Ok(id)
}

impl<S, D, B, C> Connection<S, D, B, C>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    D: DbView,
    B: SqlBackend,
    C: QueryCompiler,
{
    /// Parse (`P`): §4.4.
    pub(super) async fn handle_parse(&mut self) -> Result<(), Error> {
        let mode = self.read_buffer.read_byte()?;
        if mode != tags::OUTPUT_MODE_JSON && mode != tags::OUTPUT_MODE_BINARY {
            return Err(ProtocolError::UnsupportedOutputMode(mode).into());
        }
        let stmt_name = self.read_buffer.read_utf8()?;
        if !stmt_name.is_empty() {
            return Err(ProtocolError::NamedStatementUnsupported(stmt_name).into());
        }
        let eql = self.read_buffer.read_null_str()?;
        if eql.is_empty() {
            return Err(ProtocolError::EmptyRequiredString.into());
        }
        self.read_buffer.finish_message();

        self.last_anon_compiled = None;
        let json_mode = mode == tags::OUTPUT_MODE_JSON;

        let (unit, was_cache_hit) = self.resolve_parse_unit(&eql, json_mode).await?;

        self.backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .parse_execute(true, false, &unit, None, false, false, &mut BytesMut::new())
            .await?;

        if !was_cache_hit && self.query_cache_enabled && unit.cacheable {
            self.dbview_mut().cache_insert(&eql, json_mode, unit.clone());
        }

        let flags = unit.parse_complete_flags();
        let (in_id, out_id) = (unit.in_type_id, unit.out_type_id);
        self.last_anon_compiled = Some(unit);
        self.queue_and_maybe_flush(wire::parse_complete(flags, in_id, out_id))
            .await
    }

    /// Resolution order for Parse and the implicit reparse inside
    /// OpportunisticExecute (§4.4 steps 1-4). Returns `(unit, was_cache_hit)`.
    async fn resolve_parse_unit(
        &mut self,
        eql: &[u8],
        json_mode: bool,
    ) -> Result<(QueryUnit, bool), Error> {
        if self.query_cache_enabled {
            if let Some(unit) = self.dbview_mut().cache_get(eql, json_mode) {
                if self.dbview().in_tx_error() && !unit.is_rollback_shaped() {
                    return Err(Error::InTransaction);
                }
                return Ok((unit, true));
            }
        }

        let db_version = self.dbview().db_version();

        if self.dbview().in_tx_error() {
            let (unit, num_remain) = self
                .compiler_mut()
                .try_compile_rollback(db_version, eql)
                .await?;
            if num_remain > 0 {
                return Err(Error::InTransaction);
            }
            return Ok((unit, false));
        }

        let unit = if self.dbview().in_tx() {
            let txid = self.dbview().txid();
            let mut units = self
                .compiler_mut()
                .compile_eql_in_tx(txid, eql, json_mode, StatementMode::Single)
                .await?;
            if units.is_empty() {
                return Err(Error::Internal("compiler returned no units".into()));
            }
            units.remove(0)
        } else {
            let aliases = self.dbview().modaliases().clone();
            let config = self.dbview().config().clone();
            let mut units = self
                .compiler_mut()
                .compile_eql(db_version, eql, &aliases, &config, json_mode, StatementMode::Single)
                .await?;
            if units.is_empty() {
                return Err(Error::Internal("compiler returned no units".into()));
            }
            units.remove(0)
        };
        Ok((unit, false))
    }

    /// Describe (`D`): §4.4.
    pub(super) async fn handle_describe(&mut self) -> Result<(), Error> {
        let kind = self.read_buffer.read_byte()?;
        let stmt_name = self.read_buffer.read_utf8()?;
        self.read_buffer.finish_message();

        if kind != tags::DESCRIBE_KIND_TYPE_SPEC {
            return Err(ProtocolError::UnsupportedDescribeKind(kind).into());
        }
        if !stmt_name.is_empty() {
            return Err(ProtocolError::NamedStatementUnsupported(stmt_name).into());
        }
        let unit = self
            .last_anon_compiled
            .clone()
            .ok_or(ProtocolError::TypeSpecNotFound)?;

        let msg = wire::type_describe(
            unit.parse_complete_flags(),
            unit.in_type_id,
            &unit.in_type_data,
            unit.out_type_id,
            &unit.out_type_data,
        );
        self.queue_and_maybe_flush(msg).await
    }

    /// Execute (`E`): §4.4.
    pub(super) async fn handle_execute(&mut self) -> Result<(), Error> {
        let stmt_name = self.read_buffer.read_utf8()?;
        if !stmt_name.is_empty() {
            return Err(ProtocolError::NamedStatementUnsupported(stmt_name).into());
        }
        let bind_args = self.read_buffer.consume_message();
        self.read_buffer.finish_message();

        let unit = self
            .last_anon_compiled
            .clone()
            .ok_or(ProtocolError::TypeSpecNotFound)?;

        self.execute_core(unit, &bind_args, false, false).await
    }

    /// OpportunisticExecute (`O`): §4.4.
    pub(super) async fn handle_opportunistic_execute(&mut self) -> Result<(), Error> {
        let mode = self.read_buffer.read_byte()?;
        if mode != tags::OUTPUT_MODE_JSON && mode != tags::OUTPUT_MODE_BINARY {
            return Err(ProtocolError::UnsupportedOutputMode(mode).into());
        }
        let eql = self.read_buffer.read_null_str()?;
        if eql.is_empty() {
            return Err(ProtocolError::EmptyRequiredString.into());
        }
        let claimed_flags = self.read_buffer.read_int32()?;
        let claimed_in_id = read_type_id(&mut self.read_buffer)?;
        let claimed_out_id = read_type_id(&mut self.read_buffer)?;
        let bind_args = self.read_buffer.consume_message();
        self.read_buffer.finish_message();

        let json_mode = mode == tags::OUTPUT_MODE_JSON;

        let unit = match self.dbview_mut().cache_get(&eql, json_mode) {
            Some(unit) => unit,
            None => {
                let (unit, _) = self.resolve_parse_unit(&eql, json_mode).await?;
                self.backend
                    .as_mut()
                    .expect("backend set once authenticated")
                    .sql
                    .parse_execute(true, false, &unit, None, false, false, &mut BytesMut::new())
                    .await?;
                if self.query_cache_enabled && unit.cacheable {
                    self.dbview_mut().cache_insert(&eql, json_mode, unit.clone());
                }
                self.last_anon_compiled = Some(unit.clone());
                unit
            }
        };

        let claimed_singleton = claimed_flags & 0b10 != 0;
        if claimed_in_id != unit.in_type_id
            || claimed_out_id != unit.out_type_id
            || claimed_singleton != unit.singleton_result
        {
            let msg = wire::type_describe(
                unit.parse_complete_flags(),
                unit.in_type_id,
                &unit.in_type_data,
                unit.out_type_id,
                &unit.out_type_data,
            );
            return self.queue_and_maybe_flush(msg).await;
        }

        let use_prep_stmt = unit.sql_hash.is_some();
        self.execute_core(unit, &bind_args, true, use_prep_stmt).await
    }

    /// Execute core (§4.4), shared by Execute and OpportunisticExecute.
    async fn execute_core(
        &mut self,
        unit: QueryUnit,
        bind_args: &[u8],
        parse: bool,
        use_prep_stmt: bool,
    ) -> Result<(), Error> {
        if self.dbview().in_tx_error() {
            if !unit.is_rollback_shaped() {
                return Err(Error::InTransaction);
            }
            self.run_rollback_unit(&unit).await?;
            return self.queue_and_maybe_flush(wire::command_complete()).await;
        }

        let bind_data = bind::recode_bind_args(bind_args)?;
        let process_sync = self.peek_trailing_sync();

        let backend_in_tx_pre = self
            .backend
            .as_ref()
            .expect("backend set once authenticated")
            .sql
            .in_transaction();
        self.dbview_mut().start(&unit, backend_in_tx_pre);

        let exec_result = self
            .backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .parse_execute(
                parse,
                true,
                &unit,
                Some(&bind_data),
                process_sync,
                use_prep_stmt,
                self.write_buffer.raw_buf(),
            )
            .await;

        match exec_result {
            Ok(()) => {
                let backend_in_tx_post = self
                    .backend
                    .as_ref()
                    .expect("backend set once authenticated")
                    .sql
                    .in_transaction();
                self.dbview_mut().on_success(backend_in_tx_post);
                self.queue_and_maybe_flush(wire::command_complete()).await?;
                if process_sync {
                    self.read_buffer.finish_message();
                    self.emit_ready_for_query().await?;
                    self.flush().await?;
                }
                Ok(())
            }
            Err(backend_err) => {
                let was_in_tx = self.dbview().in_tx();
                let backend_in_tx_post = self
                    .backend
                    .as_ref()
                    .expect("backend set once authenticated")
                    .sql
                    .in_transaction();
                self.dbview_mut().on_error(backend_in_tx_post);
                if was_in_tx && !backend_in_tx_post {
                    self.dbview_mut().abort_tx();
                    self.recover_tx_info().await;
                }
                if process_sync {
                    self.read_buffer.put_message();
                }
                Err(Error::Backend(backend_err))
            }
        }
    }

    /// Peeks for a trailing Sync message already buffered (§4.4 step 3,
    /// §9). Leaves it positioned as `current` if found so the caller can
    /// `finish_message`/`put_message` it depending on outcome.
    fn peek_trailing_sync(&mut self) -> bool {
        if self.read_buffer.take_message() {
            if self.read_buffer.get_message_type() == client::SYNC {
                true
            } else {
                self.read_buffer.put_message();
                false
            }
        } else {
            false
        }
    }

    /// Runs a rollback-shaped unit's SQL directly (used both by execute
    /// core's in-tx-error path and `recover_script_error`).
    async fn run_rollback_unit(&mut self, unit: &QueryUnit) -> Result<(), Error> {
        let sql = unit.sql.concat();
        let mut scratch = BytesMut::new();
        self.backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .simple_query(&sql, true, &mut scratch)
            .await?;
        if unit.tx_savepoint_rollback {
            self.recover_tx_info().await;
        } else {
            self.dbview_mut().abort_tx();
        }
        Ok(())
    }

    /// SimpleQuery (`Q`): §4.4.
    pub(super) async fn handle_simple_query(&mut self) -> Result<(), Error> {
        let eql = self.read_buffer.read_null_str()?;
        self.read_buffer.finish_message();
        if eql.is_empty() {
            return Err(ProtocolError::EmptyRequiredString.into());
        }

        let stmt_mode = if self.dbview().in_tx_error() {
            match self.recover_script_error(&eql).await? {
                None => return Ok(()),
                Some(()) => StatementMode::SkipFirst,
            }
        } else {
            StatementMode::All
        };

        let db_version = self.dbview().db_version();
        let units = if self.dbview().in_tx() {
            let txid = self.dbview().txid();
            self.compiler_mut()
                .compile_eql_in_tx(txid, &eql, false, stmt_mode)
                .await?
        } else {
            let aliases = self.dbview().modaliases().clone();
            let config = self.dbview().config().clone();
            self.compiler_mut()
                .compile_eql(db_version, &eql, &aliases, &config, false, stmt_mode)
                .await?
        };

        for unit in &units {
            self.run_simple_unit(unit).await?;
        }

        self.queue_and_maybe_flush(wire::command_complete()).await?;
        self.emit_ready_for_query().await?;
        self.flush().await
    }

    /// Returns `None` once `eql` has been fully handled as a bare
    /// rollback (`'C'` + ready-for-query already emitted). `Some(())`
    /// means more statements remain past the rollback; the caller
    /// continues compiling with `StatementMode::SkipFirst`.
    async fn recover_script_error(&mut self, eql: &[u8]) -> Result<Option<()>, Error> {
        let db_version = self.dbview().db_version();
        let (unit, num_remain) = self
            .compiler_mut()
            .try_compile_rollback(db_version, eql)
            .await?;

        self.run_rollback_unit(&unit).await?;

        if num_remain == 0 {
            self.queue_and_maybe_flush(wire::command_complete()).await?;
            self.emit_ready_for_query().await?;
            self.flush().await?;
            return Ok(None);
        }
        Ok(Some(()))
    }

    async fn run_simple_unit(&mut self, unit: &QueryUnit) -> Result<(), Error> {
        let backend_in_tx_pre = self
            .backend
            .as_ref()
            .expect("backend set once authenticated")
            .sql
            .in_transaction();
        self.dbview_mut().start(unit, backend_in_tx_pre);

        let sql = unit.sql.concat();
        let mut scratch = BytesMut::new();
        let result = self
            .backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .simple_query(&sql, true, &mut scratch)
            .await;

        match result {
            Ok(()) => {
                let backend_in_tx_post = self
                    .backend
                    .as_ref()
                    .expect("backend set once authenticated")
                    .sql
                    .in_transaction();
                self.dbview_mut().on_success(backend_in_tx_post);
                Ok(())
            }
            Err(backend_err) => {
                let was_in_tx = self.dbview().in_tx();
                let backend_in_tx_post = self
                    .backend
                    .as_ref()
                    .expect("backend set once authenticated")
                    .sql
                    .in_transaction();
                self.dbview_mut().on_error(backend_in_tx_post);
                if was_in_tx && !backend_in_tx_post {
                    self.dbview_mut().abort_tx();
                    self.recover_tx_info().await;
                }
                Err(Error::Backend(backend_err))
            }
        }
    }

    /// Legacy graphql (`L`): §4.4.
    pub(super) async fn handle_legacy(&mut self) -> Result<(), Error> {
        let lang = self.read_buffer.read_byte()?;
        let query = self.read_buffer.read_null_str()?;
        self.read_buffer.finish_message();

        if lang != tags::LEGACY_LANG_GRAPHQL {
            return Err(ProtocolError::UnsupportedLegacyLanguage(lang).into());
        }
        if self.dbview().in_tx() {
            return Err(ProtocolError::GraphqlInTransaction.into());
        }

        let db_version = self.dbview().db_version();
        let unit = self.compiler_mut().compile_graphql(db_version, &query).await?;

        let sql = unit.sql.concat();
        let mut scratch = BytesMut::new();
        self.backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .simple_query(&sql, false, &mut scratch)
            .await?;

        let payload: Bytes = match rows::first_column(&scratch) {
            Some(Some(bytes)) => bytes,
            _ => Bytes::from_static(b"null"),
        };

        self.queue_and_maybe_flush(wire::legacy_result(&payload)).await?;
        self.emit_ready_for_query().await?;
        self.flush().await
    }

    /// Sync (`S`): §4.4.
    pub(super) async fn handle_sync(&mut self) -> Result<(), Error> {
        self.read_buffer.consume_message();
        self.read_buffer.finish_message();

        let status = self
            .backend
            .as_mut()
            .expect("backend set once authenticated")
            .sql
            .sync()
            .await?;
        let byte = match status {
            TransactionStatus::Idle => tags::TX_STATUS_IDLE,
            TransactionStatus::InTransaction => tags::TX_STATUS_IN_TRANSACTION,
            TransactionStatus::InError => tags::TX_STATUS_IN_ERROR,
        };
        self.queue_and_maybe_flush(wire::ready_for_query(byte)).await?;
        self.flush().await
    }
}
