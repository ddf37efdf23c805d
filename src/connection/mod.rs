//! State controller & top-level message loop (§4.2), owning the framing
//! layer, the dbview, and the backend bundle for one client socket.
//! Mirrors the shape of the teacher's `Client<S, T>` (generic over the
//! transport, holding buffers plus per-connection maps) but generalized
//! over the `DbView`/`SqlBackend`/`QueryCompiler` collaborators instead of
//! PgBouncer-specific pooling state.

mod auth;
mod bind;
mod error_writer;
mod query;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::backend::{Connector, QueryCompiler, QueryUnit, SqlBackend};
use crate::config::get_config;
use crate::dbview::{AuthHook, DbView};
use crate::error::{Error, ProtocolError};
use crate::framing::{ReadBuffer, WriteBuffer};
use crate::protocol::tags::{client, TX_STATUS_IDLE, TX_STATUS_IN_ERROR, TX_STATUS_IN_TRANSACTION};
use crate::protocol::wire;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Connection status (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Started,
    Authenticated,
    Bad,
}

/// The external collaborator bundle referenced by `Connection::backend`
/// in §3's data model ("reference to a bundle of {compiler RPC endpoint,
/// SQL backend connection}").
pub(crate) struct Backend<B, C> {
    pub sql: B,
    pub compiler: C,
}

/// Per-connection protocol state machine (§3). `S` is the transport,
/// split into halves at construction so reads and writes can proceed
/// independently the way the teacher's `Client` holds a `BufReader`
/// and a separate write half.
pub struct Connection<S, D, B, C> {
    id: u32,
    status: Status,
    read_half: Option<ReadHalf<S>>,
    write_half: Option<WriteHalf<S>>,
    read_buffer: ReadBuffer,
    write_buffer: WriteBuffer,
    dbview: Option<D>,
    backend: Option<Backend<B, C>>,
    last_anon_compiled: Option<QueryUnit>,
    query_cache_enabled: bool,
    auth_hook: Arc<dyn AuthHook>,
    connector: Arc<dyn Connector<D, B, C>>,
}

impl<S, D, B, C> Connection<S, D, B, C>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    D: DbView,
    B: SqlBackend,
    C: QueryCompiler,
{
    pub fn new(
        transport: S,
        auth_hook: Arc<dyn AuthHook>,
        connector: Arc<dyn Connector<D, B, C>>,
        query_cache_enabled: bool,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            id,
            status: Status::New,
            read_half: Some(read_half),
            write_half: Some(write_half),
            read_buffer: ReadBuffer::new(),
            write_buffer: WriteBuffer::with_flush_threshold(get_config().max_buffered_write_bytes),
            dbview: None,
            backend: None,
            last_anon_compiled: None,
            query_cache_enabled,
            auth_hook,
            connector,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Drives the connection to completion: handshake, then the dispatch
    /// loop until the client disconnects, errors fatally, or `shutdown`
    /// fires. Never propagates an error — `abort()` always runs last.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        match self.serve(&mut shutdown).await {
            Ok(()) => {}
            Err(err) if err.is_connection_aborted() => {
                debug!(connection_id = self.id, "connection closed by client");
            }
            Err(Error::ShuttingDown) => {
                debug!(connection_id = self.id, "connection cancelled by shutdown");
            }
            Err(err) => {
                error!(connection_id = self.id, error = %err, "connection terminated with error");
                let _ = self.write_error(&err).await;
                let _ = self.flush().await;
            }
        }
        self.abort().await;
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), Error> {
        self.wait_for_bytes(4, shutdown).await?;
        self.status = Status::Started;
        self.perform_handshake(shutdown).await?;
        self.status = Status::Authenticated;
        loop {
            self.dispatch_one(shutdown).await?;
        }
    }

    async fn dispatch_one(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), Error> {
        self.wait_for_message(shutdown).await?;
        let msg_type = self.read_buffer.get_message_type();
        let flush_sync_on_error = matches!(msg_type, client::SIMPLE_QUERY | client::LEGACY);

        let result = match msg_type {
            client::PARSE => self.handle_parse().await,
            client::DESCRIBE => self.handle_describe().await,
            client::EXECUTE => self.handle_execute().await,
            client::OPPORTUNISTIC_EXECUTE => self.handle_opportunistic_execute().await,
            client::SIMPLE_QUERY => self.handle_simple_query().await,
            client::SYNC => self.handle_sync().await,
            client::LEGACY => self.handle_legacy().await,
            client::FLUSH => {
                self.read_buffer.finish_message();
                self.flush().await
            }
            other => {
                self.read_buffer.discard_message();
                Err(ProtocolError::UnknownMessageType(other).into())
            }
        };

        if let Err(err) = result {
            if err.is_connection_aborted() || matches!(err, Error::ShuttingDown) {
                return Err(err);
            }
            self.handle_dispatch_error(err, flush_sync_on_error, shutdown)
                .await?;
        }
        Ok(())
    }

    async fn handle_dispatch_error(
        &mut self,
        err: Error,
        flush_sync_on_error: bool,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        if let Some(dbview) = self.dbview.as_mut() {
            dbview.mark_tx_error();
        }
        self.read_buffer.finish_message();
        self.write_error(&err).await?;
        if flush_sync_on_error {
            self.emit_ready_for_query().await?;
            self.flush().await?;
        } else {
            self.recover_from_error(shutdown).await?;
        }
        Ok(())
    }

    /// Discards messages until a Sync is observed, then handles it —
    /// which itself emits the sync-status ReadyForQuery (§4.2 step 4).
    async fn recover_from_error(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        loop {
            self.wait_for_message(shutdown).await?;
            if self.read_buffer.get_message_type() == client::SYNC {
                return self.handle_sync().await;
            }
            self.read_buffer.discard_message();
        }
    }

    async fn wait_for_bytes(
        &mut self,
        n: usize,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        while self.read_buffer.buffered_len() < n {
            self.fill_read_buffer(shutdown).await?;
        }
        Ok(())
    }

    async fn wait_for_message(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        while !self.read_buffer.take_message() {
            self.fill_read_buffer(shutdown).await?;
        }
        Ok(())
    }

    async fn fill_read_buffer(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let Some(read_half) = self.read_half.as_mut() else {
            return Err(Error::ConnectionAborted);
        };
        let mut chunk = [0u8; 8192];
        let n = tokio::select! {
            biased;
            _ = shutdown.recv() => return Err(Error::ShuttingDown),
            res = read_half.read(&mut chunk) => res.map_err(ProtocolError::Io)?,
        };
        if n == 0 {
            return Err(Error::ConnectionAborted);
        }
        self.read_buffer.feed_data(&chunk[..n]);
        Ok(())
    }

    /// §5 Abort: status BAD, transport released, backend scheduled for
    /// close, backend reference dropped.
    pub async fn abort(&mut self) {
        self.status = Status::Bad;
        if let Some(mut backend) = self.backend.take() {
            backend.sql.close().await;
        }
        self.read_half = None;
        self.write_half = None;
    }

    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        let Some(write_half) = self.write_half.as_mut() else {
            return Err(Error::ConnectionAborted);
        };
        self.write_buffer
            .flush(write_half)
            .await
            .map_err(ProtocolError::Io)?;
        Ok(())
    }

    pub(crate) fn queue(&mut self, message: BytesMut) {
        self.write_buffer.write_buffer(message);
    }

    pub(crate) async fn queue_and_maybe_flush(&mut self, message: BytesMut) -> Result<(), Error> {
        self.queue(message);
        if self.write_buffer.over_threshold() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Emits `'Z'` using the dbview's own tx-error/tx state, for the
    /// folded-sync reply paths (execute/simple-query with a trailing Sync
    /// already consumed, and the implicit-sync error path for `Q`/`L`).
    /// Deriving this from the dbview rather than the backend's raw status
    /// is what makes a protocol-level rejection that never touches the
    /// backend (e.g. legacy graphql inside a transaction, §8 scenario 5)
    /// still report `'E'` once `handle_dispatch_error` has marked the
    /// dbview tx-error. Standalone Sync dispatch goes through
    /// `handle_sync`, which round-trips `SqlBackend::sync` instead.
    pub(crate) async fn emit_ready_for_query(&mut self) -> Result<(), Error> {
        let status = self.dbview_tx_status_byte();
        self.queue(wire::ready_for_query(status));
        Ok(())
    }

    fn dbview_tx_status_byte(&self) -> u8 {
        match self.dbview.as_ref() {
            Some(dbview) if dbview.in_tx_error() => TX_STATUS_IN_ERROR,
            Some(dbview) if dbview.in_tx() => TX_STATUS_IN_TRANSACTION,
            _ => TX_STATUS_IDLE,
        }
    }

    async fn write_error(&mut self, err: &Error) -> Result<(), Error> {
        let msg = match (self.backend.as_mut(), self.dbview.as_ref()) {
            (Some(backend), Some(dbview)) => {
                error_writer::build(&mut backend.compiler, dbview.db_version(), err).await
            }
            _ => error_writer::build_pre_auth(err),
        };
        self.queue(msg);
        Ok(())
    }

    fn dbview(&self) -> &D {
        self.dbview
            .as_ref()
            .expect("dbview is set once the connection is AUTHENTICATED")
    }

    fn dbview_mut(&mut self) -> &mut D {
        self.dbview
            .as_mut()
            .expect("dbview is set once the connection is AUTHENTICATED")
    }

    fn compiler_mut(&mut self) -> &mut C {
        &mut self
            .backend
            .as_mut()
            .expect("backend is set once the connection is AUTHENTICATED")
            .compiler
    }

    /// Threads the backend/compiler through `DbView::recover_current_tx_info`
    /// (§4.5). Needs a disjoint borrow of `self.dbview` and `self.backend`,
    /// which `dbview_mut()`/`compiler_mut()` can't give since each borrows
    /// all of `self`.
    pub(crate) async fn recover_tx_info(&mut self) {
        let dbview = self
            .dbview
            .as_mut()
            .expect("dbview is set once the connection is AUTHENTICATED");
        let backend = self
            .backend
            .as_mut()
            .expect("backend is set once the connection is AUTHENTICATED");
        dbview
            .recover_current_tx_info(&mut backend.sql, &backend.compiler)
            .await;
    }
}
