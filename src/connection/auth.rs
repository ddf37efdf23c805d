//! Startup/auth handshake (§4.3): protocol version check, ClientHandshake,
//! dbview/backend construction via the `Connector` collaborator, and
//! initcon (the two temporary state tables `MemoryDbView` mirrors in
//! memory per §12.3).

use bytes::BytesMut;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::Connection;
use crate::backend::{QueryCompiler, SqlBackend};
use crate::config::get_config;
use crate::dbview::{AuthOutcome, DbView, SAVEPOINT_TABLE, STATE_TABLE};
use crate::error::{AuthError, Error, ProtocolError};
use crate::protocol::tags::client;
use crate::protocol::wire;

const PROTOCOL_VERSION: (i16, i16) = (1, 0);

impl<S, D, B, C> Connection<S, D, B, C>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    D: DbView,
    B: SqlBackend,
    C: QueryCompiler,
{
    pub(super) async fn perform_handshake(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let (hi, lo) = self
            .read_buffer
            .take_raw_version()
            .expect("wait_for_bytes(4) guarantees the version pair is already buffered");
        if (hi, lo) != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProtocolVersion { hi, lo }.into());
        }

        self.wait_for_message(shutdown).await?;
        if self.read_buffer.get_message_type() != client::HANDSHAKE {
            let actual = self.read_buffer.get_message_type();
            self.read_buffer.discard_message();
            return Err(ProtocolError::UnexpectedMessageType {
                expected: client::HANDSHAKE,
                actual,
            }
            .into());
        }
        let user = self.read_buffer.read_utf8()?;
        let password = self.read_buffer.read_utf8()?;
        let database = self.read_buffer.read_utf8()?;
        self.read_buffer.finish_message();

        if let AuthOutcome::Reject(reason) = self
            .auth_hook
            .authenticate(&user, &password, &database)
            .await
        {
            warn!(%reason, %user, %database, "credentials rejected");
            return Err(AuthError::CredentialsRejected { user }.into());
        }

        let (dbview, sql, compiler) = self
            .connector
            .connect(&database, &user)
            .await
            .map_err(Error::Auth)?;
        self.dbview = Some(dbview);
        self.backend = Some(super::Backend { sql, compiler });

        self.run_initcon().await?;

        self.queue(wire::auth(0));
        self.queue(wire::backend_key(self.id as i32));
        if get_config().developer_mode {
            let addr = self
                .backend
                .as_ref()
                .expect("backend set above")
                .sql
                .display_address();
            self.queue(wire::param_status("pgaddr", &addr));
        }
        self.emit_ready_for_query().await?;
        self.flush().await?;

        info!(connection_id = self.id, %user, %database, "client authenticated");
        Ok(())
    }

    /// Creates the two temporary tables the connection reconstructs
    /// aliases/config/savepoint state through (§4.3), and seeds the
    /// default module alias row.
    async fn run_initcon(&mut self) -> Result<(), Error> {
        let default_module = get_config().default_module_alias;
        let sql = format!(
            "CREATE TEMPORARY TABLE {STATE_TABLE} (\
                name text, value text, type text CHECK (type IN ('C', 'A')), \
                UNIQUE (name, type)\
            ); \
            CREATE TEMPORARY TABLE {SAVEPOINT_TABLE} (\
                sp_id bigint, _sentinel bigint DEFAULT -1 UNIQUE\
            ); \
            INSERT INTO {STATE_TABLE} (name, value, type) VALUES ('', '{default_module}', 'A');"
        );
        let mut scratch = BytesMut::new();
        self.backend
            .as_mut()
            .expect("backend just constructed above")
            .sql
            .simple_query(sql.as_bytes(), true, &mut scratch)
            .await?;
        Ok(())
    }
}
