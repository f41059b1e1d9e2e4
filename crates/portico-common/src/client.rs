use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::auth::ScramClient;
use crate::error::{Result, WireError};
use crate::wire;

// Server error codes that mean the credentials were rejected.
const CODE_UNAUTHORIZED: i32 = 13;
const CODE_AUTHENTICATION_FAILED: i32 = 18;

/// A fail-fast command client over one TCP connection.
///
/// One connection, one dial attempt, no retries: a dead endpoint costs the
/// caller exactly one connect before the error surfaces. Pooling and server
/// discovery are deliberately somebody else's job.
#[derive(Debug)]
pub struct MongoClient {
    stream: TcpStream,
    addr: String,
    request_id: i32,
}

impl MongoClient {
    /// Connects with a single attempt bounded by `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| WireError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| WireError::Connection(format!("failed to connect to {addr}: {e}")))?;
        Ok(Self {
            stream,
            addr: addr.to_string(),
            request_id: 0,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Runs a command against `db`, returning the reply document.
    ///
    /// A reply with `ok: 0` is surfaced as [`WireError::Command`], or as
    /// [`WireError::Unauthorized`] for credential-rejection codes.
    pub async fn run_command(&mut self, db: &str, mut command: Document) -> Result<Document> {
        command.insert("$db", db);
        self.request_id = self.request_id.wrapping_add(1);
        wire::write_message(&mut self.stream, self.request_id, 0, &command).await?;
        let (_, reply) = wire::read_message(&mut self.stream).await?;

        if reply_ok(&reply) {
            return Ok(reply);
        }
        let code = reply.get_i32("code").unwrap_or(0);
        let message = reply.get_str("errmsg").unwrap_or("unknown error").to_string();
        if code == CODE_UNAUTHORIZED || code == CODE_AUTHENTICATION_FAILED {
            return Err(WireError::Unauthorized(message));
        }
        Err(WireError::Command { code, message })
    }

    /// The caller's view of the replica set: primary, hosts, own role.
    pub async fn is_master(&mut self) -> Result<Document> {
        self.run_command("admin", doc! { "isMaster": 1 }).await
    }

    /// Full per-member state of the replica set.
    pub async fn repl_set_get_status(&mut self) -> Result<Document> {
        self.run_command("admin", doc! { "replSetGetStatus": 1 })
            .await
    }

    /// Authenticates the connection with SCRAM-SHA-256.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mut scram = ScramClient::new(username, password);

        let reply = self
            .run_command(
                "admin",
                doc! {
                    "saslStart": 1,
                    "mechanism": "SCRAM-SHA-256",
                    "payload": binary(scram.client_first()),
                },
            )
            .await?;
        let conversation_id = reply.get_i32("conversationId").unwrap_or(0);

        let client_final = scram.client_final(sasl_payload(&reply)?)?;
        let reply = self
            .run_command(
                "admin",
                doc! {
                    "saslContinue": 1,
                    "conversationId": conversation_id,
                    "payload": binary(client_final),
                },
            )
            .await?;
        scram.verify_server_final(sasl_payload(&reply)?)?;

        // Servers finish with an empty exchange unless skipEmptyExchange is
        // negotiated; keep answering until done.
        let mut done = reply.get_bool("done").unwrap_or(false);
        while !done {
            let reply = self
                .run_command(
                    "admin",
                    doc! {
                        "saslContinue": 1,
                        "conversationId": conversation_id,
                        "payload": binary(Vec::new()),
                    },
                )
                .await?;
            done = reply.get_bool("done").unwrap_or(false);
        }
        Ok(())
    }
}

fn binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

fn sasl_payload(reply: &Document) -> Result<&[u8]> {
    reply
        .get_binary_generic("payload")
        .map(Vec::as_slice)
        .map_err(|e| WireError::Auth(format!("missing SASL payload: {e}")))
}

fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}
