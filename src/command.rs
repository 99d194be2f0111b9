//! Administrative Commands
//!
//! Command payloads the connection core itself needs: the role handshake,
//! liveness pings, authentication and logout. Commands travel as a single
//! bincode document inside a query against `<db>.$cmd`.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::socket::Socket;
use crate::wire::{Op, QueryOp, Reply, QUERY_SLAVE_OK};

/// Server message identifying a sharding router
pub const MONGOS_MSG: &str = "isdbgrid";

/// Command sent to a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Role handshake
    IsMaster,

    /// Round-trip probe
    Ping,

    /// Drop the credential for the target database
    Logout,

    /// Acknowledge the preceding writes on this connection
    GetLastError,

    /// Log in with a credential
    Authenticate {
        mechanism: String,
        source: String,
        user: String,
        password: String,
    },

    /// Any other command, passed through untouched
    Named { name: String, payload: Vec<u8> },
}

impl Command {
    /// Serialize command to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize command from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the command name (for logging)
    pub fn name(&self) -> &str {
        match self {
            Command::IsMaster => "isMaster",
            Command::Ping => "ping",
            Command::Logout => "logout",
            Command::GetLastError => "getLastError",
            Command::Authenticate { .. } => "authenticate",
            Command::Named { name, .. } => name,
        }
    }
}

/// Role handshake result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsMasterResult {
    pub is_master: bool,
    pub secondary: bool,
    /// Address of the primary as seen by this server
    pub primary: Option<String>,
    pub hosts: Vec<String>,
    /// Members that never become primary
    pub passives: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub max_wire_version: i32,
    pub msg: Option<String>,
}

impl IsMasterResult {
    /// Whether the answering server is a sharding router
    pub fn is_mongos(&self) -> bool {
        self.msg.as_deref() == Some(MONGOS_MSG)
    }
}

/// Command reply document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandReply {
    Ok { payload: Vec<u8> },
    IsMaster(IsMasterResult),
    Error { code: i32, message: String },
}

impl CommandReply {
    /// Empty successful reply
    pub fn ok() -> Self {
        CommandReply::Ok { payload: Vec::new() }
    }

    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Turn an error document into `Err`
    pub fn into_result(self) -> Result<CommandReply> {
        match self {
            CommandReply::Error { code, message } => Err(Error::Command { code, message }),
            other => Ok(other),
        }
    }
}

/// Build the query carrying `cmd` against database `db`
pub fn command_op(db: &str, cmd: &Command, slave_ok: bool) -> Result<Op> {
    Ok(Op::Query(QueryOp {
        collection: format!("{}.$cmd", db),
        flags: if slave_ok { QUERY_SLAVE_OK } else { 0 },
        skip: 0,
        limit: -1,
        query: Bytes::from(cmd.serialize()?),
        selector: None,
    }))
}

/// Decode the single command reply document carried by `reply`
pub fn decode_reply(reply: &Reply) -> Result<CommandReply> {
    let doc = reply
        .docs
        .first()
        .ok_or_else(|| Error::Protocol("command reply carries no document".into()))?;
    Ok(CommandReply::deserialize(doc)?)
}

/// Error describing a reply flagged as a query failure
pub fn failure_from_reply(reply: &Reply) -> Error {
    match decode_reply(reply) {
        Ok(CommandReply::Error { code, message }) => Error::Command { code, message },
        _ => Error::Command {
            code: 0,
            message: "query failure".into(),
        },
    }
}

/// Run a command on `socket` and wait for its reply
pub async fn run(socket: &Socket, db: &str, cmd: &Command, slave_ok: bool) -> Result<CommandReply> {
    let op = command_op(db, cmd, slave_ok)?;
    let reply = socket.simple_query(op).await?;
    decode_reply(&reply)?.into_result()
}

/// Role handshake against the admin database
pub async fn is_master(socket: &Socket) -> Result<IsMasterResult> {
    match run(socket, "admin", &Command::IsMaster, true).await? {
        CommandReply::IsMaster(result) => Ok(result),
        other => Err(Error::Protocol(format!("unexpected isMaster reply: {:?}", other))),
    }
}

/// Liveness round-trip against the admin database
pub async fn ping(socket: &Socket) -> Result<()> {
    run(socket, "admin", &Command::Ping, true).await.map(|_| ())
}
