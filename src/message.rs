use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// The two edit kinds a client can produce against the shared text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Insert,
    Delete,
}

/// Who injected a message into the system. Broker-sourced messages are
/// applied locally but never fanned back out to the cluster, which is what
/// keeps committed operations from looping forever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Client,
    Broker,
}

/// One edit as it travels between editor clients, application servers, and
/// brokers. `operation_index` names the document the edit targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditMessage {
    #[serde(rename = "type")]
    pub kind: EditKind,
    pub index: i64,
    #[serde(default)]
    pub value: Value,
    pub replica_id: String,
    #[serde(rename = "operation_index")]
    pub document: i64,
    pub source: Source,
}

impl EditMessage {
    /// The document identifier the broker files this edit under.
    pub fn document_name(&self) -> String {
        self.document.to_string()
    }

    /// The broker-opaque payload that ends up in the replicated log.
    pub fn operation(&self) -> EditOperation {
        EditOperation {
            kind: self.kind,
            index: self.index,
            value: self.value.clone(),
            replica: self.replica_id.clone(),
        }
    }
}

/// The edit payload stored at a log position and returned by the committed
/// log endpoint. Structured rather than stringified so a recovering
/// application server can replay it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditOperation {
    pub kind: EditKind,
    pub index: i64,
    pub value: Value,
    pub replica: String,
}

impl EditOperation {
    /// The text this operation inserts. Values are usually JSON strings;
    /// anything else is carried through its JSON rendering.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Line-oriented framing keeps every interface inspectable with
    // netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
