//! Passthrough collaborators for pglogical output: a decoder that classifies
//! frames by tag without decoding tuples, and a loader for `pg_type`.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

use crate::decode::{Classify, Decoder, MessageClass, SchemaLoader};
use crate::postgres::connection::ControlClient;
use crate::{Error, Result};

/// Schema holding the capture extension's own tables.
pub const EXTENSION_SCHEMA: &str = "pgcapture";
/// Table the extension logs DDL statements into.
pub const EXTENSION_DDL_LOGS: &str = "ddl_logs";
/// Bookkeeping table whose changes are never forwarded.
pub const EXTENSION_SOURCES: &str = "sources";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
}

/// A pglogical frame, classified but not decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: u8,
    pub class: MessageClass,
    /// Target of an insert, update or delete.
    pub relation: Option<Relation>,
    /// The complete frame, tag included.
    pub payload: Bytes,
}

impl Classify for RawMessage {
    fn class(&self) -> MessageClass {
        self.class
    }
}

/// Tracks relation metadata and classifies row changes by target table.
///
/// Changes to the extension's DDL log are DDL, changes to its sources table
/// are ignorable. Startup, origin and relation frames are consumed here and
/// never forwarded.
#[derive(Debug, Default)]
pub struct RawDecoder {
    relations: HashMap<u32, Relation>,
}

impl RawDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&Relation> {
        self.relations.get(&id)
    }

    fn decode_begin(&self, mut cursor: &[u8]) -> Result<MessageClass> {
        if cursor.remaining() < 21 {
            return Err(Error::Decode("BEGIN message too short".to_string()));
        }
        let _flags = cursor.get_u8();
        let _final_lsn = cursor.get_u64();
        let commit_time = cursor.get_u64();
        let xid = cursor.get_u32();

        trace!("BEGIN: xid={}, commit_time={}", xid, commit_time);
        Ok(MessageClass::Begin { commit_time })
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<()> {
        if cursor.remaining() < 6 {
            return Err(Error::Decode("RELATION message too short".to_string()));
        }
        let _flags = cursor.get_u8();
        let id = cursor.get_u32();
        let schema = read_name(&mut cursor)?;
        let table = read_name(&mut cursor)?;

        debug!("Relation {}: {}.{}", id, schema, table);
        self.relations.insert(id, Relation { id, schema, table });
        Ok(())
    }

    fn decode_row_change(&self, mut cursor: &[u8]) -> Result<(MessageClass, Relation)> {
        if cursor.remaining() < 5 {
            return Err(Error::Decode("row change message too short".to_string()));
        }
        let _flags = cursor.get_u8();
        let id = cursor.get_u32();
        let relation = self
            .relations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Decode(format!("change for unknown relation {}", id)))?;

        let ours = relation.schema == EXTENSION_SCHEMA;
        let class = MessageClass::Change {
            ignore: ours && relation.table == EXTENSION_SOURCES,
            ddl: ours && relation.table == EXTENSION_DDL_LOGS,
        };
        Ok((class, relation))
    }
}

impl Decoder for RawDecoder {
    type Message = RawMessage;

    fn decode(&mut self, data: &[u8]) -> Result<Option<RawMessage>> {
        let Some((&tag, body)) = data.split_first() else {
            return Ok(None);
        };

        let (class, relation) = match tag {
            b'B' => (self.decode_begin(body)?, None),
            b'C' => (MessageClass::Other, None),
            b'I' | b'U' | b'D' => {
                let (class, relation) = self.decode_row_change(body)?;
                (class, Some(relation))
            }
            b'R' => {
                self.decode_relation(body)?;
                return Ok(None);
            }
            b'S' | b'O' => return Ok(None),
            _ => {
                return Err(Error::Decode(format!(
                    "unknown pglogical message type: {:?}",
                    tag as char
                )))
            }
        };

        Ok(Some(RawMessage {
            tag,
            class,
            relation,
            payload: Bytes::copy_from_slice(data),
        }))
    }
}

/// Length-prefixed, NUL-terminated identifier.
fn read_name(cursor: &mut &[u8]) -> Result<String> {
    if !cursor.has_remaining() {
        return Err(Error::Decode("missing name length".to_string()));
    }
    let len = cursor.get_u8() as usize;
    if cursor.remaining() < len {
        return Err(Error::Decode("name exceeds message".to_string()));
    }
    let raw = &cursor[..len];
    let name = raw.strip_suffix(&[0]).unwrap_or(raw);
    let name = String::from_utf8_lossy(name).into_owned();
    cursor.advance(len);
    Ok(name)
}

/// Type name by OID.
pub type TypeMap = Arc<RwLock<HashMap<u32, String>>>;

/// Loads `pg_type` over the control connection.
pub struct TypeCatalog {
    client: ControlClient,
    types: TypeMap,
}

impl TypeCatalog {
    pub fn new(client: ControlClient) -> Self {
        Self {
            client,
            types: TypeMap::default(),
        }
    }

    /// Handle that observes every refresh.
    pub fn types(&self) -> TypeMap {
        self.types.clone()
    }
}

#[async_trait]
impl SchemaLoader for TypeCatalog {
    async fn refresh_type(&mut self) -> Result<()> {
        let rows = self
            .client
            .query("SELECT oid, typname FROM pg_type", &[])
            .await?;

        let mut loaded = HashMap::with_capacity(rows.len());
        for row in rows {
            let oid: u32 = row.try_get("oid")?;
            let name: String = row.try_get("typname")?;
            loaded.insert(oid, name);
        }

        debug!("Loaded {} types", loaded.len());
        match self.types.write() {
            Ok(mut types) => *types = loaded,
            Err(poisoned) => *poisoned.into_inner() = loaded,
        }
        Ok(())
    }
}
