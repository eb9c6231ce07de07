//! Versioned binary encoding of definitions.
//!
//! ```text
//! +----------------+-----------+-----------+----------------------------+
//! | "KILNDEF\0" 8B | major u16 | minor u16 | bincode { nodes, root }    |
//! +----------------+-----------+-----------+----------------------------+
//! ```
//!
//! Integers are little endian. A reader accepts any minor version of its own
//! major version; minor bumps may only append enum variants.

use serde::{Deserialize, Serialize};

use super::{DefinitionError, NodeDef, OutputRef};

pub const MAGIC: &[u8; 8] = b"KILNDEF\0";
pub const WIRE_MAJOR: u16 = 1;
pub const WIRE_MINOR: u16 = 0;

const HEADER_LEN: usize = MAGIC.len() + 4;

#[derive(Serialize)]
struct WireBodyRef<'a> {
  nodes: Vec<&'a NodeDef>,
  root: &'a OutputRef,
}

#[derive(Deserialize)]
struct WireBody {
  nodes: Vec<NodeDef>,
  root: OutputRef,
}

pub(super) fn encode<'a>(
  nodes: impl Iterator<Item = &'a NodeDef>,
  root: &OutputRef,
) -> Result<Vec<u8>, DefinitionError> {
  let body = WireBodyRef {
    nodes: nodes.collect(),
    root,
  };

  let mut out = Vec::with_capacity(HEADER_LEN + 256);
  out.extend_from_slice(MAGIC);
  out.extend_from_slice(&WIRE_MAJOR.to_le_bytes());
  out.extend_from_slice(&WIRE_MINOR.to_le_bytes());
  bincode::serialize_into(&mut out, &body)?;
  Ok(out)
}

pub(super) fn decode(bytes: &[u8]) -> Result<(Vec<NodeDef>, OutputRef), DefinitionError> {
  if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
    return Err(DefinitionError::BadMagic);
  }

  let major = u16::from_le_bytes([bytes[8], bytes[9]]);
  let minor = u16::from_le_bytes([bytes[10], bytes[11]]);
  if major != WIRE_MAJOR {
    return Err(DefinitionError::UnsupportedVersion { major, minor });
  }

  let body: WireBody = bincode::deserialize(&bytes[HEADER_LEN..])?;
  Ok((body.nodes, body.root))
}
