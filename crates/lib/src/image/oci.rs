//! OCI image config and manifest documents.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::util::hash::Digest;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Reference to a blob by media type, digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
  pub media_type: String,
  pub digest: Digest,
  pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  pub schema_version: u32,
  pub media_type: String,
  pub config: Descriptor,
  pub layers: Vec<Descriptor>,
}

impl Manifest {
  pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
    Self {
      schema_version: 2,
      media_type: MEDIA_TYPE_MANIFEST.to_string(),
      config,
      layers,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
  #[serde(rename = "type")]
  pub kind: String,
  pub diff_ids: Vec<Digest>,
}

/// Image configuration. No creation time is recorded, so identical trees give
/// identical configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  pub architecture: String,
  pub os: String,
  pub rootfs: RootFs,
}

impl ImageConfig {
  pub fn for_layers(diff_ids: Vec<Digest>) -> Self {
    Self {
      architecture: oci_arch().to_string(),
      os: std::env::consts::OS.to_string(),
      rootfs: RootFs {
        kind: "layers".to_string(),
        diff_ids,
      },
    }
  }

  /// Identifier of the unpacked filesystem for this layer stack.
  ///
  /// `ChainID(L0) = DiffID(L0)`, `ChainID(Ln) = sha256(ChainID(Ln-1) + " " + DiffID(Ln))`.
  pub fn chain_id(&self) -> Option<Digest> {
    let mut ids = self.rootfs.diff_ids.iter();
    let mut chain = ids.next()?.clone();
    for diff_id in ids {
      let mut hasher = Sha256::new();
      hasher.update(format!("{} {}", chain, diff_id).as_bytes());
      chain = Digest::from_hasher(hasher);
    }
    Some(chain)
  }
}

fn oci_arch() -> &'static str {
  match std::env::consts::ARCH {
    "x86_64" => "amd64",
    "aarch64" => "arm64",
    "x86" => "386",
    other => other,
  }
}
