// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator image manifest
//!
//! The `<accelerator-image>` argument of every tool is a TOML file that
//! names the backend and the wire details of the build loaded on the device:
//!
//! ```toml
//! name = "toynet-opt2"
//!
//! [backend]
//! kind = "axi-dma"
//!
//! [protocol]
//! weight_load_code = 1
//! infer_code = 2
//! count_field = "second-word"
//! ack = { kind = "value", value = 1 }
//!
//! [axi_dma]
//! dma_uio = "/dev/uio0"
//! control_uio = "/dev/uio1"
//! buffer_device = "udmabuf0"
//! poll_timeout_ms = 5000
//! ```
//!
//! Every `[protocol]` field defaults to the reference build.

use crate::command::{CommandLayout, CountField};
use crate::error::{Result, ToyNetError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toynet_chip::arch::WEIGHT_BLOB_LEN;
use toynet_chip::wire::{mode, ACK_WORD};

/// Parsed accelerator image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceleratorImage {
    /// Human-readable build name
    pub name: String,

    /// Backend selection
    pub backend: BackendSection,

    /// Wire details of the build
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Device nodes for the memory-mapped backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axi_dma: Option<AxiDmaConfig>,
}

/// `[backend]` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    /// Which backend drives the channels
    pub kind: BackendKind,
}

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Virtual ToyNet accelerator running on the CPU
    Software,
    /// Virtual empty overlay echoing every word plus 13
    Loopback,
    /// Xilinx AXI DMA through UIO and u-dma-buf
    AxiDma,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software => write!(f, "Software (virtual ToyNet)"),
            Self::Loopback => write!(f, "Software (loopback)"),
            Self::AxiDma => write!(f, "AXI DMA"),
        }
    }
}

/// How the weight-load acknowledgement is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Ack must equal `value`
    Value {
        /// Expected word
        value: u32,
    },
    /// Any nonzero ack is success
    NonZero,
    /// Ack must echo the blob length in words
    BlobLength,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::Value { value: ACK_WORD }
    }
}

impl AckPolicy {
    /// True if `ack` confirms a load of `blob_words` words
    pub fn accepts(&self, ack: u32, blob_words: usize) -> bool {
        match *self {
            Self::Value { value } => ack == value,
            Self::NonZero => ack != 0,
            Self::BlobLength => usize::try_from(ack).is_ok_and(|n| n == blob_words),
        }
    }
}

/// `[protocol]` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Code of the weight-load command
    pub weight_load_code: u32,
    /// Code of the inference command
    pub infer_code: u32,
    /// Count encoding of the inference command
    pub count_field: CountField,
    /// Words the build expects in the weight stream
    pub blob_words: usize,
    /// Acknowledgement check
    pub ack: AckPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            weight_load_code: mode::WEIGHT_LOAD,
            infer_code: mode::INFER,
            count_field: CountField::SecondWord,
            blob_words: WEIGHT_BLOB_LEN,
            ack: AckPolicy::default(),
        }
    }
}

impl ProtocolConfig {
    /// Command layout part of the configuration
    pub const fn command_layout(&self) -> CommandLayout {
        CommandLayout {
            weight_load_code: self.weight_load_code,
            infer_code: self.infer_code,
            count_field: self.count_field,
        }
    }
}

/// `[axi_dma]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxiDmaConfig {
    /// UIO node exposing the AXI DMA registers
    pub dma_uio: PathBuf,
    /// UIO node exposing the HLS `ap_ctrl` register (absent for images
    /// without a control interface)
    #[serde(default)]
    pub control_uio: Option<PathBuf>,
    /// u-dma-buf device name (e.g. `udmabuf0`)
    pub buffer_device: String,
    /// Optional wall-clock bound per `wait()`
    #[serde(default)]
    pub poll_timeout_ms: Option<u64>,
}

impl AcceleratorImage {
    /// Virtual ToyNet image with reference protocol settings
    pub fn software(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendSection {
                kind: BackendKind::Software,
            },
            protocol: ProtocolConfig::default(),
            axi_dma: None,
        }
    }

    /// Virtual loopback image
    pub fn loopback(name: impl Into<String>) -> Self {
        Self {
            backend: BackendSection {
                kind: BackendKind::Loopback,
            },
            ..Self::software(name)
        }
    }

    /// Replace the protocol settings
    #[must_use]
    pub const fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Parse a manifest from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a load error if the text is not a valid manifest.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let image: Self =
            toml::from_str(text).map_err(|e| ToyNetError::load(format!("invalid image manifest: {e}")))?;
        image.validate()?;
        Ok(image)
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns a load error if the file is missing or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading accelerator image: {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToyNetError::load(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ToyNetError::load(format!("cannot serialize image: {e}")))
    }

    fn validate(&self) -> Result<()> {
        if self.backend.kind == BackendKind::AxiDma && self.axi_dma.is_none() {
            return Err(ToyNetError::load(format!(
                "image {:?}: backend axi-dma needs an [axi_dma] table",
                self.name
            )));
        }
        if self.protocol.weight_load_code == self.protocol.infer_code {
            return Err(ToyNetError::load(format!(
                "image {:?}: weight_load_code and infer_code are both {}",
                self.name, self.protocol.infer_code
            )));
        }
        if self.protocol.blob_words == 0 {
            return Err(ToyNetError::load(format!("image {:?}: blob_words is 0", self.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_uses_reference_protocol() {
        let image = AcceleratorImage::from_toml_str(
            r#"
            name = "toynet-naive"
            [backend]
            kind = "software"
            "#,
        )
        .unwrap();
        assert_eq!(image.backend.kind, BackendKind::Software);
        assert_eq!(image.protocol, ProtocolConfig::default());
        assert_eq!(image.protocol.blob_words, 61_750);
    }

    #[test]
    fn full_axi_manifest() {
        let image = AcceleratorImage::from_toml_str(
            r#"
            name = "toynet-opt2"
            [backend]
            kind = "axi-dma"
            [protocol]
            count_field = "absent"
            ack = { kind = "blob-length" }
            [axi_dma]
            dma_uio = "/dev/uio0"
            control_uio = "/dev/uio1"
            buffer_device = "udmabuf0"
            poll_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(image.protocol.count_field, CountField::Absent);
        assert_eq!(image.protocol.ack, AckPolicy::BlobLength);
        let axi = image.axi_dma.unwrap();
        assert_eq!(axi.dma_uio, PathBuf::from("/dev/uio0"));
        assert_eq!(axi.poll_timeout_ms, Some(250));
    }

    #[test]
    fn axi_backend_without_table_rejected() {
        let err = AcceleratorImage::from_toml_str(
            r#"
            name = "broken"
            [backend]
            kind = "axi-dma"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ToyNetError::Load { .. }));
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!(AcceleratorImage::from_toml_str("name = \"x\"\n[backend]\nkind = \"gpu\"\n").is_err());
    }

    #[test]
    fn missing_file_is_load_error() {
        let err = AcceleratorImage::from_file("/nonexistent/toynet.toml").unwrap_err();
        assert!(matches!(err, ToyNetError::Load { .. }));
    }

    #[test]
    fn ack_policies() {
        assert!(AckPolicy::default().accepts(1, 61_750));
        assert!(!AckPolicy::default().accepts(0, 61_750));
        assert!(AckPolicy::NonZero.accepts(7, 0));
        assert!(AckPolicy::BlobLength.accepts(61_750, 61_750));
        assert!(!AckPolicy::BlobLength.accepts(1, 61_750));
    }

    #[test]
    fn manifest_roundtrips_through_toml() {
        let image = AcceleratorImage::loopback("empty");
        let text = image.to_toml_string().unwrap();
        assert_eq!(AcceleratorImage::from_toml_str(&text).unwrap(), image);
    }
}
