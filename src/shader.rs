//! Precompiled kernel binaries and shader modules
//!
//! The kernel arrives as an opaque SPIR-V blob produced by an external
//! compiler (`glslc`, `glslangValidator`, ...). This module only reads it,
//! checks that it looks like SPIR-V, and hands the words to the driver.
//! Each binary is identified in logs by the SHA-256 of its bytes.

use std::ffi::CString;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use ash::vk;
use sha2::{Digest, Sha256};

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::teardown::ReleaseStage;

/// SPIR-V magic number (little-endian)
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A kernel binary read fully into memory.
#[derive(Clone)]
pub struct KernelBinary {
    words: Vec<u32>,
    digest: [u8; 32],
    source: Option<PathBuf>,
}

impl KernelBinary {
    /// Read the whole file at `path`.
    ///
    /// # Errors
    ///
    /// * `KernelBinaryNotFound` - nothing at `path`
    /// * `KernelBinaryUnreadable` - any other I/O failure
    /// * `InvalidSpirv` - contents are not a SPIR-V module
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ComputeError::KernelBinaryNotFound(path.to_path_buf()),
            _ => ComputeError::KernelBinaryUnreadable {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        let mut binary = Self::from_bytes(&bytes)?;
        binary.source = Some(path.to_path_buf());

        log::info!(
            "Loaded kernel binary {} ({} bytes, sha256 {})",
            path.display(),
            bytes.len(),
            binary.digest_hex()
        );
        Ok(binary)
    }

    /// Wrap in-memory SPIR-V bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ComputeError::InvalidSpirv("empty binary".to_string()));
        }
        if bytes.len() % 4 != 0 {
            return Err(ComputeError::InvalidSpirv(format!(
                "length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        // read_spv copies into aligned words and fixes endianness
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| ComputeError::InvalidSpirv(e.to_string()))?;

        if words.first().copied() != Some(SPIRV_MAGIC) {
            return Err(ComputeError::InvalidSpirv(format!(
                "bad magic {:#010x}",
                words.first().copied().unwrap_or(0)
            )));
        }

        Ok(Self {
            words,
            digest: Sha256::digest(bytes).into(),
            source: None,
        })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// First 8 bytes of the digest, hex encoded.
    pub fn digest_hex(&self) -> String {
        self.digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// `VkShaderModule` plus the entry point it will be invoked through.
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    pub entry_point: String,
    entry_point_cstr: CString,
    owner: u64,
    ctx: DeviceContext,
}

impl ShaderModule {
    /// Create a shader module; `owner` ties its release to the pipeline
    /// that uses it.
    pub(crate) fn new(
        ctx: &DeviceContext,
        binary: &KernelBinary,
        entry_point: &str,
        owner: u64,
    ) -> Result<Self> {
        let entry_point_cstr = CString::new(entry_point).map_err(|e| {
            ComputeError::PipelineCreationFailed {
                entry_point: entry_point.to_string(),
                reason: format!("invalid entry point name: {}", e),
            }
        })?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(binary.words());

        let handle = unsafe { ctx.device().create_shader_module(&create_info, None) }.map_err(|e| {
            ComputeError::PipelineCreationFailed {
                entry_point: entry_point.to_string(),
                reason: format!("vkCreateShaderModule: {:?}", e),
            }
        })?;

        log::debug!(
            "Created shader module: entry={}, {} bytes, sha256 {}",
            entry_point,
            binary.byte_len(),
            binary.digest_hex()
        );

        Ok(Self {
            handle,
            entry_point: entry_point.to_string(),
            entry_point_cstr,
            owner,
            ctx: ctx.clone(),
        })
    }

    pub fn entry_point_cstr(&self) -> &std::ffi::CStr {
        &self.entry_point_cstr
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        log::debug!("Destroying shader module ({})", self.entry_point);
        unsafe {
            self.ctx.device().destroy_shader_module(self.handle, None);
        }
        self.ctx.ledger().record(self.owner, ReleaseStage::ShaderModule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_header() -> Vec<u8> {
        // magic, version 1.0, generator, bound, schema
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hlx_dispatch_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_from_bytes_accepts_header() {
        let binary = KernelBinary::from_bytes(&spirv_header()).unwrap();
        assert_eq!(binary.words()[0], SPIRV_MAGIC);
        assert_eq!(binary.byte_len(), 20);
        assert_eq!(binary.digest_hex().len(), 16);
    }

    #[test]
    fn test_bad_magic() {
        let bytes = [0xdeu8, 0xad, 0xbe, 0xef];
        assert!(matches!(
            KernelBinary::from_bytes(&bytes),
            Err(ComputeError::InvalidSpirv(_))
        ));
    }

    #[test]
    fn test_unaligned_length() {
        let mut bytes = spirv_header();
        bytes.push(0);
        assert!(matches!(
            KernelBinary::from_bytes(&bytes),
            Err(ComputeError::InvalidSpirv(_))
        ));
    }

    #[test]
    fn test_empty_binary() {
        assert!(KernelBinary::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let path = temp_path("does_not_exist.spv");
        match KernelBinary::load(&path) {
            Err(ComputeError::KernelBinaryNotFound(p)) => assert_eq!(p, path),
            other => panic!("expected KernelBinaryNotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_load_directory_is_unreadable() {
        let dir = std::env::temp_dir();
        assert!(matches!(
            KernelBinary::load(&dir),
            Err(ComputeError::KernelBinaryUnreadable { .. })
        ));
    }

    #[test]
    fn test_load_roundtrip_digest() {
        let path = temp_path("header.spv");
        let bytes = spirv_header();
        std::fs::write(&path, &bytes).unwrap();

        let binary = KernelBinary::load(&path).unwrap();
        let expected: [u8; 32] = Sha256::digest(&bytes).into();
        assert_eq!(binary.digest(), &expected);
        assert_eq!(binary.source(), Some(path.as_path()));

        std::fs::remove_file(&path).ok();
    }
}
