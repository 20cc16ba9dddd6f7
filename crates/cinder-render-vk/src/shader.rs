// SPDX-License-Identifier: CEPL-1.0
//! Opaque SPIR-V payloads.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use ash::util::read_spv;

use crate::error::{Error, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// SPIR-V words, checked only for length and magic number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    words: Vec<u32>,
}

impl ShaderBlob {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| Error::Shader {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes, path.to_path_buf())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(bytes, PathBuf::from("<memory>"))
    }

    /// Wraps words that are already SPIR-V.
    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// A bare module header. Drivers that never compile shaders (the
    /// headless one) accept it; a real device would reject it.
    pub fn placeholder() -> Self {
        Self {
            words: vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0],
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    fn parse(bytes: &[u8], path: PathBuf) -> Result<Self> {
        let words =
            read_spv(&mut Cursor::new(bytes)).map_err(|source| Error::Shader { path, source })?;
        Ok(Self { words })
    }
}
