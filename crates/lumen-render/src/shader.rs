// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V binaries for the two built-in passes.
//!
//! Binaries live at `<dir>/<pass>.<stage>.spv`, e.g. `shaders/gbuffer.vert.spv`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::{RenderError, Result};

/// Turns the bytes of a `.spv` file into host-order words.
pub type SpirvDecoder = fn(&[u8]) -> std::result::Result<Vec<u32>, String>;

pub const ENTRY_POINT: &str = "main";
pub const GEOMETRY_PASS: &str = "gbuffer";
pub const LIGHTING_PASS: &str = "lighting";

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn suffix(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
        }
    }
}

/// Vertex and fragment words for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSet {
    pub pass: &'static str,
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    pub fn path(dir: &Path, pass: &str, stage: ShaderStage) -> PathBuf {
        dir.join(format!("{pass}.{}.spv", stage.suffix()))
    }

    pub fn load(dir: &Path, pass: &'static str) -> Result<Self> {
        Self::load_with(dir, pass, decode_words)
    }

    pub fn load_with(dir: &Path, pass: &'static str, decode: SpirvDecoder) -> Result<Self> {
        let vertex = load_stage(dir, pass, ShaderStage::Vertex, decode)?;
        let fragment = load_stage(dir, pass, ShaderStage::Fragment, decode)?;
        Ok(Self {
            pass,
            vertex,
            fragment,
        })
    }
}

/// Both pass shader sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLibrary {
    pub geometry: ShaderSet,
    pub lighting: ShaderSet,
}

impl ShaderLibrary {
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_with(dir, decode_words)
    }

    /// Loads both passes, splitting each file into words with `decode`.
    /// The header is checked after decoding whichever decoder is used.
    pub fn load_with(dir: &Path, decode: SpirvDecoder) -> Result<Self> {
        Ok(Self {
            geometry: ShaderSet::load_with(dir, GEOMETRY_PASS, decode)?,
            lighting: ShaderSet::load_with(dir, LIGHTING_PASS, decode)?,
        })
    }

    /// Header-only modules for both passes, for devices that never compile them.
    pub fn header_only() -> Self {
        let set = |pass| ShaderSet {
            pass,
            vertex: header_only_module(),
            fragment: header_only_module(),
        };
        Self {
            geometry: set(GEOMETRY_PASS),
            lighting: set(LIGHTING_PASS),
        }
    }
}

fn load_stage(dir: &Path, pass: &str, stage: ShaderStage, decode: SpirvDecoder) -> Result<Vec<u32>> {
    let path = ShaderSet::path(dir, pass, stage);
    let bytes = fs::read(&path).map_err(|source| RenderError::ShaderMissing {
        path: path.clone(),
        source,
    })?;
    let words = decode(&bytes)
        .and_then(|words| match check_header(&words) {
            Ok(()) => Ok(words),
            Err(reason) => Err(reason.to_owned()),
        })
        .map_err(|reason| RenderError::ShaderInvalid {
            path: path.clone(),
            reason,
        })?;
    debug!("loaded {} ({} words)", path.display(), words.len());
    Ok(words)
}

fn decode_words(bytes: &[u8]) -> std::result::Result<Vec<u32>, String> {
    spirv_words(bytes).map_err(str::to_owned)
}

/// Header checks shared by every decoder.
fn check_header(words: &[u32]) -> std::result::Result<(), &'static str> {
    if words.len() < HEADER_WORDS {
        return Err("shorter than the SPIR-V header");
    }
    if words[0] != SPIRV_MAGIC {
        return Err("bad magic number");
    }
    Ok(())
}

/// Splits a SPIR-V binary into words, fixing up byte order from the magic.
pub fn spirv_words(bytes: &[u8]) -> std::result::Result<Vec<u32>, &'static str> {
    if bytes.len() % 4 != 0 {
        return Err("length is not a multiple of 4");
    }
    if bytes.len() < HEADER_WORDS * 4 {
        return Err("shorter than the SPIR-V header");
    }
    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    match words[0] {
        SPIRV_MAGIC => {}
        m if m.swap_bytes() == SPIRV_MAGIC => words.iter_mut().for_each(|w| *w = w.swap_bytes()),
        _ => return Err("bad magic number"),
    }
    Ok(words)
}

/// Smallest well-formed module: the five header words.
pub fn header_only_module() -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0000, 0, 8, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir() -> PathBuf {
        static N: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "lumen-shader-{}-{}",
            std::process::id(),
            N.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn stub_bytes() -> Vec<u8> {
        header_only_module().iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn path_follows_pass_and_stage() {
        let p = ShaderSet::path(Path::new("shaders"), "lighting", ShaderStage::Fragment);
        assert_eq!(p, Path::new("shaders/lighting.frag.spv"));
    }

    #[test]
    fn rejects_truncated_and_foreign_binaries() {
        assert!(spirv_words(&[0u8; 6]).is_err());
        assert!(spirv_words(&[0u8; 8]).is_err());
        assert_eq!(spirv_words(&[0u8; 20]), Err("bad magic number"));
    }

    #[test]
    fn accepts_big_endian_binaries() {
        let be: Vec<u8> = header_only_module().iter().flat_map(|w| w.to_be_bytes()).collect();
        assert_eq!(spirv_words(&be).unwrap(), header_only_module());
    }

    #[test]
    fn decoded_words_still_need_a_header() {
        assert_eq!(check_header(&header_only_module()), Ok(()));
        assert_eq!(check_header(&[SPIRV_MAGIC, 0, 0]), Err("shorter than the SPIR-V header"));
        assert_eq!(check_header(&[0; HEADER_WORDS]), Err("bad magic number"));
    }

    #[test]
    fn custom_decoder_output_is_validated() {
        let dir = scratch_dir();
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            fs::write(ShaderSet::path(&dir, GEOMETRY_PASS, stage), stub_bytes()).unwrap();
        }
        let zeros: SpirvDecoder = |bytes| Ok(vec![0; bytes.len() / 4]);
        match ShaderSet::load_with(&dir, GEOMETRY_PASS, zeros).unwrap_err() {
            RenderError::ShaderInvalid { reason, .. } => assert_eq!(reason, "bad magic number"),
            other => panic!("unexpected {other}"),
        }
        assert!(ShaderSet::load_with(&dir, GEOMETRY_PASS, decode_words).is_ok());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_stage_reports_its_path() {
        let dir = scratch_dir();
        fs::write(ShaderSet::path(&dir, "gbuffer", ShaderStage::Vertex), stub_bytes()).unwrap();
        let err = ShaderSet::load(&dir, "gbuffer").unwrap_err();
        match err {
            RenderError::ShaderMissing { path, .. } => {
                assert!(path.ends_with("gbuffer.frag.spv"))
            }
            other => panic!("unexpected {other}"),
        }
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn library_loads_both_passes() {
        let dir = scratch_dir();
        for pass in [GEOMETRY_PASS, LIGHTING_PASS] {
            for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
                fs::write(ShaderSet::path(&dir, pass, stage), stub_bytes()).unwrap();
            }
        }
        let lib = ShaderLibrary::load(&dir).unwrap();
        assert_eq!(lib.geometry.pass, "gbuffer");
        assert_eq!(lib.lighting.fragment, header_only_module());
        fs::remove_dir_all(dir).ok();
    }
}
