//! Program-image loading: ELF, Verilog hex, and raw binaries.

use goblin::elf::program_header::PT_LOAD;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A contiguous chunk to place in physical memory.
#[derive(Debug)]
pub struct Segment {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// Everything the loaders produced.
#[derive(Debug, Default)]
pub struct Images {
    pub segments: Vec<Segment>,
    /// ELF entry point, if an ELF was loaded.
    pub entry: Option<u64>,
    /// Address of the `tohost` symbol, if present.
    pub tohost: Option<u64>,
}

#[derive(Debug)]
pub enum LoadError {
    Io(PathBuf, std::io::Error),
    Elf(String),
    Hex(String),
    BadBinarySpec(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(path, err) => write!(f, "{}: {err}", path.display()),
            LoadError::Elf(what) => write!(f, "bad ELF: {what}"),
            LoadError::Hex(what) => write!(f, "bad hex image: {what}"),
            LoadError::BadBinarySpec(spec) => {
                write!(f, "bad --binary spec {spec:?}, expected file[:offset]")
            }
        }
    }
}

impl std::error::Error for LoadError {}

pub fn load_images(
    target: &Option<PathBuf>,
    hex: &Option<PathBuf>,
    binaries: &[String],
) -> Result<Images, LoadError> {
    let mut images = Images::default();
    if let Some(path) = target {
        load_elf(path, &mut images)?;
    }
    if let Some(path) = hex {
        load_hex(path, &mut images)?;
    }
    for spec in binaries {
        load_binary(spec, &mut images)?;
    }
    Ok(images)
}

fn load_elf(path: &Path, images: &mut Images) -> Result<(), LoadError> {
    let buf = fs::read(path).map_err(|e| LoadError::Io(path.to_path_buf(), e))?;
    let elf = goblin::elf::Elf::parse(&buf).map_err(|e| LoadError::Elf(e.to_string()))?;
    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let mut bytes = buf
            .get(header.file_range())
            .ok_or_else(|| LoadError::Elf("segment out of file bounds".into()))?
            .to_vec();
        // Zero-fill .bss-style tails.
        bytes.resize(header.p_memsz as usize, 0);
        images.segments.push(Segment {
            addr: header.p_paddr,
            bytes,
        });
    }
    images.entry = Some(elf.entry);
    for sym in elf.syms.iter() {
        if elf.strtab.get_at(sym.st_name) == Some("tohost") {
            images.tohost = Some(sym.st_value);
        }
    }
    Ok(())
}

// Verilog-hex: `@address` lines switch the cursor, other tokens are bytes.
fn load_hex(path: &Path, images: &mut Images) -> Result<(), LoadError> {
    let text = fs::read_to_string(path).map_err(|e| LoadError::Io(path.to_path_buf(), e))?;
    let mut addr = 0u64;
    let mut current: Option<Segment> = None;
    for token in text.split_whitespace() {
        if let Some(hex_addr) = token.strip_prefix('@') {
            if let Some(segment) = current.take() {
                images.segments.push(segment);
            }
            addr = u64::from_str_radix(hex_addr, 16)
                .map_err(|_| LoadError::Hex(format!("bad address token {token:?}")))?;
            continue;
        }
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| LoadError::Hex(format!("bad byte token {token:?}")))?;
        match &mut current {
            Some(segment) => segment.bytes.push(byte),
            None => {
                current = Some(Segment {
                    addr,
                    bytes: vec![byte],
                })
            }
        }
        addr += 1;
    }
    if let Some(segment) = current {
        images.segments.push(segment);
    }
    Ok(())
}

fn load_binary(spec: &str, images: &mut Images) -> Result<(), LoadError> {
    let mut parts = spec.splitn(2, ':');
    let path = PathBuf::from(parts.next().unwrap_or_default());
    let offset = match parts.next() {
        Some(text) => parse_u64(text).ok_or_else(|| LoadError::BadBinarySpec(spec.into()))?,
        None => 0,
    };
    let bytes = fs::read(&path).map_err(|e| LoadError::Io(path, e))?;
    images.segments.push(Segment {
        addr: offset,
        bytes,
    });
    Ok(())
}

fn parse_u64(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
