//! Snapshot-directory writer: serializes an architectural capture into the flat file
//! layout consumed by the replay tooling (`registers<N>`, `memory`, `usedblocks`, `time`).

use basalt_core::snapshot::SystemSnapshot;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub fn write(dir: &Path, snapshot: &SystemSnapshot, hart_count: usize) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    for (ix, hart) in snapshot.harts.iter().enumerate().take(hart_count) {
        let mut file = fs::File::create(dir.join(format!("registers{ix}")))?;
        writeln!(file, "pc {:#x}", hart.pc)?;
        for (reg, value) in hart.x.iter().enumerate() {
            writeln!(file, "x{reg} {value:#x}")?;
        }
        for (reg, value) in hart.f.iter().enumerate() {
            writeln!(file, "f{reg} {value:#x}")?;
        }
        for (number, value) in &hart.csrs {
            writeln!(file, "csr {number:#05x} {value:#x}")?;
        }
    }

    let mut usedblocks = fs::File::create(dir.join("usedblocks"))?;
    let mut memory = fs::File::create(dir.join("memory"))?;
    for (addr, bytes) in &snapshot.memory.blocks {
        writeln!(usedblocks, "{addr:#x} {:#x}", bytes.len())?;
        write!(memory, "{addr:#x}:")?;
        for byte in bytes {
            write!(memory, "{byte:02x}")?;
        }
        writeln!(memory)?;
    }

    fs::write(dir.join("time"), format!("{}\n", snapshot.time))?;
    Ok(())
}
