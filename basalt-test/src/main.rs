//! Compliance-test runner: run an ELF to its to-host halt and dump the signature region as
//! 32-bit hex words.

use basalt_core::session::StopReason;
use basalt_core::system::{System, SystemConfig};
use basalt_core::Rv64;
use clap::Parser;
use goblin::elf::program_header::PT_LOAD;
use std::fs::File;
use std::io::Read;
use std::io::Write;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Where to write the signature words once the run halts.
    #[arg(long, short)]
    signature: Option<String>,
    /// Compliance-test ELF; run on a single-hart `System` until its to-host write.
    elf: String,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let mut buf = Vec::new();

    let mut file = File::open(args.elf)?;
    file.read_to_end(&mut buf)?;

    let elf = goblin::elf::Elf::parse(&buf).expect("compliance image is not a readable ELF");

    let mut tohost = None;
    let mut signature_start = None;
    let mut signature_end = None;
    for sym in elf.syms.iter() {
        match elf.strtab.get_at(sym.st_name) {
            Some("tohost") => tohost = Some(sym.st_value),
            Some("begin_signature") => signature_start = Some(sym.st_value),
            Some("end_signature") => signature_end = Some(sym.st_value),
            _ => {}
        }
    }

    let mut system: System<Rv64> = System::new(
        SystemConfig {
            tohost,
            step_limit: Some(100_000_000),
            ..SystemConfig::default()
        },
        vec![],
    );
    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let mut bytes = buf[header.file_range()].to_vec();
        bytes.resize(header.p_memsz as usize, 0);
        system.load(header.p_paddr, &bytes);
    }
    system.hart_mut(0).registers_mut().set_pc(elf.entry);

    let reason = system.run();

    if let Some(path) = args.signature {
        let signature_start =
            signature_start.expect("compliance ELF does not export `begin_signature`");
        let signature_end = signature_end.expect("compliance ELF does not export `end_signature`");

        // The compliance tooling lays the region out 16-byte aligned, in whole words.
        assert!(signature_start % 16 == 0);
        assert!(signature_end % 4 == 0);
        assert!(signature_start <= signature_end);

        let mut file = File::create(path)?;
        for address in (signature_start..signature_end).step_by(4) {
            let mut word = [0u8; 4];
            system
                .memory()
                .peek(address, &mut word)
                .expect("signature region lies outside the configured physical memory");
            writeln!(file, "{:08x}", u32::from_le_bytes(word))?;
        }
    }

    match reason {
        StopReason::ToHost(1) => Ok(()),
        other => {
            eprintln!("test did not pass: {other:?}");
            std::process::exit(1);
        }
    }
}
