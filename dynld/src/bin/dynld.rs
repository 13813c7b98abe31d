#![allow(clippy::print_stdout, clippy::print_stderr)]

use argh::FromArgs;
use eyre::Result;
use log::LevelFilter;
use stderrlog::LogLevelNum;

use dynld::sys::mem::MmapSystem;
use dynld::{Linker, LinkerConfig};

#[derive(FromArgs)]
/// Map a dynamic object graph and print its load maps, dependencies and
/// debugger link-map view. This is a development tool; the production entry
/// point is the in-process linker library.
struct DynldArgs {
    /// path of the executable or shared object to load
    #[argh(positional)]
    path: String,

    /// additional library search path (repeatable)
    #[argh(option, short = 'L')]
    search: Vec<String>,

    /// resolve every PLT entry at load time
    #[argh(switch)]
    bind_now: bool,

    /// verbose output
    #[argh(switch, short = 'V')]
    verbose: bool,
}

fn init_logger(level: LevelFilter) {
    let mut log = stderrlog::new();
    log.module("dynld");
    log.verbosity(LogLevelNum::from(level));
    log.init().unwrap();
}

fn main() -> Result<()> {
    let args: DynldArgs = argh::from_env();
    init_logger(if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });

    let mut config = LinkerConfig::default();
    config.bind_now = args.bind_now;
    config
        .search_paths
        .extend(args.search.iter().map(Into::into));

    let linker = Linker::new(MmapSystem::default(), config);
    let root = linker.load_main(&args.path)?;

    linker.with_read(|state| {
        for &id in &state.order {
            let Some(obj) = state.object(id) else {
                continue;
            };
            println!(
                "{}{} (refcount {})",
                obj.path,
                if Some(id) == state.main { " [main]" } else { "" },
                obj.refcount
            );
            for seg in &obj.load_map.segments {
                println!(
                    "  segment vaddr {:#010x} -> {:#010x} memsz {:#x} flags {:#x}",
                    seg.vaddr, seg.runtime_addr, seg.memsz, seg.flags
                );
            }
            for needed in &obj.needed {
                match needed.obj {
                    Some(dep) => println!("  needs {} (#{})", needed.name, dep.0),
                    None => println!("  needs {} (unresolved)", needed.name),
                }
            }
        }
        let _ = root;
    });

    println!("link map:");
    for entry in linker.link_maps() {
        println!("  {:#010x} {} ld {:#010x}", entry.addr, entry.name, entry.ld);
    }
    Ok(())
}
