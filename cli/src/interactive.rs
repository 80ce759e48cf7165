use std::io::{stdin, stdout, Write};

use anyhow::Result;
use cache_sim::{
    cache::CacheSlot,
    common::Addr,
    sim::Simulator,
    trace::{TraceOp, FULL_MASK},
};

#[cfg(feature = "stat")]
use cache_sim::stat::AddStats;

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule usize() -> usize
        = n:$(quiet!{['0'..='9']+}) {? n.parse().or(Err("usize")) }
        / expected!("usize")
    rule radix() -> usize
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9'|'a'..='f'|'A'..='F']+}) {?
            usize::from_str_radix(n, 16).or(Err("hexadecimal"))
        }
    rule number() -> usize
        = radix() / usize()
    rule word() -> u32
        = n:number() {? u32::try_from(n).or(Err("32-bit word")) }
    rule addr() -> Addr
        = n:number() { Addr::new(n) }
    rule read() = "read" / "r"
    rule write() = "write" / "w"
    rule mem() = "memory" / "mem"
    rule mask() -> u32
        = __ "mask" __ m:word() { m }
    rule show_kind() -> ShowKind
        = ("geometry" / "geo") { ShowKind::Geometry }
        / "set" __ n:number() { ShowKind::Set(n) }
        / "cycles" { ShowKind::Cycles }
        / "stat" { ShowKind::Stat }
        / mem() __ addr:addr() { ShowKind::Memory(addr) }
    pub(crate) rule parse_command() -> Command
        = _ "show" __ s:show_kind() _ { Command::Show(s) }
        / _ "flush" _ { Command::Flush }
        / _ "exit" _ { Command::Exit }
        / _ write() __ addr:addr() __ data:word() mask:mask()? _ {
            Command::Op(TraceOp::Write {
                addr: addr.inner(),
                data,
                mask: mask.unwrap_or(FULL_MASK),
            })
        }
        / _ read() __ addr:addr() _ { Command::Op(TraceOp::Read { addr: addr.inner() }) }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Op(TraceOp),
    Show(ShowKind),
    Flush,
    Exit,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ShowKind {
    Geometry,
    Set(usize),
    Cycles,
    Stat,
    Memory(Addr),
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn show_slot(way: usize, slot: &CacheSlot) {
    let flags = match (slot.is_valid(), slot.is_dirty()) {
        (false, _) => "-",
        (true, false) => "V",
        (true, true) => "VD",
    };
    let data = slot
        .data()
        .chunks(4)
        .map(|c| format!("{:02x}{:02x}{:02x}{:02x}", c[3], c[2], c[1], c[0]))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  way {way:>3} [{flags:<2}] tag {:#x}: {data}", slot.tag());
}

fn show(sim: &Simulator, kind: ShowKind) {
    match kind {
        ShowKind::Geometry => {
            let g = sim.cache().geometry();
            println!("{g}");
            println!(
                "  tag | set index ({} bits) | offset ({} bits)",
                g.set_index_width(),
                g.block_width()
            );
        }
        ShowKind::Set(n) => {
            let sets = sim.cache().geometry().sets();
            if n >= sets {
                println!("set {n} out of range: the cache has {sets} sets");
                return;
            }
            println!("set {n}:");
            for (way, slot) in sim.cache().set_slots(n).iter().enumerate() {
                show_slot(way, slot);
            }
        }
        ShowKind::Cycles => {
            println!("cycle #{}", sim.cache().cycles());
        }
        #[cfg(feature = "stat")]
        ShowKind::Stat => {
            let mut stats = Default::default();
            sim.add_stats(&mut stats);
            println!(
                "{}",
                stats.view(get_terminal_width().unwrap_or(60) as usize)
            );
        }
        #[cfg(not(feature = "stat"))]
        ShowKind::Stat => {
            println!("try compile with `--features stat`");
        }
        ShowKind::Memory(addr) => {
            let v = sim.cache().store().read_word(addr.inner());
            println!("M[{addr}] == {v:#010x} (uncached)");
        }
    }
}

pub fn execute_interactive(sim: &mut Simulator) -> Result<()> {
    println!("entering interactive.");
    loop {
        print!("> ");
        stdout().flush()?;
        let mut str = String::new();
        if stdin().read_line(&mut str)? == 0 {
            break;
        }
        if str.trim().is_empty() {
            continue;
        }
        let parsed = match command::parse_command(&str) {
            Ok(p) => p,
            Err(e) => {
                println!("parse error: expected {}", e.expected);
                continue;
            }
        };
        match parsed {
            Command::Op(op) => match sim.step(op) {
                Ok(Some(v)) => println!("M[{}] == {v:#010x}", Addr::new(op.addr())),
                Ok(None) => println!("ok"),
                Err(e) => println!("{e}"),
            },
            Command::Show(s) => show(sim, s),
            Command::Flush => {
                sim.cache_mut().flush();
                println!("flushed");
            }
            Command::Exit => break,
        }
    }
    println!("exiting interactive.");
    Ok(())
}
