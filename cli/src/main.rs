mod interactive;

use std::{fs::File, io::Read, path::PathBuf};

use anyhow::Result;
use cache_sim::{config::SimConfig, memory::MAX_MEMORY_WIDTH, sim::Simulator, trace};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// replay a trace file
    Run(RunArgs),
    /// replay a random trace, checked against uncached memory
    Random(RandomArgs),
    /// issue reads and writes by hand
    Interactive(InteractiveArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// File path to JSON configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// log2 of total cache size in bytes
    #[arg(long)]
    total_width: Option<u32>,
    /// log2 of ways per set
    #[arg(long)]
    assoc_width: Option<u32>,
    /// log2 of block size in bytes
    #[arg(long)]
    block_width: Option<u32>,
    /// log2 of memory size in bytes
    #[arg(long)]
    memory_width: Option<u32>,
    /// Seed of the replacement policy
    #[arg(long)]
    seed: Option<u64>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    delegate: CommonArgs,
    /// File path to input trace
    #[arg(short, long)]
    trace: PathBuf,
    /// Compare every read with uncached memory
    #[arg(long)]
    check: bool,
}

#[derive(Args, Debug)]
struct RandomArgs {
    #[command(flatten)]
    delegate: CommonArgs,
    /// Number of operations
    #[arg(short = 'n', long, default_value_t = 100_000)]
    count: usize,
    /// log2 of the range of generated addresses
    #[arg(
        long,
        default_value_t = 16,
        value_parser = clap::value_parser!(u32).range(2..=MAX_MEMORY_WIDTH as i64)
    )]
    addr_width: u32,
}

#[derive(Args, Debug)]
struct InteractiveArgs {
    #[command(flatten)]
    delegate: CommonArgs,
}

impl CommonArgs {
    fn init_logger(&self) {
        if self.verbose {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
        } else {
            env_logger::init();
        }
    }
    /// configuration file first, then flags on top of it.
    fn load_config(&self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(p) => SimConfig::from_reader(File::open(p)?)?,
            None => SimConfig::default(),
        };
        macro_rules! overwrite {
            ($($arg:ident => $field:ident),*) => {
                $(if let Some(v) = self.$arg {
                    config.$field = v;
                })*
            };
        }
        overwrite!(
            total_width => total_width,
            assoc_width => associativity_width,
            block_width => block_width,
            memory_width => memory_width
        );
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Run(RunArgs {
            delegate,
            trace,
            check,
        }) => {
            delegate.init_logger();
            let mut config = delegate.load_config()?;
            config.check |= check;
            let src = {
                let mut buf = String::new();
                let mut file = File::open(trace)?;
                file.read_to_string(&mut buf)?;
                buf
            };
            let ops = trace::parse_trace(&src)?;
            let mut sim = Simulator::new(&config)?;
            sim.run(ops)?;
            log::info!("finished execution.");
            output_stat(&sim);
            Ok(())
        }
        Command::Random(RandomArgs {
            delegate,
            count,
            addr_width,
        }) => {
            delegate.init_logger();
            let mut config = delegate.load_config()?;
            config.check = true;
            if addr_width > config.memory_width {
                log::warn!(
                    "addresses wider than memory ({addr_width} > {}) alias each other.",
                    config.memory_width
                );
            }
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed ^ 0x5EED),
                None => StdRng::from_entropy(),
            };
            let ops = trace::random_trace(&mut rng, count, addr_width);
            let mut sim = Simulator::new(&config)?;
            sim.run(ops)?;
            println!("random test passed: {count} operations.");
            output_stat(&sim);
            Ok(())
        }
        Command::Interactive(InteractiveArgs { delegate }) => {
            delegate.init_logger();
            let config = delegate.load_config()?;
            let mut sim = Simulator::new(&config)?;
            interactive::execute_interactive(&mut sim)
        }
    }
}

#[cfg(not(feature = "stat"))]
fn output_stat(_: &Simulator) {}

#[cfg(feature = "stat")]
fn output_stat(sim: &Simulator) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", sim.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}
