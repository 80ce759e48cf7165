use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;

use crate::{
    cache::Cache,
    common::Addr,
    config::SimConfig,
    memory::Memory,
    trace::{self, TraceOp},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SimError {
    #[error("operation #{index} read {actual:#010x} from {addr}, expected {expected:#010x}")]
    Mismatch {
        index: usize,
        addr: Addr,
        expected: u32,
        actual: u32,
    },
    #[error("memory diverged from the reference after flush, first at {addr}")]
    MemoryDiverged { addr: Addr },
}

/// Drives a cache over trace operations, optionally shadowed by an uncached
/// reference memory.
pub struct Simulator {
    cache: Cache<Memory, StdRng>,
    reference: Option<Memory>,
    executed: usize,
    #[cfg(feature = "stat")]
    stat_builder: stat::SimStatBuilder,
}

impl Simulator {
    pub fn new(config: &SimConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        let memory = Memory::new(config.memory_width, config.block_width)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let reference = if config.check {
            log::info!("reads are checked against an uncached reference.");
            Some(Memory::new(config.memory_width, config.block_width)?)
        } else {
            None
        };
        log::info!("cache: {geometry}");
        Ok(Self {
            cache: Cache::new(geometry, memory, rng),
            reference,
            executed: 0,
            #[cfg(feature = "stat")]
            stat_builder: stat::SimStatBuilder::new(),
        })
    }

    pub fn cache(&self) -> &Cache<Memory, StdRng> {
        &self.cache
    }
    pub fn cache_mut(&mut self) -> &mut Cache<Memory, StdRng> {
        &mut self.cache
    }
    pub fn executed(&self) -> usize {
        self.executed
    }
    pub fn is_checking(&self) -> bool {
        self.reference.is_some()
    }

    /// executes one operation, returning the word for reads.
    pub fn step(&mut self, op: TraceOp) -> Result<Option<u32>, SimError> {
        let index = self.executed;
        self.executed += 1;
        log::trace!("#{index}: {}", trace::describe(&op));
        match op {
            TraceOp::Read { addr } => {
                let actual = self.cache.read(addr);
                if let Some(reference) = &self.reference {
                    let expected = reference.read_word(addr);
                    if expected != actual {
                        return Err(SimError::Mismatch {
                            index,
                            addr: Addr::new(addr),
                            expected,
                            actual,
                        });
                    }
                }
                Ok(Some(actual))
            }
            TraceOp::Write { addr, data, mask } => {
                self.cache.write(addr, data, mask);
                if let Some(reference) = &mut self.reference {
                    reference.write_word(addr, data, mask);
                }
                Ok(None)
            }
        }
    }

    /// executes all of `ops`, then flushes.
    pub fn run(&mut self, ops: impl IntoIterator<Item = TraceOp>) -> Result<(), SimError> {
        for op in ops {
            self.step(op)?;
        }
        self.finish()
    }

    /// writes dirty blocks back and, when checking, compares both memories.
    pub fn finish(&mut self) -> Result<(), SimError> {
        self.cache.flush();
        #[cfg(feature = "stat")]
        self.stat_builder.stop_timer();
        log::info!(
            "finished {} operations in {} cycles.",
            self.executed,
            self.cache.cycles()
        );
        let Some(reference) = &self.reference else {
            return Ok(());
        };
        let actual = self.cache.store().as_bytes();
        match reference
            .as_bytes()
            .iter()
            .zip(actual)
            .position(|(e, a)| e != a)
        {
            Some(addr) => Err(SimError::MemoryDiverged {
                addr: Addr::new(addr),
            }),
            None => Ok(()),
        }
    }
}

impl Simulator {
    #[cfg(feature = "stat")]
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl AddStats for Simulator {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat_builder.finish(self.executed)));
        self.cache.add_stats(buf);
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::{fmt, time};

    use crate::stat::*;

    pub struct SimStatBuilder {
        begin: time::Instant,
        elapsed: Option<time::Duration>,
    }

    impl SimStatBuilder {
        pub fn new() -> Self {
            Self {
                begin: time::Instant::now(),
                elapsed: None,
            }
        }
        pub fn stop_timer(&mut self) {
            self.elapsed = Some(time::Instant::now() - self.begin)
        }
        /// a stat taken before the timer stops reports the time so far.
        pub fn finish(&self, executed: usize) -> SimStat {
            SimStat {
                executed,
                elapsed: self
                    .elapsed
                    .unwrap_or_else(|| time::Instant::now() - self.begin),
            }
        }
    }

    impl Default for SimStatBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct SimStat {
        executed: usize,
        elapsed: time::Duration,
    }

    impl Stat for SimStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SimStat {
        fn header(&self) -> &'static str {
            "simulator stat"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ SimStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let ms = format!("{} ms", self.elapsed.as_millis());
            writeln!(f, "  elapsed total: {ms:>9}")?;
            let executed = format!("#{}", self.executed);
            write!(f, "  operations total: {executed:>10}")
        }
    }
}
