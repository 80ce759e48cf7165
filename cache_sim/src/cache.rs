use bitmask_enum::bitmask;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::{
    common::{merge_word_le, word_from_le},
    geometry::{Geometry, GeometryError},
    memory::BackingStore,
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// cycles charged for each access served by the cache itself.
pub const HIT_CYCLES: u64 = 1;

#[bitmask(u8)]
pub enum SlotFlags {
    Valid,
    Dirty,
}

/// One way of a set: a block of data and its bookkeeping.
#[derive(Clone)]
pub struct CacheSlot {
    data: Box<[u8]>,
    tag: usize,
    flags: SlotFlags,
}

impl CacheSlot {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0; block_size].into_boxed_slice(),
            tag: 0,
            flags: SlotFlags::none(),
        }
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn tag(&self) -> usize {
        self.tag
    }
    pub fn is_valid(&self) -> bool {
        self.flags.contains(SlotFlags::Valid)
    }
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(SlotFlags::Dirty)
    }
    fn holds(&self, tag: usize) -> bool {
        self.is_valid() && self.tag == tag
    }
    fn fill(&mut self, tag: usize) {
        self.tag = tag;
        self.flags = SlotFlags::Valid;
    }
    fn mark_dirty(&mut self) {
        debug_assert!(self.is_valid());
        self.flags |= SlotFlags::Dirty;
    }
    fn mark_clean(&mut self) {
        self.flags &= !SlotFlags::Dirty;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Read,
    Write,
}

/// Set-associative, write-back, write-allocate cache with random replacement.
///
/// Slots are stored flat, set by set: the ways of set `s` live at
/// `s * ways .. (s + 1) * ways`.
pub struct Cache<S, R = StdRng> {
    geometry: Geometry,
    slots: Vec<CacheSlot>,
    store: S,
    rng: R,
    cycles: u64,
    #[cfg(feature = "stat")]
    stat: stat::CacheStat,
}

impl<S: BackingStore> Cache<S, StdRng> {
    /// builds a cache with the default block width and an OS-seeded generator.
    pub fn init(
        total_width: u32,
        associativity_width: u32,
        store: S,
    ) -> Result<Self, GeometryError> {
        let geometry = Geometry::new(total_width, associativity_width)?;
        Ok(Self::new(geometry, store, StdRng::from_entropy()))
    }
    pub fn with_seed(geometry: Geometry, store: S, seed: u64) -> Self {
        Self::new(geometry, store, StdRng::seed_from_u64(seed))
    }
}

impl<S: BackingStore, R: RngCore> Cache<S, R> {
    pub fn new(geometry: Geometry, store: S, rng: R) -> Self {
        log::debug!("cache initialized: {geometry}");
        Self {
            slots: vec![CacheSlot::new(geometry.block_size()); geometry.num_slots()],
            geometry,
            store,
            rng,
            cycles: 0,
            #[cfg(feature = "stat")]
            stat: Default::default(),
        }
    }

    pub fn read(&mut self, addr: usize) -> u32 {
        let index = self.locate(addr, AccessKind::Read);
        let offset = self.geometry.aligned_offset(addr);
        word_from_le(&self.slots[index].data[offset..])
    }

    pub fn write(&mut self, addr: usize, data: u32, mask: u32) {
        let index = self.locate(addr, AccessKind::Write);
        let offset = self.geometry.aligned_offset(addr);
        let slot = &mut self.slots[index];
        merge_word_le(&mut slot.data[offset..], data, mask);
        slot.mark_dirty();
    }

    pub fn cycle_increase(&mut self, n: u64) {
        self.cycles += n;
    }
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// writes every dirty slot back. slots stay valid.
    pub fn flush(&mut self) {
        let mut written = 0usize;
        for index in 0..self.slots.len() {
            if self.slots[index].is_dirty() {
                let set_index = index >> self.geometry.associativity_width();
                self.write_back(index, set_index);
                written += 1;
            }
        }
        log::debug!("flushed {written} dirty slots");
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
    /// the ways of set `set_index`
    pub fn set_slots(&self, set_index: usize) -> &[CacheSlot] {
        let ways = self.geometry.ways();
        let start = set_index * ways;
        &self.slots[start..start + ways]
    }
    pub fn store(&self) -> &S {
        &self.store
    }
    pub fn into_store(self) -> S {
        self.store
    }

    /// finds the slot holding `addr`, filling a random way of its set on miss.
    fn locate(&mut self, addr: usize, kind: AccessKind) -> usize {
        self.cycle_increase(HIT_CYCLES);
        let tag = self.geometry.tag(addr);
        let set_index = self.geometry.set_index(addr);
        let first = self.geometry.slot_location(addr, 0);
        let ways = self.geometry.ways();
        if let Some(way) = self.slots[first..first + ways]
            .iter()
            .position(|slot| slot.holds(tag))
        {
            #[cfg(feature = "stat")]
            self.stat.on_hit(kind);
            return first + way;
        }
        #[cfg(feature = "stat")]
        self.stat.on_miss(kind);
        let way = self.rng.gen_range(0..ways);
        let index = first + way;
        log::trace!("{kind:?} miss at {addr:#x}: set {set_index}, way {way}");
        if self.slots[index].is_valid() {
            #[cfg(feature = "stat")]
            self.stat.on_evict();
            if self.slots[index].is_dirty() {
                self.write_back(index, set_index);
            }
        }
        self.fetch(index, addr);
        index
    }

    fn write_back(&mut self, index: usize, set_index: usize) {
        let slot = &mut self.slots[index];
        let block_number = self.geometry.compose_block_number(slot.tag, set_index);
        log::trace!("write back block {block_number:#x} from slot {index}");
        self.store.mem_write(block_number, &slot.data);
        slot.mark_clean();
        self.cycles += self.store.latency();
        #[cfg(feature = "stat")]
        self.stat.on_write_back();
    }

    fn fetch(&mut self, index: usize, addr: usize) {
        let slot = &mut self.slots[index];
        self.store.mem_read(self.geometry.block_number(addr), &mut slot.data);
        slot.fill(self.geometry.tag(addr));
        self.cycles += self.store.latency();
    }
}

#[cfg(feature = "stat")]
impl<S: BackingStore + AddStats, R: RngCore> Cache<S, R> {
    pub fn display_statistic(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl<S: BackingStore + AddStats, R> AddStats for Cache<S, R> {
    fn add_stats(&self, buf: &mut Stats) {
        let mut stat = self.stat;
        stat.cycles = self.cycles;
        buf.push(Box::new(stat));
        self.store.add_stats(buf);
    }
}

#[cfg(feature = "stat")]
impl<S, R> Cache<S, R> {
    pub fn hits(&self) -> u64 {
        self.stat.read_hit + self.stat.write_hit
    }
    pub fn misses(&self) -> u64 {
        self.stat.read_miss + self.stat.write_miss
    }
    pub fn evictions(&self) -> u64 {
        self.stat.eviction
    }
    pub fn write_backs(&self) -> u64 {
        self.stat.write_back
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use super::AccessKind;
    use crate::stat::*;

    #[derive(Clone, Copy, Default)]
    pub struct CacheStat {
        pub read_hit: u64,
        pub read_miss: u64,
        pub write_hit: u64,
        pub write_miss: u64,
        pub eviction: u64,
        pub write_back: u64,
        pub cycles: u64,
    }

    impl CacheStat {
        pub fn on_hit(&mut self, kind: AccessKind) {
            match kind {
                AccessKind::Read => self.read_hit += 1,
                AccessKind::Write => self.write_hit += 1,
            }
        }
        pub fn on_miss(&mut self, kind: AccessKind) {
            match kind {
                AccessKind::Read => self.read_miss += 1,
                AccessKind::Write => self.write_miss += 1,
            }
        }
        pub fn on_evict(&mut self) {
            self.eviction += 1;
        }
        pub fn on_write_back(&mut self) {
            self.write_back += 1;
        }
    }

    impl Stat for CacheStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ CacheStat {
        fn header(&self) -> &'static str {
            "cache access (format: `# of hit / # of miss (hit rate)`)"
        }
        fn width(&self) -> usize {
            46
        }
    }

    impl fmt::Display for &'_ CacheStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            macro_rules! output {
                ($hit:ident, $miss:ident => $name:expr) => {{
                    let h = self.$hit;
                    let m = self.$miss;
                    let rate = format!("({:.2}%)", ratio(h, h + m));
                    writeln!(f, "  {:>10}:{h:>11} /{m:>11} {rate:>9}", $name)
                }};
            }
            output!(read_hit, read_miss => "read")?;
            output!(write_hit, write_miss => "write")?;
            writeln!(f, "  {:>10}:{:>11}", "eviction", self.eviction)?;
            writeln!(f, "  {:>10}:{:>11}", "write back", self.write_back)?;
            write!(f, "  {:>10}:{:>11}", "cycles", self.cycles)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::memory::Memory;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Read(usize),
        Write(usize, Vec<u8>),
    }

    /// records every block transfer in order, backed by a plain `Memory`.
    struct Recorder {
        memory: Memory,
        events: Vec<Event>,
    }

    impl Recorder {
        fn new(block_width: u32) -> Self {
            Self {
                memory: Memory::new(16, block_width).unwrap(),
                events: Vec::new(),
            }
        }
    }

    impl BackingStore for Recorder {
        fn mem_read(&mut self, block_number: usize, buf: &mut [u8]) {
            self.events.push(Event::Read(block_number));
            self.memory.mem_read(block_number, buf)
        }
        fn mem_write(&mut self, block_number: usize, buf: &[u8]) {
            self.events.push(Event::Write(block_number, buf.to_vec()));
            self.memory.mem_write(block_number, buf)
        }
    }

    #[cfg(feature = "stat")]
    impl AddStats for Recorder {
        fn add_stats(&self, buf: &mut Stats) {
            self.memory.add_stats(buf)
        }
    }

    /// picks the scripted ways in order, then way 0 forever.
    ///
    /// `gen_range(0..n)` keeps the high bits of a 64-bit draw, so way `w`
    /// out of `2^width` is produced by `w << (64 - width)`.
    struct ScriptedWays {
        ways: std::collections::VecDeque<usize>,
        width: u32,
    }

    impl ScriptedWays {
        fn new(width: u32, ways: &[usize]) -> Self {
            Self {
                ways: ways.iter().copied().collect(),
                width,
            }
        }
        fn first_way() -> Self {
            Self::new(1, &[])
        }
    }

    impl RngCore for ScriptedWays {
        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }
        fn next_u64(&mut self) -> u64 {
            match self.ways.pop_front() {
                Some(w) if self.width > 0 => (w as u64) << (64 - self.width),
                _ => 0,
            }
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0)
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    // 1KiB, 16-byte blocks, 2-way, 32 sets
    fn scenario_geometry() -> Geometry {
        Geometry::with_block_width(10, 1, 4).unwrap()
    }

    fn scenario_cache(seed: u64) -> Cache<Recorder> {
        Cache::with_seed(scenario_geometry(), Recorder::new(4), seed)
    }

    fn assert_tags_unique<S: BackingStore, R: RngCore>(cache: &Cache<S, R>) {
        for set in 0..cache.geometry().sets() {
            let mut seen = HashSet::new();
            for slot in cache.set_slots(set).iter().filter(|s| s.is_valid()) {
                assert!(seen.insert(slot.tag()), "duplicated tag in set {set}");
            }
        }
    }

    #[test]
    fn test_init() {
        let cache = Cache::init(14, 2, Memory::new(16, 6).unwrap()).unwrap();
        assert_eq!(256, cache.slots.len());
        assert!(cache.slots.iter().all(|s| !s.is_valid() && !s.is_dirty()));
        assert!(Cache::init(7, 2, Memory::new(16, 6).unwrap()).is_err());
    }
    #[test]
    fn test_memory_with_other_block_width() {
        // 64-byte cache blocks over a memory configured for 16-byte blocks
        let mut cache = Cache::init(10, 1, Memory::new(16, 4).unwrap()).unwrap();
        assert_eq!(0, cache.read(0));
        cache.write(0x1004, 0xCAFEBABE, !0);
        cache.write(0x2004, 0x12345678, !0);
        cache.flush();
        assert_eq!(0xCAFEBABE, cache.read(0x1004));
        assert_eq!(0xCAFEBABE, cache.store().read_word(0x1004));
        assert_eq!(0x12345678, cache.store().read_word(0x2004));
        assert_eq!(0, cache.store().read_word(0x1000));
    }
    #[test]
    fn test_write_then_read() {
        let mut cache = scenario_cache(0);
        cache.write(0x000, 0xDEADBEEF, 0xFFFFFFFF);
        assert_eq!(0xDEADBEEF, cache.read(0x000));
        // the block is cached, memory has not seen the write yet
        assert_eq!(0, cache.store().memory.read_word(0x000));
    }
    #[test]
    fn test_masked_write() {
        let mut cache = scenario_cache(1);
        cache.write(0x124, 0x11223344, !0);
        cache.write(0x124, 0xAABBCCDD, 0x00FF00FF);
        assert_eq!(0x11BB33DD, cache.read(0x124));
        cache.write(0x124, 0, 0);
        assert_eq!(0x11BB33DD, cache.read(0x124));
    }
    #[test]
    fn test_hit_consistency() {
        let mut cache = scenario_cache(2);
        cache.store.memory.write_word(0x3F8, 0x01234567, !0);
        let first = cache.read(0x3F8);
        let second = cache.read(0x3F8);
        assert_eq!(0x01234567, first);
        assert_eq!(first, second);
        assert_eq!(vec![Event::Read(0x3F)], cache.store().events);
    }
    #[test]
    fn test_unaligned_access_is_truncated() {
        let mut cache = scenario_cache(3);
        cache.write(0x42, 0xCAFEBABE, !0);
        assert_eq!(0xCAFEBABE, cache.read(0x40));
        assert_eq!(0xCAFEBABE, cache.read(0x43));
        assert_eq!(0, cache.read(0x44));
    }
    #[test]
    fn test_write_allocate_fetches_old_block() {
        let mut cache = scenario_cache(4);
        cache.store.memory.write_word(0x20, 0xAAAAAAAA, !0);
        cache.store.memory.write_word(0x24, 0xBBBBBBBB, !0);
        cache.write(0x20, 0x000000CC, 0x000000FF);
        assert_eq!(vec![Event::Read(0x2)], cache.store().events);
        assert_eq!(0xAAAAAACC, cache.read(0x20));
        assert_eq!(0xBBBBBBBB, cache.read(0x24));
    }
    #[test]
    fn test_third_tag_evicts_once() {
        let g = scenario_geometry();
        // the first two misses land in distinct ways, the third reuses way 0
        let rng = ScriptedWays::new(1, &[0, 1, 0]);
        let mut cache = Cache::new(g, Recorder::new(4), rng);
        // set 3, tags 0, 1, 2
        let addrs = [0x030, 0x230, 0x430];
        assert!(addrs.iter().all(|a| g.set_index(*a) == 3));
        for (i, addr) in addrs.into_iter().enumerate() {
            cache.write(addr, i as u32 + 1, !0);
        }
        let writes: Vec<_> = cache
            .store()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Write(..)))
            .collect();
        assert_eq!(1, writes.len());
        assert!(matches!(writes[0], Event::Write(0x03, _)));
        #[cfg(feature = "stat")]
        {
            assert_eq!(1, cache.evictions());
            assert_eq!(1, cache.write_backs());
            assert_eq!(3, cache.misses());
        }
        assert_tags_unique(&cache);
        assert_eq!(2, cache.read(0x230));
        assert_eq!(3, cache.read(0x430));
    }
    #[test]
    fn test_replacement_is_uniform() {
        // 1 set of 4 ways: count which way each conflicting miss lands in
        let g = Geometry::with_block_width(6, 2, 4).unwrap();
        let mut cache = Cache::with_seed(g, Memory::new(16, 4).unwrap(), 99);
        let mut counts = [0usize; 4];
        for i in 0..4000usize {
            cache.read(i << 4);
            let way = cache
                .set_slots(0)
                .iter()
                .position(|s| s.holds(i))
                .unwrap();
            counts[way] += 1;
        }
        for c in counts {
            assert!((800..1200).contains(&c), "{counts:?}");
        }
    }
    #[test]
    fn test_dirty_write_back_before_fetch() {
        // way 0 every time: the second block replaces the first
        let rng = ScriptedWays::first_way();
        let mut cache = Cache::new(scenario_geometry(), Recorder::new(4), rng);
        let a = 0x050;
        let b = 0x250;
        cache.write(a, 0x12345678, !0);
        let expected = {
            let mut block = vec![0u8; 16];
            block[..4].copy_from_slice(&0x12345678u32.to_le_bytes());
            block
        };
        assert_eq!(0, cache.read(b));
        assert_eq!(
            vec![
                Event::Read(0x05),
                Event::Write(0x05, expected),
                Event::Read(0x25),
            ],
            cache.store().events
        );
        assert_eq!(0x12345678, cache.store().memory.read_word(a));
        // the evicted block comes back intact
        assert_eq!(0x12345678, cache.read(a));
    }
    #[test]
    fn test_clean_eviction_does_not_write() {
        let rng = ScriptedWays::first_way();
        let mut cache = Cache::new(scenario_geometry(), Recorder::new(4), rng);
        cache.read(0x060);
        cache.read(0x260);
        assert_eq!(
            vec![Event::Read(0x06), Event::Read(0x26)],
            cache.store().events
        );
    }
    #[test]
    fn test_flush() {
        let mut cache = scenario_cache(6);
        // three distinct sets
        cache.write(0x100, 0x1, !0);
        cache.write(0x210, 0x2, !0);
        cache.read(0x320);
        cache.flush();
        let memory = &cache.store().memory;
        assert_eq!(0x1, memory.read_word(0x100));
        assert_eq!(0x2, memory.read_word(0x210));
        assert!(cache.slots.iter().all(|s| !s.is_dirty()));
        let valid = cache.slots.iter().filter(|s| s.is_valid()).count();
        assert_eq!(3, valid);
        // nothing left to write
        let before = cache.store().events.len();
        cache.flush();
        assert_eq!(before, cache.store().events.len());
    }
    #[test]
    fn test_random_workload_invariants() {
        let g = Geometry::with_block_width(8, 1, 4).unwrap();
        let mut cache = Cache::with_seed(g, Recorder::new(4), 42);
        let mut reference = Memory::new(16, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5000 {
            let addr = rng.gen_range(0..0x1000usize) & !0x3;
            if rng.gen_bool(0.5) {
                let data = rng.gen::<u32>();
                let mask = rng.gen::<u32>();
                cache.write(addr, data, mask);
                reference.write_word(addr, data, mask);
            } else {
                assert_eq!(reference.read_word(addr), cache.read(addr), "at {addr:#x}");
            }
            assert!(cache.slots.iter().all(|s| !s.is_dirty() || s.is_valid()));
        }
        assert_tags_unique(&cache);
        cache.flush();
        assert_eq!(
            &reference.as_bytes()[..0x1000],
            &cache.store().memory.as_bytes()[..0x1000]
        );
    }
    #[test]
    fn test_cycles() {
        let rng = ScriptedWays::first_way();
        let mut cache = Cache::new(scenario_geometry(), Recorder::new(4), rng);
        cache.read(0x0);
        assert_eq!(HIT_CYCLES + crate::memory::MEM_LATENCY, cache.cycles());
        cache.read(0x0);
        assert_eq!(2 * HIT_CYCLES + crate::memory::MEM_LATENCY, cache.cycles());
        cache.cycle_increase(10);
        assert_eq!(2 * HIT_CYCLES + crate::memory::MEM_LATENCY + 10, cache.cycles());
    }
    #[cfg(feature = "stat")]
    #[test]
    fn test_statistic() {
        let mut cache = scenario_cache(8);
        cache.read(0x0);
        cache.read(0x4);
        cache.write(0x8, 1, !0);
        assert_eq!(2, cache.hits());
        assert_eq!(1, cache.misses());
        let stats = cache.display_statistic();
        assert_eq!(2, stats.len());
        let out = stats.view(80).to_string();
        assert!(out.contains("read:"), "{out}");
        assert!(out.contains("(50.00%)"), "{out}");
    }
}
