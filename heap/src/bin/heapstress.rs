use clap::Parser as ClapParser;
use std::{process, sync::Arc, thread, time::Instant};

use heap::{CollectionKind, Heap, HeapError, HeapProxy, HeapSettings, RootProvider, TraceLevel};
use object::{EPHEMERON_KEY, EPHEMERON_VALUE, Object, ObjectKind, Value, WEAK_REFERENT};

/// Slots of a graph node: three edges and an id.
const NODE_SLOTS: u16 = 4;
const ID_SLOT: usize = 3;

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Allocate random object graphs on many threads", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 4, help = "Mutator threads")]
    threads: usize,

    #[arg(long, default_value_t = 200_000, help = "Allocations per thread")]
    iterations: usize,

    #[arg(long, default_value_t = 64, help = "Regions in the heap")]
    regions: usize,

    #[arg(long, default_value_t = 20, help = "log2 of the region size")]
    region_size_log2: u32,

    #[arg(long, default_value_t = 8, help = "Regions leased to the nursery")]
    nursery_regions: usize,

    #[arg(long, default_value_t = 256, help = "Live nodes each thread keeps rooted")]
    live: usize,

    /// Request a full collection every N allocations per thread (0 = never)
    #[arg(long, default_value_t = 0)]
    full_every: usize,

    #[arg(long, help = "Log every collection")]
    verbose: bool,
}

struct Roots {
    values: Vec<Value>,
}

impl RootProvider for Roots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.values {
            visitor(value);
        }
    }
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn node(value: Value) -> &'static mut Object {
    // SAFETY: only called on rooted values between safepoints
    unsafe { Object::at(value.addr()) }
}

/// Allocates one random object and wires it into the rooted graph.
fn step(proxy: &mut HeapProxy, roots: &mut Roots, rng: &mut Lcg, id: i64, live: usize) -> Result<(), HeapError> {
    let value = match rng.below(16) {
        0 => proxy.allocate_object(ObjectKind::WeakRef, 1, 0, roots)?,
        1 => proxy.allocate_object(ObjectKind::Ephemeron, 2, 0, roots)?,
        2 => proxy.allocate_object(ObjectKind::ByteArray, 0, 8 * rng.below(64), roots)?,
        _ => {
            let value = proxy.allocate_object(ObjectKind::Slots, NODE_SLOTS, 0, roots)?;
            // SAFETY: freshly allocated node with NODE_SLOTS slots
            unsafe { node(value).set_slot(ID_SLOT, Value::from_i64(id)) };
            value
        }
    };

    if !roots.values.is_empty() {
        let target = roots.values[rng.below(roots.values.len())];
        let kind = node(value).kind();
        // SAFETY: slot indices are within each kind's slot count
        unsafe {
            match kind {
                ObjectKind::WeakRef => proxy.store(value, WEAK_REFERENT, target),
                ObjectKind::Ephemeron => {
                    proxy.store(value, EPHEMERON_KEY, target);
                    proxy.store(value, EPHEMERON_VALUE, Value::from_i64(id));
                }
                ObjectKind::Slots => proxy.store(value, rng.below(ID_SLOT), target),
                ObjectKind::ByteArray => {}
            }
            // link back from an older node so old-to-young edges exist
            let source = roots.values[rng.below(roots.values.len())];
            if node(source).kind() == ObjectKind::Slots {
                proxy.store(source, rng.below(ID_SLOT), value);
            }
        }
    }

    if roots.values.len() < live {
        roots.values.push(value);
    } else {
        let victim = rng.below(live);
        roots.values[victim] = value;
    }
    Ok(())
}

/// Every reachable node must still carry a well-formed id.
fn check(roots: &Roots) -> usize {
    let mut checked = 0;
    for &value in &roots.values {
        let object = node(value);
        if object.kind() == ObjectKind::Slots {
            // SAFETY: nodes always carry an id slot
            let id = unsafe { object.slot(ID_SLOT) };
            assert!(id.is_fixnum(), "node 0x{:x} lost its id", value.addr());
            checked += 1;
        }
    }
    checked
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let settings = HeapSettings {
        region_size_log2: cli.region_size_log2,
        region_count: cli.regions,
        nursery_regions: cli.nursery_regions,
        trace_level: if cli.verbose {
            TraceLevel::Phases
        } else {
            TraceLevel::Quiet
        },
        ..HeapSettings::default()
    };
    let heap = match Heap::new(settings) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {err}");
            process::exit(1);
        }
    };

    let started = Instant::now();
    let cli = Arc::new(cli);
    let handles: Vec<_> = (0..cli.threads)
        .map(|t| {
            let heap = heap.clone();
            let cli = cli.clone();
            thread::spawn(move || {
                let mut proxy = heap.proxy();
                let mut roots = Roots { values: Vec::with_capacity(cli.live) };
                let mut rng = Lcg(t as u64 + 1);
                for i in 0..cli.iterations {
                    let id = (t * cli.iterations + i) as i64;
                    step(&mut proxy, &mut roots, &mut rng, id, cli.live)?;
                    if cli.full_every > 0 && i % cli.full_every == cli.full_every - 1 {
                        proxy.collect(CollectionKind::Full, &mut roots);
                    }
                }
                let checked = check(&roots);
                Ok::<_, HeapError>((proxy.allocated(), checked))
            })
        })
        .collect();

    let mut allocated = 0;
    let mut checked = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok((bytes, nodes))) => {
                allocated += bytes;
                checked += nodes;
            }
            Ok(Err(err)) => {
                eprintln!("Mutator failed: {err}");
                process::exit(1);
            }
            Err(_) => {
                eprintln!("Mutator panicked");
                process::exit(1);
            }
        }
    }

    let elapsed = started.elapsed();
    let stats = heap.stats();
    println!(
        "{} threads allocated {} MB in {:.3}s, {} live nodes checked",
        cli.threads,
        allocated / (1024 * 1024),
        elapsed.as_secs_f64(),
        checked
    );
    println!(
        "{} minor / {} full collections, {} MB promoted, {} weak cleared",
        stats.minor_collections,
        stats.full_collections,
        stats.promoted_bytes / (1024 * 1024),
        stats.weak_cleared
    );
    println!(
        "pauses: total {:.3}ms, max {:.3}ms",
        stats.total_pause.as_secs_f64() * 1000.0,
        stats.max_pause.as_secs_f64() * 1000.0
    );
    if let Some(last) = &stats.last {
        println!("last: {last}");
    }
}
