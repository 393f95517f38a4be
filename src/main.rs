use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use terrain_streaming::budget::{CacheThreshold, ExecutionContext};
use terrain_streaming::masks::{BakeRegistry, MaskKey};
use terrain_streaming::sim::{self, FlightPath, SyntheticContent};
use terrain_streaming::{
    Channel, LoadState, ProximityRanges, Result, StreamingConfig, TerrainLoader, TerrainSet, TickReport, TileId,
};

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "terrain_streaming")]
#[command(about = "Fly a camera over a synthetic tile grid and report streaming activity")]
struct Args {
    /// Streaming config file (JSON); overrides the preset
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Config preset: default, open_world or editor
    #[arg(long, default_value = "default")]
    preset: String,

    /// Grid half size in tiles (the grid is 2r x 2r)
    #[arg(short = 'r', long, default_value = "8")]
    grid_radius: i32,

    /// Random seed (uses random seed if not specified)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of flight path waypoints
    #[arg(long, default_value = "6")]
    waypoints: usize,

    /// Camera speed in world units per millisecond
    #[arg(long, default_value = "0.5")]
    speed: f64,

    /// Simulated frame time in milliseconds
    #[arg(long, default_value = "16")]
    tick_ms: u64,

    /// Stop after this much simulated time (default: end of the flight path)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Polls before a synthetic load completes
    #[arg(long, default_value = "3")]
    latency_polls: u32,

    /// Regular proximity range override
    #[arg(long)]
    regular_range: Option<f64>,

    /// Impostor proximity range override
    #[arg(long)]
    impostor_range: Option<f64>,

    /// Cache threshold: low, medium, high, ultra or a size in MiB
    #[arg(long)]
    threshold: Option<String>,

    /// Keep-alive window for cached tiles in milliseconds
    #[arg(long)]
    keep_alive_ms: Option<u64>,

    /// Run as an editor session instead of play mode
    #[arg(long)]
    editor: bool,

    /// Stream collider channels only
    #[arg(long)]
    collider_only: bool,

    /// Bake masks for tiles around the camera
    #[arg(long)]
    bake_masks: bool,

    /// Directory for baked masks; masks are flushed here at the end
    #[arg(long)]
    mask_dir: Option<PathBuf>,

    /// Write the tile manifest here at the end
    #[arg(long)]
    manifest_dir: Option<PathBuf>,

    /// Print a tick report every N ticks
    #[arg(long, default_value = "120")]
    report_every: u64,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Could not install log subscriber: {}", e);
    }

    if let Err(e) = run(&args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<StreamingConfig> {
    let mut config = match &args.config {
        Some(path) => StreamingConfig::load(path)?,
        None => StreamingConfig::from_preset(&args.preset).unwrap_or_else(|| {
            eprintln!("Unknown preset '{}', using default", args.preset);
            StreamingConfig::default()
        }),
    };

    if let Some(regular) = args.regular_range {
        config.ranges.regular = regular;
    }
    if let Some(impostor) = args.impostor_range {
        config.ranges.impostor = impostor;
    }
    if let Some(threshold) = &args.threshold {
        match CacheThreshold::parse(threshold) {
            Some(t) => config.budget.threshold = t,
            None => eprintln!("Invalid threshold '{}', keeping {:?}", threshold, config.budget.threshold),
        }
    }
    if let Some(ms) = args.keep_alive_ms {
        config.budget.keep_alive_ms = ms;
    }
    if args.editor {
        config.context = ExecutionContext::editor();
    }
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let seed = args.seed.unwrap_or_else(|| rand::random());
    let config = build_config(args)?;

    println!("Streaming simulation with seed: {}", seed);
    println!(
        "Ranges: regular {:.0} / impostor {:.0} | Cache: {:.0}MB, keep-alive {} ms",
        config.ranges.regular,
        config.ranges.impostor,
        config.budget.threshold.bytes() as f64 / MIB as f64,
        config.budget.keep_alive_ms
    );

    let mut loader = TerrainLoader::new(config);
    if let Some(dir) = &args.mask_dir {
        loader = loader.with_mask_storage(dir);
    }
    let tiles = sim::populate_grid(&mut loader, args.grid_radius, TerrainSet::World)?;
    loader.set_world_map(Some(TileId::new(0, 0)));
    if args.collider_only {
        loader.set_collider_only(true)?;
    }
    println!("Registered {} tiles", tiles);

    let extent = args.grid_radius as f64 * loader.config().tile_size;
    let flight = FlightPath::generate(seed, args.waypoints, extent * 0.8, 100.0, args.speed);
    let duration = args.duration_ms.unwrap_or_else(|| flight.duration_ms());
    println!(
        "Flight: {} waypoints, {:.0} units, {} ms simulated",
        flight.waypoints().len(),
        flight.length(),
        duration
    );

    let mut content = SyntheticContent::default();
    content.latency_polls = args.latency_polls;
    let bakers = sim::demo_bakers(seed);
    let mut totals = TickReport::default();
    let mut failures = 0usize;
    let mut over_budget_ticks = 0usize;

    let tick_ms = args.tick_ms.max(1);
    let mut now = 0u64;
    let mut tick = 0u64;
    while now <= duration {
        let origin = flight.position(now);
        loader.set_origin(Some(origin));
        let report = loader.tick(now, &mut content);

        accumulate(&mut totals, &report);
        failures += report.failures.len();
        if report.over_budget.is_some() {
            over_budget_ticks += 1;
        }

        if args.bake_masks && tick % 10 == 0 {
            bake_around(&mut loader, &bakers, origin);
        }
        if args.report_every > 0 && tick % args.report_every == 0 {
            println!(
                "[{:>7} ms] {} | cache {:.1}MB",
                now,
                report.summary(),
                loader.budget().total_bytes() as f64 / MIB as f64
            );
        }

        now += tick_ms;
        tick += 1;
    }

    println!("\n=== Streaming Summary ===");
    println!("Ticks:            {}", tick);
    println!("Loads started:    {}", totals.started);
    println!("Loads completed:  {}", totals.completed);
    println!("Cache hits:       {}", totals.cache_hits);
    println!("Cached:           {}", totals.cached);
    println!("Unloaded:         {}", totals.unloaded);
    println!("Evicted:          {} ({} over the whole run)", totals.evicted, loader.budget().evictions());
    println!("Failures:         {}", failures);
    println!("Over budget:      {} ticks", over_budget_ticks);
    println!("Resident content: {:.1}MB ({} channels)", content.resident_bytes() as f64 / MIB as f64, content.resident_count());

    if args.bake_masks {
        println!("Masks:            {}", loader.masks().stats().summary());
    }
    if args.mask_dir.is_some() {
        let written = loader.masks_mut().flush_to_disk()?;
        let on_disk = match loader.masks().storage() {
            Some(storage) => storage.total_size()?,
            None => 0,
        };
        println!("Flushed {} masks ({:.1}KB on disk)", written, on_disk as f64 / 1024.0);
    }
    if let Some(dir) = &args.manifest_dir {
        loader.save_manifest(dir)?;
        println!("Saved manifest to {}", dir.display());
    }

    let released = loader.unload_all(&mut content);
    info!("Released {} channels on shutdown", released);
    Ok(())
}

fn accumulate(totals: &mut TickReport, report: &TickReport) {
    totals.reference_changes += report.reference_changes;
    totals.started += report.started;
    totals.completed += report.completed;
    totals.cache_hits += report.cache_hits;
    totals.cached += report.cached;
    totals.unloaded += report.unloaded;
    totals.evicted += report.evicted;
}

/// Bake one mask of each kind for every loaded tile within the regular range.
fn bake_around(loader: &mut TerrainLoader, bakers: &BakeRegistry, origin: [f64; 3]) {
    let ProximityRanges { regular, .. } = loader.ranges();
    let channel = if loader.collider_only() {
        Channel::Collider
    } else {
        Channel::Regular
    };
    let near: Vec<TileId> = loader
        .registry()
        .iter()
        .filter(|t| t.channel(channel).load == LoadState::Loaded)
        .filter(|t| t.bounds.intersects_sphere(origin, regular))
        .map(|t| t.id)
        .collect();

    for id in near {
        let keys = [
            MaskKey::radius(id, "tree-rule-01", 2.5),
            MaskKey::layers(id, 0b0101, 64),
            MaskKey::biome(id, "temperate-forest", 64),
        ];
        for key in &keys {
            loader.bake_mask(key, bakers);
        }
    }
}
