//! Profiling tool for tick phases and mask baking

use std::time::{Duration, Instant};

use terrain_streaming::masks::MaskKey;
use terrain_streaming::sim::{self, FlightPath, SyntheticContent};
use terrain_streaming::{StreamingConfig, TerrainLoader, TerrainSet, TileId};

fn main() {
    let radius = 32;
    let seed = 1337u64;
    let ticks = 2_000u64;
    let tick_ms = 16u64;

    println!("=== Streaming Profiling ===");

    let start = Instant::now();
    let mut loader = TerrainLoader::new(StreamingConfig::open_world());
    let tiles = match sim::populate_grid(&mut loader, radius, TerrainSet::World) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Could not build grid: {}", e);
            return;
        }
    };
    loader.set_world_map(Some(TileId::new(0, 0)));
    let setup_time = start.elapsed();
    println!("Grid: {} tiles in {:?}", tiles, setup_time);

    let extent = radius as f64 * loader.config().tile_size;
    let flight = FlightPath::generate(seed, 12, extent * 0.9, 100.0, 2.0);
    let mut content = SyntheticContent::default();

    // Profile ticks while flying
    let mut tick_time = Duration::ZERO;
    let mut slowest = Duration::ZERO;
    let mut started = 0;
    let mut evicted = 0;
    for i in 0..ticks {
        let now = i * tick_ms;
        loader.set_origin(Some(flight.position(now)));
        let start = Instant::now();
        let report = loader.tick(now, &mut content);
        let elapsed = start.elapsed();
        tick_time += elapsed;
        slowest = slowest.max(elapsed);
        started += report.started;
        evicted += report.evicted;
    }
    println!("Ticks: {} in {:?} (avg {:?}, worst {:?})", ticks, tick_time, tick_time / ticks as u32, slowest);
    println!("  Loads started: {}", started);
    println!("  Evicted: {}", evicted);
    println!("  Cached: {:.1}MB", loader.budget().total_bytes() as f64 / (1024.0 * 1024.0));
    println!(
        "  Left: {} queued, {} in flight",
        loader.state_machine().queued_len(),
        loader.state_machine().in_flight_len()
    );

    // Profile cold mask bakes for every resident tile
    let bakers = sim::demo_bakers(seed);
    let resident: Vec<TileId> = loader
        .registry()
        .iter()
        .filter(|t| t.channels.iter().any(|c| c.load.is_resident()))
        .map(|t| t.id)
        .collect();
    let keys: Vec<MaskKey> = resident
        .iter()
        .flat_map(|&id| {
            [
                MaskKey::radius(id, "profile-rule", 3.0),
                MaskKey::layers(id, 0b1111, 128),
                MaskKey::biome(id, "boreal", 128),
            ]
        })
        .collect();

    let start = Instant::now();
    for key in &keys {
        loader.bake_mask(key, &bakers);
    }
    let cold_time = start.elapsed();
    println!("\nCold bakes: {} keys in {:?}", keys.len(), cold_time);

    // Same keys again, all hits
    let start = Instant::now();
    for key in &keys {
        loader.bake_mask(key, &bakers);
    }
    let warm_time = start.elapsed();
    println!("Warm lookups: {} keys in {:?}", keys.len(), warm_time);

    let start = Instant::now();
    let invalidated = loader.layer_changed(2);
    let invalidate_time = start.elapsed();
    println!("Invalidate layer bit 2: {} masks in {:?}", invalidated, invalidate_time);
    println!("{}", loader.masks().stats().summary());

    // Summary
    let total = setup_time + tick_time + cold_time + warm_time + invalidate_time;
    println!("\n=== Summary ===");
    println!("Grid setup:   {:>8.2}% ({:?})", 100.0 * setup_time.as_secs_f64() / total.as_secs_f64(), setup_time);
    println!("Ticks:        {:>8.2}% ({:?})", 100.0 * tick_time.as_secs_f64() / total.as_secs_f64(), tick_time);
    println!("Cold bakes:   {:>8.2}% ({:?})", 100.0 * cold_time.as_secs_f64() / total.as_secs_f64(), cold_time);
    println!("Warm lookups: {:>8.2}% ({:?})", 100.0 * warm_time.as_secs_f64() / total.as_secs_f64(), warm_time);
    println!("Invalidate:   {:>8.2}% ({:?})", 100.0 * invalidate_time.as_secs_f64() / total.as_secs_f64(), invalidate_time);
    println!("─────────────────────────────────");
    println!("TOTAL:            {:>8}  {:?}", "100%", total);

    loader.unload_all(&mut content);
}
