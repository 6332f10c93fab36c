//! fusiond - event fusion daemon
//!
//! This daemon:
//! 1. Loads `FusionConfig` (FUSION_CONFIG file + environment overrides)
//! 2. Builds one `FusionContext` and starts the event dispatcher
//! 3. Feeds a synthetic two-camera frame source through the synchronizer
//! 4. Feeds synthetic random-walk detections through tracker and detector
//! 5. Logs every distributed event through a subscriber, plus periodic statistics
//!
//! The synthetic source stands in for real acquisition and detection, which live
//! outside this crate.

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::mpsc;
use std::time::Duration;

use event_fusion::config::FusionConfig;
use event_fusion::{
    EventFilter, FallSignals, FusionContext, Observation, Subscription, Timestamp, ZoneSpec,
    ZoneType,
};

const CAMERA_ID: &str = "cam1";
const STATS_EVERY_TICKS: u64 = 50;
const FRAME_JITTER_MS: i64 = 60;

#[derive(Parser, Debug)]
#[command(name = "fusiond", about = "Multi-sensor event fusion daemon")]
struct Args {
    /// Number of ticks to run (0 = until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Number of synthetic objects to simulate
    #[arg(long, default_value_t = 3)]
    objects: usize,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Milliseconds between ticks
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Subscriber event filter (comma-separated event types)
    #[arg(long, env = "FUSION_SUBSCRIBE", default_value = "")]
    filter: String,
}

struct Walker {
    object_id: String,
    position: [f64; 3],
    paused_ticks: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = FusionConfig::load()?;
    if cfg.zones.is_empty() {
        cfg.zones.push(
            ZoneSpec::new(
                "loading_dock",
                CAMERA_ID,
                vec![[0.0, 0.0], [5.0, 0.0], [5.0, 5.0], [0.0, 5.0]],
            )
            .with_type(ZoneType::Hazard)
            .with_priority(8),
        );
    }

    let ctx = FusionContext::new(cfg)?;
    ctx.start_dispatcher()?;

    let subscription = ctx.distributor().subscribe(EventFilter::parse(&args.filter)?);
    let subscription_id = subscription.id();
    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || print_events(subscription))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut walkers: Vec<Walker> = (0..args.objects)
        .map(|i| Walker {
            object_id: format!("person_{}", i + 1),
            position: [rng.gen_range(-3.0..8.0), rng.gen_range(-3.0..8.0), 0.0],
            paused_ticks: 0,
        })
        .collect();

    log::info!(
        "fusiond running: objects={} tick={}ms ticks={}",
        args.objects,
        args.tick_ms,
        if args.ticks == 0 { "unbounded".to_string() } else { args.ticks.to_string() }
    );

    let mut tick = 0u64;
    loop {
        if rx.try_recv().is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        if args.ticks > 0 && tick >= args.ticks {
            break;
        }
        tick += 1;
        let now = Timestamp::now();

        feed_frames(&ctx, &mut rng, now, tick);
        for walker in walkers.iter_mut() {
            step_walker(&ctx, &mut rng, walker, now)?;
        }

        if tick % STATS_EVERY_TICKS == 0 {
            let swept = ctx.sweep_stale_tracks();
            let stats = ctx.stats();
            log::info!(
                "tick {}: pairs={} sync_rate={:.2} tracks={} events={} sent={} dropped={} swept={}",
                tick,
                stats.sync.synchronized_pairs,
                stats.sync.sync_rate,
                stats.tracker.total_tracks,
                stats.detector.events_registered,
                stats.distributor.total_sent,
                stats.distributor.dropped,
                swept
            );
        }

        std::thread::sleep(Duration::from_millis(args.tick_ms));
    }

    ctx.stop_dispatcher()?;
    ctx.distributor().dispatch_pending();
    ctx.distributor().unsubscribe(subscription_id);
    if printer.join().is_err() {
        log::warn!("event printer thread panicked");
    }

    let stats = ctx.stats();
    log::info!(
        "final stats: {}",
        serde_json::to_string(&stats).unwrap_or_else(|e| format!("<unserializable: {}>", e))
    );
    Ok(())
}

/// One primary frame and one jittered secondary frame per tick.
fn feed_frames(ctx: &FusionContext, rng: &mut StdRng, now: Timestamp, tick: u64) {
    let sync = ctx.synchronizer();
    sync.add_primary(format!("rgb:{}", tick).into_bytes(), now);
    // Occasionally skip the secondary frame to exercise the no-match path.
    if rng.gen_bool(0.9) {
        let jitter = rng.gen_range(-FRAME_JITTER_MS..=FRAME_JITTER_MS);
        let depth = vec![0u8; 16];
        sync.add_secondary(
            format!("depth:{}", tick).into_bytes(),
            Some(depth),
            now.add_millis(jitter),
        );
    }
    for pair in sync.drain_pairs() {
        log::debug!(
            "pair primary#{} secondary#{} diff={}ms quality={:?}",
            pair.primary.sequence_number,
            pair.secondary.sequence_number,
            pair.time_diff_ms,
            pair.quality
        );
    }
}

fn step_walker(ctx: &FusionContext, rng: &mut StdRng, walker: &mut Walker, now: Timestamp) -> Result<()> {
    if walker.paused_ticks > 0 {
        walker.paused_ticks -= 1;
    } else if rng.gen_bool(0.02) {
        walker.paused_ticks = rng.gen_range(50..150);
    } else {
        walker.position[0] += rng.gen_range(-0.3..0.3);
        walker.position[1] += rng.gen_range(-0.3..0.3);
    }

    let obs = Observation::new(&walker.object_id, "person", CAMERA_ID, walker.position, now)
        .with_confidence(rng.gen_range(0.7..1.0));
    ctx.ingest(&obs)?;

    if rng.gen_bool(0.002) {
        let signals = FallSignals {
            body_angle_deg: Some(rng.gen_range(5.0..90.0)),
            depth_drop_m: Some(rng.gen_range(0.0..1.0)),
        };
        ctx.report_fall(&obs, &signals)?;
    }
    Ok(())
}

fn print_events(subscription: Subscription) {
    log::info!(
        "event subscriber {} attached (filter: {})",
        subscription.id(),
        subscription.filter()
    );
    loop {
        match subscription.recv_timeout(Duration::from_millis(200)) {
            Some(message) => log::info!("event: {}", message),
            None if subscription.is_closed() => break,
            None => {}
        }
    }
    for message in subscription.drain() {
        log::info!("event: {}", message);
    }
}
