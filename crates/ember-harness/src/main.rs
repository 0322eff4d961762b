#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use ember::{Database, Fram, ObjectId};
use ember_harness::crash::{run_crash_replay, CrashReplayConfig};
use ember_harness::demo::run_demo;
use ember_harness::{load_image, save_image};
use serde::Serialize;
use std::env;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("demo") => demo(&args[1..]),
        Some("crash-replay") => crash_replay(&args[1..]),
        Some("image-info") => image_info(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => bail!("unknown command: {other}"),
    }
}

fn print_usage() {
    println!("ember-harness — drive the Ember runtime on the host");
    println!();
    println!("commands:");
    println!("  demo [iterations] [--save <path>]   run the producer/consumer demo");
    println!("  crash-replay [segments] [commits]   scripted power-loss replay");
    println!("  image-info <path>                   inspect a saved image file");
}

fn demo(args: &[String]) -> Result<()> {
    let mut iterations = 8_u32;
    let mut save_path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--save" {
            save_path = Some(
                iter.next()
                    .context("--save requires a path")?
                    .clone(),
            );
        } else {
            iterations = arg.parse().context("iterations must be an integer")?;
        }
    }

    let (runtime, report) = run_demo(iterations)?;
    if let Some(path) = save_path {
        save_image(&path, &runtime.db().geometry(), &runtime.db().snapshot())?;
        println!("image saved to {path}");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn crash_replay(args: &[String]) -> Result<()> {
    let mut config = CrashReplayConfig::default();
    if let Some(segments) = args.first() {
        config.segments = segments.parse().context("segments must be an integer")?;
    }
    if let Some(commits) = args.get(1) {
        config.commits_per_segment = commits.parse().context("commits must be an integer")?;
    }

    let report = run_crash_replay(config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.verification_failures > 0 {
        bail!("{} objects failed durability verification", report.verification_failures);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ImageInfo {
    provisioned: bool,
    fail_count: u32,
    logical_time: u32,
    objects: Vec<ObjectInfo>,
}

#[derive(Debug, Serialize)]
struct ObjectInfo {
    id: u16,
    size: usize,
}

fn image_info(args: &[String]) -> Result<()> {
    let path = args.first().context("image-info requires a path")?;
    let (geometry, bytes) = load_image(path)?;
    let db = Database::open(geometry, Fram::from_bytes(bytes))?;

    let header = db.header()?;
    let mut objects = Vec::new();
    for id in 0..geometry.objects {
        #[allow(clippy::cast_possible_truncation)] // objects validated <= u16::MAX
        let id = ObjectId(id as u16);
        if let Ok(bytes) = db.peek_object(id) {
            objects.push(ObjectInfo {
                id: id.0,
                size: bytes.len(),
            });
        }
    }

    let info = ImageInfo {
        provisioned: header.provisioned,
        fail_count: header.fail_count,
        logical_time: db.now()?.0,
        objects,
    };
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
