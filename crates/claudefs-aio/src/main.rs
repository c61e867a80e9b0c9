#![warn(missing_docs)]
//! ClaudeFS disk probe: measures AIO IOPS on a file or device

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use claudefs_aio::{AioConfig, AsyncFile, IoOp, SlowDiskConfig, SlowDiskPolicy};
use rand::Rng;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "Usage: cfs-aio-probe <path> [--op read|write] [--random] \
[--depth N] [--block-size BYTES] [--count N] [--size BYTES] [--iops-threshold N] [--buffered] \
[--policy 0|1|2]";

struct ProbeArgs {
    path: PathBuf,
    op: IoOp,
    random: bool,
    depth: u32,
    block_size: usize,
    count: u64,
    size: u64,
    iops_threshold: Option<f64>,
    direct_io: bool,
    policy: SlowDiskPolicy,
}

fn parse_args(args: &[String]) -> anyhow::Result<ProbeArgs> {
    let Some(path) = args.get(1) else {
        bail!("{}", USAGE);
    };
    let mut probe = ProbeArgs {
        path: PathBuf::from(path),
        op: IoOp::Read,
        random: false,
        depth: 32,
        block_size: 4096,
        count: 10_000,
        size: 1 << 30,
        iops_threshold: None,
        direct_io: true,
        policy: SlowDiskConfig::default().policy,
    };

    let mut iter = args[2..].iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--random" => probe.random = true,
            "--buffered" => probe.direct_io = false,
            "--op" => {
                probe.op = match iter.next().map(String::as_str) {
                    Some("read") => IoOp::Read,
                    Some("write") => IoOp::Write,
                    other => bail!("--op expects read or write, got {:?}", other),
                }
            }
            "--depth" => probe.depth = value(&mut iter, flag)?,
            "--block-size" => probe.block_size = value(&mut iter, flag)?,
            "--count" => probe.count = value(&mut iter, flag)?,
            "--size" => probe.size = value(&mut iter, flag)?,
            "--iops-threshold" => probe.iops_threshold = Some(value(&mut iter, flag)?),
            "--policy" => probe.policy = SlowDiskPolicy::from_code(value(&mut iter, flag)?)?,
            other => bail!("unknown flag {}\n{}", other, USAGE),
        }
    }

    if probe.depth == 0 {
        bail!("--depth must be at least 1");
    }
    if probe.block_size == 0 || probe.size < probe.block_size as u64 {
        bail!("--size must hold at least one block of {} bytes", probe.block_size);
    }
    Ok(probe)
}

/// First op index and op count for `task` when `count` ops are split over
/// `tasks`; the remainder goes to the lowest-numbered tasks.
fn task_share(count: u64, tasks: u64, task: u64) -> (u64, u64) {
    let (base, extra) = (count / tasks, count % tasks);
    (task * base + task.min(extra), base + u64::from(task < extra))
}

fn value<'a, T>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = iter
        .next()
        .with_context(|| format!("{} expects a value", flag))?;
    raw.parse()
        .with_context(|| format!("invalid value {:?} for {}", raw, flag))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let probe = match parse_args(&args) {
        Ok(probe) => probe,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    claudefs_aio::clock::init();
    tracing::info!(
        "probing {}: op={} random={} depth={} block_size={} count={} policy={:?}",
        probe.path.display(),
        probe.op.as_str(),
        probe.random,
        probe.depth,
        probe.block_size,
        probe.count,
        probe.policy
    );

    let config = AioConfig {
        io_depth: probe.depth,
        direct_io: probe.direct_io,
        ..AioConfig::default()
    };
    let file = AsyncFile::open(&probe.path, config)
        .await
        .with_context(|| format!("opening {}", probe.path.display()))?;
    file.context()
        .enable_disk_check(
            SlowDiskConfig {
                policy: probe.policy,
                ..SlowDiskConfig::default()
            },
            |report| {
                tracing::warn!("slow disk: {}", serde_json::json!(report));
            },
        )?;

    let blocks = probe.size / probe.block_size as u64;
    let started = Instant::now();
    let mut tasks = tokio::task::JoinSet::new();

    for task in 0..probe.depth as u64 {
        let (first, ops) = task_share(probe.count, probe.depth as u64, task);
        if ops == 0 {
            break;
        }
        let file = file.clone();
        let (op, random, block_size) = (probe.op, probe.random, probe.block_size);
        tasks.spawn(async move {
            let mut done = 0u64;
            for i in 0..ops {
                let block = if random {
                    rand::thread_rng().gen_range(0..blocks)
                } else {
                    (first + i) % blocks
                };
                let offset = block * block_size as u64;
                match op {
                    IoOp::Read => {
                        file.read_at(offset, block_size).await?;
                    }
                    IoOp::Write => {
                        file.write_at(&vec![0xA5; block_size], offset).await?;
                    }
                }
                done += 1;
            }
            Ok::<u64, claudefs_aio::AioError>(done)
        });
    }

    let mut completed = 0u64;
    while let Some(joined) = tasks.join_next().await {
        completed += joined.context("probe task panicked")??;
    }
    let elapsed = started.elapsed();
    file.close().await?;

    let iops = completed as f64 / elapsed.as_secs_f64();
    println!(
        "{} {} ops in {:.3}s: {:.0} IOPS, {:.1} MiB/s",
        completed,
        probe.op.as_str(),
        elapsed.as_secs_f64(),
        iops,
        iops * probe.block_size as f64 / (1024.0 * 1024.0)
    );
    println!("{}", serde_json::to_string_pretty(&file.context().stats())?);

    if let Some(threshold) = probe.iops_threshold {
        if iops < threshold {
            tracing::warn!("IOPS {:.0} below threshold {:.0}", iops, threshold);
            println!("SLOW: {:.0} < {:.0} IOPS", iops, threshold);
            std::process::exit(2);
        }
        println!("OK: {:.0} >= {:.0} IOPS", iops, threshold);
    }

    Ok(())
}
