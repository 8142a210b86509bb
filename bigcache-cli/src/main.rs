//! bigcache — command-line front end for building, inspecting, and
//! exercising BigCache bundles.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

use bigcache_core::loader::Loader;
use bigcache_core::packer::{self, Packer};
use bigcache_core::warmup;

#[derive(Parser)]
#[command(
    name = "bigcache",
    version = env!("CARGO_PKG_VERSION"),
    about = "BigCache — cold-start page bundle builder and inspector"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit machine-readable JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a bundle from an access-trace CSV
    Pack {
        /// CSV trace: bigcache_offset,source_path,source_offset,size,first_access_order
        csv: PathBuf,
        /// Output bundle path
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Validate a bundle's layout and CRC32
    Verify {
        bin: PathBuf,
    },
    /// Print a bundle's header and file table
    Info {
        bin: PathBuf,
    },
    /// Touch every page of a bundle and report timing/throughput
    Benchmark {
        bin: PathBuf,
        #[arg(long, default_value_t = 1)]
        iterations: u32,
    },
    /// Replay a trace CSV against an already-built bundle, reporting hits/misses
    Simulate {
        bin: PathBuf,
        csv: PathBuf,
    },
}

fn main() {
    let verbosity = std::env::var("BIGCACHE_VERBOSE")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(1);
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("bigcache: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> bigcache_core::Result<()> {
    match cli.command {
        Commands::Pack { csv, out } => cmd_pack(&csv, out, cli.json),
        Commands::Verify { bin } => cmd_verify(&bin, cli.json),
        Commands::Info { bin } => cmd_info(&bin, cli.json),
        Commands::Benchmark { bin, iterations } => cmd_benchmark(&bin, iterations, cli.json),
        Commands::Simulate { bin, csv } => cmd_simulate(&bin, &csv, cli.json),
    }
}

fn cmd_pack(csv: &PathBuf, out: Option<PathBuf>, json: bool) -> bigcache_core::Result<()> {
    let out = out.unwrap_or_else(packer::default_output_path);
    let mut p = Packer::new();
    let added = p.load_from_csv(csv)?;
    let report = p.build(&out)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "rows_added": added,
                "num_pages": report.num_pages,
                "num_files": report.num_files,
                "synthetic_pages": report.synthetic_pages,
                "total_size": report.total_size,
                "output": out,
            }))
            .unwrap()
        );
    } else {
        println!("[pack] {} rows added from {}", added, csv.display());
        println!(
            "[pack] {} pages, {} files, {} synthetic, {} bytes -> {}",
            report.num_pages,
            report.num_files,
            report.synthetic_pages,
            report.total_size,
            out.display()
        );
    }
    Ok(())
}

fn cmd_verify(bin: &PathBuf, json: bool) -> bigcache_core::Result<()> {
    let loader = Loader::load(bin)?;
    let result = loader.verify();
    let ok = result.is_ok();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": ok,
                "error": result.as_ref().err().map(|e| e.to_string()),
            }))
            .unwrap()
        );
    } else if ok {
        println!("[verify] {} is valid", bin.display());
    } else {
        println!("[verify] {} FAILED: {}", bin.display(), result.as_ref().unwrap_err());
    }
    result
}

fn cmd_info(bin: &PathBuf, json: bool) -> bigcache_core::Result<()> {
    let loader = Loader::load(bin)?;
    let header = loader.header();
    if json {
        let files: Vec<_> = loader
            .files()
            .iter()
            .map(|f| json!({"file_id": f.file_id, "path": f.path, "total_pages": f.total_pages, "original_size": f.original_size}))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "num_pages": header.num_pages,
                "num_files": header.num_files,
                "total_size": header.total_size,
                "checksum": format!("{:#010x}", header.checksum),
                "files": files,
            }))
            .unwrap()
        );
    } else {
        println!("[info] {}", bin.display());
        println!("  pages:      {}", header.num_pages);
        println!("  files:      {}", header.num_files);
        println!("  total_size: {}", header.total_size);
        println!("  checksum:   {:#010x}", header.checksum);
        for f in loader.files() {
            println!("  - [{}] {} ({} pages)", f.file_id, f.path, f.total_pages);
        }
    }
    Ok(())
}

fn cmd_benchmark(bin: &PathBuf, iterations: u32, json: bool) -> bigcache_core::Result<()> {
    let loader = Loader::load(bin)?;
    let mut reports = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations.max(1) {
        reports.push(warmup::warm_blob(&loader));
    }
    let total_touched: u64 = reports.iter().map(|r| r.pages_touched).sum();
    let total_ms: f64 = reports.iter().map(|r| r.elapsed_ms).sum();
    let avg_throughput = reports.iter().map(|r| r.throughput_mb_per_sec()).sum::<f64>() / reports.len() as f64;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "iterations": reports.len(),
                "total_pages_touched": total_touched,
                "total_elapsed_ms": total_ms,
                "avg_throughput_mb_per_sec": avg_throughput,
            }))
            .unwrap()
        );
    } else {
        println!(
            "[benchmark] {} iteration(s), {} pages touched, {:.2} ms total, {:.1} MB/s avg",
            reports.len(),
            total_touched,
            total_ms,
            avg_throughput
        );
    }
    Ok(())
}

fn cmd_simulate(bin: &PathBuf, csv: &PathBuf, json: bool) -> bigcache_core::Result<()> {
    let loader = Loader::load(bin)?;
    let file = std::fs::File::open(csv).map_err(|e| bigcache_core::Error::io(csv, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let mut rows = 0u64;
    for record in reader.records().flatten() {
        if record.len() < 3 {
            continue;
        }
        let path = record.get(1).unwrap_or_default();
        let offset: u64 = match record.get(2).unwrap_or_default().trim().parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if path.is_empty() {
            continue;
        }
        let _ = loader.lookup(path, offset);
        rows += 1;
    }

    let (hits, misses) = loader.stats();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "rows_replayed": rows,
                "hits": hits,
                "misses": misses,
            }))
            .unwrap()
        );
    } else {
        println!(
            "[simulate] replayed {} rows against {}: {} hits, {} misses",
            rows,
            bin.display(),
            hits,
            misses
        );
    }
    Ok(())
}
