mod checkpoint;
mod checkpoint_uring;
mod controller;
mod counter;
mod cullen_woodall;
mod family;
mod kbn;
mod primes;
mod registry;
mod worker;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::checkpoint::FactorLog;
use crate::controller::{SieveConfig, SieveController};
use crate::counter::SyncedCounter;
use crate::family::{FamilyOptions, SequenceFamily};

#[derive(Parser)]
#[command(name = "tdsieve")]
#[command(about = "Trial-division sieve for integer sequence candidates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SieveArgs {
    #[arg(
        short = 'p',
        long,
        default_value = "1",
        help = "Sieve primes greater than this bound"
    )]
    min_prime: u64,
    #[arg(
        short = 'P',
        long,
        help = "Sieve primes up to and including this bound"
    )]
    max_prime: u64,
    #[arg(short = 't', long, help = "Worker threads (default: CPU count)")]
    threads: Option<usize>,
    #[arg(
        short = 'w',
        long,
        default_value = "10000",
        help = "Primes per bulk work chunk"
    )]
    work_size: usize,
    #[arg(
        long,
        default_value = "10000",
        help = "Dispatch one chunk at a time while primes are below this bound (0 disables)"
    )]
    serial_below: u64,
    #[arg(
        long,
        default_value = "60",
        help = "Seconds between periodic checkpoints (0 disables them)"
    )]
    checkpoint_seconds: u64,
    #[arg(
        short = 'o',
        long,
        default_value = "terms.txt",
        help = "Checkpoint file of surviving terms"
    )]
    terms_file: PathBuf,
    #[arg(
        short = 'f',
        long,
        default_value = "factors.txt",
        help = "Append discovered factors to this file"
    )]
    factors_file: PathBuf,
    #[arg(short = 'i', long, help = "Resume from a previous checkpoint file")]
    resume: Option<PathBuf>,
    #[arg(long, help = "Replay a factor file before sieving starts")]
    known_factors: Option<PathBuf>,
    #[arg(long, help = "Write large checkpoints through io_uring")]
    uring: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sieve k*b^n+c candidates by trial division")]
    Kbn {
        #[arg(long, help = "Multiplier k")]
        k: u64,
        #[arg(long, default_value = "2", help = "Base b")]
        b: u64,
        #[arg(
            long,
            default_value = "1",
            allow_hyphen_values = true,
            help = "Offset c (may be negative)"
        )]
        c: i64,
        #[arg(long, help = "Smallest exponent to sieve")]
        nmin: u64,
        #[arg(long, help = "Largest exponent to sieve")]
        nmax: u64,
        #[arg(
            long,
            default_value = "65536",
            help = "Feed primes below this bound to the vectorized path in groups of 4 (0 disables)"
        )]
        vector_below: u64,
        #[command(flatten)]
        sieve: SieveArgs,
    },
    #[command(about = "Sieve Cullen (n*2^n+1) and Woodall (n*2^n-1) candidates")]
    CullenWoodall {
        #[arg(long, help = "Smallest n to sieve")]
        nmin: u64,
        #[arg(long, help = "Largest n to sieve")]
        nmax: u64,
        #[arg(long, help = "Sieve only Cullen numbers")]
        cullen: bool,
        #[arg(long, help = "Sieve only Woodall numbers")]
        woodall: bool,
        #[command(flatten)]
        sieve: SieveArgs,
    },
}

fn main() {
    let cli = Cli::parse();
    let start = Instant::now();

    let (options, sieve) = match cli.command {
        Commands::Kbn {
            k,
            b,
            c,
            nmin,
            nmax,
            vector_below,
            sieve,
        } => (
            FamilyOptions::Kbn {
                k,
                b,
                c,
                n_min: nmin,
                n_max: nmax,
                vector_below,
            },
            sieve,
        ),
        Commands::CullenWoodall {
            nmin,
            nmax,
            cullen,
            woodall,
            sieve,
        } => (
            FamilyOptions::CullenWoodall {
                n_min: nmin,
                n_max: nmax,
                cullen,
                woodall,
            },
            sieve,
        ),
    };

    let family = family::create(options);
    run_sieve(family, sieve, start);
}

fn run_sieve(family: Arc<dyn SequenceFamily>, args: SieveArgs, start: Instant) {
    // A resumed run starts from the checkpoint's survivor list and skips
    // everything at or below its watermark
    let (registry, min_prime) = match &args.resume {
        Some(path) => {
            let (watermark, survivors) = match checkpoint::read_checkpoint(path, family.as_ref())
            {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("Error: could not read checkpoint {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            };
            println!(
                "Resuming {}: sieved to {}, {} terms remain",
                family.form(),
                watermark,
                survivors.len()
            );
            (
                family.create_registry(Some(&survivors)),
                watermark.max(args.min_prime),
            )
        }
        None => (family.create_registry(None), args.min_prime),
    };

    if let Some(path) = &args.known_factors {
        let pairs = match checkpoint::read_factor_file(path) {
            Ok(pairs) => pairs,
            Err(e) => {
                eprintln!("Error: could not read factor file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        };
        let mut applied = 0_u64;
        for (prime, term) in &pairs {
            if let Some(key) = family.parse_candidate(term) {
                if registry.apply_factor(*prime, key) {
                    applied += 1;
                }
            }
        }
        println!("Applied {} known factors from {}", applied, path.display());
    }

    let threads = args.threads.unwrap_or_else(|| {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    });

    println!(
        "Sieving {} with {} threads, p in ({}, {}]",
        family.form(),
        threads,
        min_prime,
        args.max_prime
    );

    let factors = match FactorLog::open(&args.factors_file) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            eprintln!(
                "Error: could not open factor file {}: {}",
                args.factors_file.display(),
                e
            );
            std::process::exit(1);
        }
    };

    let config = SieveConfig {
        min_prime,
        max_prime: args.max_prime,
        cpu_threads: threads,
        cpu_work_size: args.work_size,
        serial_below: args.serial_below,
        checkpoint_seconds: args.checkpoint_seconds,
        checkpoint_path: args.terms_file.clone(),
        use_uring: args.uring,
    };

    // Interrupt flag, observed between slices. The CLI does no signal
    // wiring, so a command-line run always sieves to completion; a caller
    // driving the controller directly can hold a clone and set it.
    let interrupted = Arc::new(SyncedCounter::new(0));

    let mut controller = SieveController::new(
        config,
        Arc::clone(&family),
        Arc::clone(&registry),
        factors,
        interrupted,
    );
    controller.create_workers(min_prime);
    let summary = controller.run();

    println!(
        "\n{} primes tested, {} factors found, {} terms remain",
        summary.primes_tested, summary.factors_found, summary.live_candidates
    );
    if summary.largest_prime > 0 {
        println!("Largest prime tested: {}", summary.largest_prime);
    }
    println!("Worker CPU time: {}us", summary.cpu_micros);

    let duration_us = start.elapsed().as_micros();
    println!(
        "Execution time: {}us ({:.2}ms)",
        duration_us,
        duration_us as f64 / 1000.0
    );

    if let Err(e) = checkpoint::log_run(
        family.name(),
        &format!("p in ({}, {}]", min_prime, args.max_prime),
        duration_us,
        summary.factors_found,
    ) {
        eprintln!("Warning: Failed to log run: {}", e);
    }
}
