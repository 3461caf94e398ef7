use std::process::exit;
use std::time::Duration;

use clap::{crate_version, Parser};

use tickwire::lvc::{Lvc, LvcData};
use tickwire::util;

/// Snap a last-value cache: every record, or a (service, ticker)
/// subset, with optional field filtering.
#[derive(Parser, Debug)]
#[clap(name = "cache-dump", version = crate_version!())]
struct Opts {
    /// Print the default configuration and exit
    #[clap(long)]
    config: bool,
    /// LVC file
    #[clap(short = 'd', long = "db")]
    db: Option<String>,
    /// Service filter
    #[clap(short = 's', long = "service")]
    service: Option<String>,
    /// Tickers, CSV or "*"
    #[clap(short = 't', long = "tickers", default_value = "*")]
    tickers: String,
    /// Field ids to show, CSV
    #[clap(short = 'f', long = "fids")]
    fids: Option<String>,
    /// Lock wait bound in milliseconds (default: wait forever)
    #[clap(long = "wait")]
    wait_ms: Option<u64>,
}

fn main() {
    util::init_logger();
    let opts: Opts = Opts::parse();
    if opts.config {
        println!("cache-dump defaults:");
        println!("  db       <required>");
        println!("  service  *");
        println!("  tickers  *");
        println!("  fids     all");
        println!("  wait     infinite");
        exit(0);
    }
    let db = match &opts.db {
        Some(db) => db.clone(),
        None => {
            eprintln!("cache-dump: -d/--db <path> is required");
            exit(1);
        }
    };
    match run(&opts, &db) {
        Ok(n) => {
            log::info!("[cache-dump] {} records", n);
            exit(0);
        }
        Err(e) => {
            log::error!("[cache-dump] {}", e);
            exit(2);
        }
    }
}

fn show(data: &LvcData) {
    let age = format!("{}.{:06}", data.t_upd, data.t_upd_us);
    println!(
        "{:<12} {:<20} {} upds={} t_upd={}{}",
        data.svc,
        data.tkr,
        if data.active { "ACTIVE" } else { "dead" },
        data.n_upd,
        age,
        if data.t_dead > data.t_upd { " (dropped)" } else { "" },
    );
    for f in &data.fields {
        let name = f.name.as_deref().unwrap_or("");
        println!("    {:>6} {:<16} {}", f.fid, name, f.value);
    }
}

fn run(opts: &Opts, db: &str) -> anyhow::Result<usize> {
    let mut lvc = Lvc::open(db)?;
    println!(
        "{}: {} records, {} schema fields, services=[{}]",
        db,
        lvc.len(),
        lvc.schema().len(),
        lvc.services().join(";"),
    );
    if let Some(csv) = &opts.fids {
        lvc.set_filter(csv);
    }
    if let Some(ms) = opts.wait_ms {
        lvc.set_wait(Some(Duration::from_millis(ms)));
    }

    let mut shown = 0usize;
    if opts.tickers == "*" {
        for data in lvc.snap_all()? {
            if let Some(svc) = &opts.service {
                if svc != &data.svc {
                    continue;
                }
            }
            show(&data);
            shown += 1;
        }
    } else {
        let svc = match &opts.service {
            Some(svc) => svc.clone(),
            None => {
                eprintln!("cache-dump: -s <service> is required with explicit tickers");
                exit(1);
            }
        };
        for tkr in opts.tickers.split(',').map(|t| t.trim()) {
            match lvc.snap(&svc, tkr)? {
                Some(data) => {
                    show(&data);
                    shown += 1;
                }
                None => println!("{:<12} {:<20} <not found>", svc, tkr),
            }
        }
    }
    Ok(shown)
}
