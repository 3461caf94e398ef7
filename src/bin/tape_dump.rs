use std::collections::{HashMap, HashSet};
use std::process::exit;

use clap::{crate_version, Parser};

use tickwire::codec::lists::ListPayload;
use tickwire::codec::{Codec, MsgBody};
use tickwire::error::TapeError;
use tickwire::tape::TapeReader;
use tickwire::util;

/// Dump a recorder tape: header, stream table, then every message in
/// the requested window.
#[derive(Parser, Debug)]
#[clap(name = "tape-dump", version = crate_version!())]
struct Opts {
    /// Print the default configuration and exit
    #[clap(long)]
    config: bool,
    /// Tape file
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
    /// Seek to HH:MM:SS[.mmm] local before dumping
    #[clap(long = "start")]
    start: Option<String>,
}

fn main() {
    util::init_logger();
    let opts: Opts = Opts::parse();
    if opts.config {
        println!("tape-dump defaults:");
        println!("  db       <required>");
        println!("  service  *");
        println!("  tickers  *");
        println!("  fids     all");
        println!("  start    tape head");
        exit(0);
    }
    let db = match &opts.db {
        Some(db) => db.clone(),
        None => {
            eprintln!("tape-dump: -d/--db <path> is required");
            exit(1);
        }
    };
    match run(&opts, &db) {
        Ok(n) => {
            log::info!("[tape-dump] {} messages", n);
            exit(0);
        }
        Err(e) => {
            log::error!("[tape-dump] {}", e);
            exit(2);
        }
    }
}

fn run(opts: &Opts, db: &str) -> anyhow::Result<u64> {
    let mut rdr = TapeReader::open(db)?;
    let hdr = rdr.header();
    println!(
        "{} version={} msgs={} bytes={} endian={} word={}",
        hdr.signature(),
        hdr.version(),
        hdr.n_msg(),
        hdr.n_byte(),
        if hdr.is_big_endian() { "big" } else { "little" },
        hdr.word_siz(),
    );
    let mut names: HashMap<u32, (String, String)> = HashMap::new();
    for q in rdr.query() {
        println!(
            "  stream {:>4}  {:<12} {:<20} {:>10} msgs {:>12} bytes",
            q.db_idx, q.svc, q.tkr, q.n_msg, q.n_byte
        );
        names.insert(q.db_idx as u32, (q.svc.clone(), q.tkr.clone()));
    }

    let tkrs: Option<HashSet<String>> = if opts.tickers == "*" {
        None
    } else {
        Some(opts.tickers.split(',').map(|t| t.trim().to_string()).collect())
    };
    let fids: Option<HashSet<i32>> = opts.fids.as_ref().map(|csv| {
        csv.split(',')
            .filter_map(|t| t.trim().parse().ok())
            .collect()
    });

    if let Some(start) = &opts.start {
        let t_ns = tickwire::tape::day_time_ns(start)?;
        if rdr.rewind_to(t_ns) == 0 {
            log::warn!("[tape-dump] start {} past end of tape", start);
            return Ok(0);
        }
    }

    let codec = Codec::new(true);
    let mut shown = 0u64;
    loop {
        let (stream_id, t_ns, body) = match rdr.read() {
            Ok(msg) => {
                // list-protocol payloads are self-describing
                let body = match ListPayload::decode(msg.wire_proto, msg.data) {
                    Ok(Some(list)) => Ok(MsgBody::Text(list.dump())),
                    _ => codec.decode(msg.data).map(|m| m.body),
                };
                (msg.stream_id, msg.t_ns, body)
            }
            Err(TapeError::EndOfTape) => break,
            Err(e) => return Err(e.into()),
        };
        let (svc, tkr) = match names.get(&stream_id) {
            Some((s, t)) => (s.as_str(), t.as_str()),
            None => ("?", "?"),
        };
        if let Some(want) = &opts.service {
            if want != svc {
                continue;
            }
        }
        if let Some(want) = &tkrs {
            if !want.contains(tkr) {
                continue;
            }
        }
        let when = util::local_from_unix_ns(t_ns).format("%H:%M:%S%.3f");
        match body {
            Ok(MsgBody::Fields(fields)) => {
                let cells: Vec<String> = fields
                    .iter()
                    .filter(|f| fids.as_ref().map(|w| w.contains(&f.fid)).unwrap_or(true))
                    .map(|f| format!("{}={}", f.fid, f.value))
                    .collect();
                println!("{} {:<12} {:<20} {}", when, svc, tkr, cells.join(" "));
            }
            Ok(MsgBody::Text(text)) => println!("{} {:<12} {:<20} {}", when, svc, tkr, text),
            Ok(other) => println!("{} {:<12} {:<20} {:?}", when, svc, tkr, other),
            Err(e) => println!("{} {:<12} {:<20} <undecodable: {}>", when, svc, tkr, e),
        }
        shown += 1;
    }
    Ok(shown)
}
