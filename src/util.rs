use chrono::{DateTime, Local, TimeZone, Timelike};
use once_cell::sync::OnceCell;
use std::io::Write;

/// Idempotent: binaries and tests may all race to call this.
pub fn init_logger() {
    static INSTANCE: OnceCell<()> = OnceCell::new();
    INSTANCE.get_or_init(|| {
        let env = env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
        env_logger::Builder::from_env(env)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} {} - {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    buf.default_styled_level(record.level()),
                    &record.args()
                )
            })
            .init();
        log::info!("env_logger initialized.");
    });
}

/// Local midnight of the given instant.
pub fn midnight_of(t: DateTime<Local>) -> DateTime<Local> {
    t.date().and_hms(0, 0, 0)
}

/// 100-microsecond ticks since local midnight, the header's wire time.
pub fn time100us_now() -> u32 {
    let now = Local::now();
    let since = now.signed_duration_since(midnight_of(now));
    (since.num_microseconds().unwrap_or(0) / 100) as u32
}

/// Wall clock in unix nanoseconds.
pub fn unix_ns_now() -> u64 {
    let now = Local::now();
    now.timestamp() as u64 * 1_000_000_000 + now.nanosecond() as u64
}

pub fn local_from_unix_ns(ns: u64) -> DateTime<Local> {
    Local.timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
}

pub fn bytes_hex_format(bytes: &[u8]) -> String {
    const COLUMN: usize = 16;
    let mut text = String::new();
    for row in bytes.chunks(COLUMN) {
        for (i, b) in row.iter().enumerate() {
            text += &format!("{:02X} ", b);
            if i % 8 == 7 {
                text.push(' ');
            }
        }
        for _ in row.len()..COLUMN {
            text += "   ";
        }
        if row.len() <= 8 {
            text.push(' ');
        }
        text.push(' ');
        for b in row {
            text.push(if b.is_ascii_graphic() { *b as char } else { '.' });
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_format_rows() {
        let dump = bytes_hex_format(b"IBM 185.32 update record!");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("49 42 4D 20"));
        assert!(lines[0].ends_with("IBM.185.32.updat"));
    }

    #[test]
    fn midnight_is_start_of_day() {
        let m = midnight_of(Local::now());
        assert_eq!((m.hour(), m.minute(), m.second()), (0, 0, 0));
    }
}
