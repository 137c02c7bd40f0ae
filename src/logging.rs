//! Logging Sink
//!
//! Subscriber setup plus the renderers used for per-chunk traffic dumps.
//! Every dump is emitted as a single event so lines from concurrent sessions
//! never interleave inside one dump.

use std::fmt::Write as _;

use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::relay::Direction;
use crate::Result;

/// Bytes rendered per hex dump row
const HEX_ROW_WIDTH: usize = 16;

/// Initialize tracing/logging.
///
/// `RUST_LOG` takes precedence over `level`. `color` switches ANSI output on
/// for both the subscriber and the direction tags.
pub fn init_tracing(level: &str, color: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    colored::control::set_override(color);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_level(true)
                .with_ansi(color),
        )
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Resolve the effective log level from the verbosity switches
pub fn level_for(base: &str, verbose: bool, very_verbose: bool) -> String {
    if very_verbose {
        "trace".to_string()
    } else if verbose {
        "debug".to_string()
    } else {
        base.to_string()
    }
}

/// Direction marker, `>>>` for client to remote and `<<<` for the reverse
pub fn direction_tag(direction: Direction, color: bool) -> String {
    let tag = direction.arrow();
    if !color {
        return tag.to_string();
    }
    match direction {
        Direction::ClientToRemote => tag.green().bold().to_string(),
        Direction::RemoteToClient => tag.blue().bold().to_string(),
    }
}

/// Render a chunk as `offset  hex bytes  |ascii|` rows
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);

    for (row, chunk) in bytes.chunks(HEX_ROW_WIDTH).enumerate() {
        if row > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:08x} ", row * HEX_ROW_WIDTH);

        for i in 0..HEX_ROW_WIDTH {
            if i == HEX_ROW_WIDTH / 2 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }

        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('|');
    }

    out
}

/// Header line preceding a traffic dump
pub fn dump_header(direction: Direction, len: usize, color: bool) -> String {
    format!(
        "{} {} bytes {}",
        direction_tag(direction, color),
        len,
        direction.verb()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_single_row() {
        let dump = hex_dump(b"GET / HTTP/1.1\r\n");
        assert_eq!(
            dump,
            "00000000  47 45 54 20 2f 20 48 54  54 50 2f 31 2e 31 0d 0a  |GET / HTTP/1.1..|"
        );
    }

    #[test]
    fn test_hex_dump_partial_row_is_padded() {
        let dump = hex_dump(&[0x00, 0x41, 0xff]);
        assert_eq!(
            dump,
            "00000000  00 41 ff                                          |.A.|"
        );
    }

    #[test]
    fn test_hex_dump_multiple_rows() {
        let data: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("00000010  10 11 12 13"));
    }

    #[test]
    fn test_hex_dump_empty() {
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_direction_tag_plain() {
        assert_eq!(direction_tag(Direction::ClientToRemote, false), ">>>");
        assert_eq!(direction_tag(Direction::RemoteToClient, false), "<<<");
        assert_eq!(
            dump_header(Direction::RemoteToClient, 12, false),
            "<<< 12 bytes received"
        );
    }

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for("info", false, false), "info");
        assert_eq!(level_for("info", true, false), "debug");
        assert_eq!(level_for("info", true, true), "trace");
    }
}
